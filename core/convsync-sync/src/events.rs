//! Progress events for the UI layer.
//!
//! A `SyncSession` carries the sending half of an unbounded channel; whoever
//! renders progress holds the receiver. Events are fire-and-forget: a closed
//! or absent receiver never affects the sync.

use crate::error::ErrorKind;
use crate::stats::SyncSummary;
use convsync_types::{ConversationId, Timestamp};
use tokio::sync::mpsc;

/// Direction of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// One file transfer in flight. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTransfer {
    pub conversation_id: ConversationId,
    pub path: String,
    pub direction: TransferDirection,
    pub started_at: Timestamp,
    pub bytes_total: u64,
    pub bytes_done: u64,
}

impl ActiveTransfer {
    /// Completed fraction in `[0, 1]`; an empty file counts as done once finished.
    pub fn progress(&self) -> f64 {
        if self.bytes_total == 0 {
            return if self.bytes_done == 0 { 0.0 } else { 1.0 };
        }
        (self.bytes_done as f64 / self.bytes_total as f64).min(1.0)
    }
}

/// Something the UI may want to show.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    CycleStarted {
        force: bool,
        started_at: Timestamp,
    },
    Planned {
        upload_files: usize,
        download_files: usize,
        upload_bytes: u64,
        download_bytes: u64,
        divergences: usize,
    },
    TransferStarted(ActiveTransfer),
    TransferFinished {
        transfer: ActiveTransfer,
        succeeded: bool,
    },
    ConflictDetected {
        original: ConversationId,
        copy: ConversationId,
        paths: Vec<String>,
    },
    ConflictResolved {
        original: ConversationId,
        keep_local: bool,
    },
    CycleFinished(SyncSummary),
    CycleFailed {
        kind: ErrorKind,
        message: String,
    },
}

/// Event sink for one engine.
#[derive(Debug, Clone, Default)]
pub struct SyncSession {
    tx: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl SyncSession {
    /// Creates a session and the receiver its events arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A session whose events go nowhere.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is watching.
            let _ = tx.send(event);
        }
    }
}
