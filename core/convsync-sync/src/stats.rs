//! Sync statistics and cycle summaries.

use crate::error::{ErrorKind, SyncError};
use crate::model::ConversationRecord;
use convsync_types::{ConversationId, MachineId, Timestamp};
use serde::Serialize;
use std::collections::BTreeSet;

/// How far the local and remote conversation sets overlap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStats {
    /// Conversations present on both sides.
    pub synced: usize,
    pub local_only: usize,
    pub remote_only: usize,
    pub local_total: usize,
    pub remote_total: usize,
    /// Share of local conversations that are synced, 0-100.
    pub local_percent: f64,
    /// Share of remote conversations that are synced, 0-100.
    pub remote_percent: f64,
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 100.0;
    }
    part as f64 * 100.0 / whole as f64
}

/// Compares conversation id sets. An empty side is fully synced.
pub fn sync_stats<'a>(
    local: impl IntoIterator<Item = &'a ConversationId>,
    remote: impl IntoIterator<Item = &'a ConversationId>,
) -> SyncStats {
    let local: BTreeSet<_> = local.into_iter().collect();
    let remote: BTreeSet<_> = remote.into_iter().collect();
    let synced = local.intersection(&remote).count();

    SyncStats {
        synced,
        local_only: local.len() - synced,
        remote_only: remote.len() - synced,
        local_total: local.len(),
        remote_total: remote.len(),
        local_percent: percent(synced, local.len()),
        remote_percent: percent(synced, remote.len()),
    }
}

/// Bytes attributed to one machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MachineTotals {
    /// Size of conversations this machine created.
    pub uploaded_bytes: u64,
    pub uploaded_conversations: usize,
    /// Size of conversations other machines created.
    pub downloaded_bytes: u64,
    pub downloaded_conversations: usize,
}

/// Splits conversation sizes by creator: what `machine` created counts as
/// uploaded by it, everything else as downloaded.
pub fn machine_transfer_totals<'a>(
    machine: MachineId,
    conversations: impl IntoIterator<Item = &'a ConversationRecord>,
) -> MachineTotals {
    let mut totals = MachineTotals::default();
    for record in conversations {
        let size = record.total_size();
        if record.created_by == machine {
            totals.uploaded_bytes += size;
            totals.uploaded_conversations += 1;
        } else {
            totals.downloaded_bytes += size;
            totals.downloaded_conversations += 1;
        }
    }
    totals
}

/// A conversation whose plan was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationFailure {
    pub conversation: ConversationId,
    pub kind: ErrorKind,
    pub message: String,
}

impl ConversationFailure {
    pub fn new(conversation: ConversationId, error: &SyncError) -> Self {
        Self {
            conversation,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    /// Conversations whose plan completed.
    pub succeeded: usize,
    /// Conversations whose plan was aborted by an error.
    pub failed: usize,
    pub conflicts_pending: usize,
    pub uploaded_files: u64,
    pub downloaded_files: u64,
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub deleted_local: u64,
    pub deleted_remote: u64,
    /// Operations skipped because the file changed mid-cycle or quota ran out.
    pub skipped: u64,
    pub cancelled: bool,
    pub failures: Vec<ConversationFailure>,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl SyncSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled && self.conflicts_pending == 0
    }

    pub fn record_failure(&mut self, conversation: ConversationId, error: &SyncError) {
        self.failed += 1;
        self.failures.push(ConversationFailure::new(conversation, error));
    }
}
