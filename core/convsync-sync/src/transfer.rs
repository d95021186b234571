//! Transfer orchestration.
//!
//! Conversations run concurrently, each executing its planned operations in
//! order; a shared semaphore bounds how many file operations are in flight
//! across all of them. Results stream to the engine as `TransferUpdate`s so
//! it can checkpoint while transfers are still running.

use crate::config::RetryPolicy;
use crate::error::{SyncError, SyncResult};
use crate::events::{ActiveTransfer, SyncEvent, SyncSession, TransferDirection};
use crate::local::LocalStore;
use crate::model::FileEntry;
use crate::planner::{ConversationPlan, OpKind, PlannedOp, SyncPlan};
use crate::remote::{blob_key, BlobStore};
use convsync_crypto::{content_hash, BlobCodec};
use convsync_types::{ContentHash, ConversationId, Timestamp};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Cooperative cancellation shared by everything in a cycle.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Runs `op`, retrying transient failures with exponential backoff.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    what: &str,
    mut op: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut failed = 0u32;
    loop {
        match op().await {
            Err(e) if e.is_transient() && failed + 1 < policy.max_attempts => {
                failed += 1;
                let delay = policy.delay_for(failed);
                debug!("{what} failed ({e}), retry {failed} in {delay:?}");
                tokio::time::sleep(delay).await;
                cancel.check()?;
            }
            other => return other,
        }
    }
}

/// What the orchestrator needs to move one file.
pub struct TransferContext {
    pub store: Arc<dyn BlobStore>,
    pub codec: Arc<dyn BlobCodec>,
    pub local: LocalStore,
    pub retry: RetryPolicy,
    pub cancel: CancelFlag,
    pub session: SyncSession,
}

impl TransferContext {
    /// Encrypts on a blocking thread.
    pub async fn seal(&self, plaintext: Vec<u8>) -> SyncResult<Vec<u8>> {
        let codec = self.codec.clone();
        Ok(tokio::task::spawn_blocking(move || codec.seal(&plaintext)).await??)
    }

    /// Decrypts on a blocking thread, returning the plaintext and its hash.
    pub async fn open(&self, envelope: Vec<u8>) -> SyncResult<(Vec<u8>, ContentHash)> {
        let codec = self.codec.clone();
        let opened = tokio::task::spawn_blocking(move || {
            codec.open(&envelope).map(|plain| {
                let hash = content_hash(&plain);
                (plain, hash)
            })
        })
        .await??;
        Ok(opened)
    }

    /// Seals and writes a blob, retrying transient failures.
    pub async fn store_blob(&self, key: &str, plaintext: Vec<u8>) -> SyncResult<()> {
        let sealed = self.seal(plaintext).await?;
        retry_transient(&self.retry, &self.cancel, key, || {
            self.store.put(key, sealed.clone())
        })
        .await
    }

    /// Reads, decrypts and verifies a blob against `expected`.
    ///
    /// A hash mismatch is retried once before failing with
    /// `CorruptedTransfer`.
    pub async fn fetch_verified(&self, key: &str, expected: &ContentHash) -> SyncResult<Vec<u8>> {
        let mut retried = false;
        loop {
            let envelope =
                retry_transient(&self.retry, &self.cancel, key, || self.store.get(key)).await?;
            let (plaintext, actual) = self.open(envelope).await?;
            if &actual == expected {
                return Ok(plaintext);
            }
            if retried {
                return Err(SyncError::CorruptedTransfer {
                    key: key.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
            warn!("Hash mismatch reading {key}, retrying once");
            retried = true;
        }
    }
}

/// Result of a single operation that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Uploaded(FileEntry),
    Downloaded(FileEntry),
    DeletedLocal,
    DeletedRemote,
    /// Not performed; the reason is for logs.
    Skipped(&'static str),
}

/// Streamed from the orchestrator to the engine.
#[derive(Debug)]
pub enum TransferUpdate {
    /// An operation finished without error.
    Op { op: PlannedOp, outcome: OpOutcome },
    /// All of a conversation's operations have run (or it was aborted).
    ConversationDone(ConversationId),
}

/// How one conversation's plan went.
#[derive(Debug)]
pub struct ConversationReport {
    pub conversation: ConversationId,
    pub completed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    /// The error that aborted the plan, if any.
    pub failure: Option<SyncError>,
}

impl ConversationReport {
    fn new(conversation: ConversationId) -> Self {
        Self {
            conversation,
            completed: 0,
            skipped: 0,
            cancelled: false,
            failure: None,
        }
    }
}

/// Executes a `SyncPlan` with bounded parallelism.
pub struct TransferOrchestrator {
    ctx: Arc<TransferContext>,
    permits: Arc<Semaphore>,
    quota_exhausted: Arc<AtomicBool>,
}

impl TransferOrchestrator {
    pub fn new(ctx: Arc<TransferContext>, max_concurrent: usize) -> Self {
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            quota_exhausted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True once an upload hit the store's quota this run.
    pub fn quota_exhausted(&self) -> bool {
        self.quota_exhausted.load(Ordering::SeqCst)
    }

    /// Runs every conversation plan, sending per-op results on `updates`.
    /// Returns one report per conversation, ordered by id.
    pub async fn run(
        &self,
        plan: SyncPlan,
        updates: mpsc::UnboundedSender<TransferUpdate>,
    ) -> Vec<ConversationReport> {
        info!(
            "Transferring: {} up ({} bytes), {} down ({} bytes) across {} conversations",
            plan.upload_files,
            plan.upload_bytes,
            plan.download_files,
            plan.download_bytes,
            plan.conversations.len()
        );

        let mut tasks = JoinSet::new();
        for conversation in plan.conversations {
            if conversation.ops.is_empty() {
                continue;
            }
            let ctx = self.ctx.clone();
            let permits = self.permits.clone();
            let quota = self.quota_exhausted.clone();
            let updates = updates.clone();
            tasks.spawn(run_conversation(ctx, permits, quota, conversation, updates));
        }
        drop(updates);

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Transfer task failed: {e}"),
            }
        }
        reports.sort_by(|a, b| a.conversation.cmp(&b.conversation));
        reports
    }
}

async fn run_conversation(
    ctx: Arc<TransferContext>,
    permits: Arc<Semaphore>,
    quota_exhausted: Arc<AtomicBool>,
    plan: ConversationPlan,
    updates: mpsc::UnboundedSender<TransferUpdate>,
) -> ConversationReport {
    let mut report = ConversationReport::new(plan.conversation.clone());

    for op in plan.ops {
        if ctx.cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        if op.kind == OpKind::Upload && quota_exhausted.load(Ordering::SeqCst) {
            report.skipped += 1;
            let _ = updates.send(TransferUpdate::Op {
                op,
                outcome: OpOutcome::Skipped("remote quota exhausted"),
            });
            continue;
        }

        let Ok(_permit) = permits.acquire().await else {
            break;
        };
        // Cancellation may have arrived while queued for a permit.
        if ctx.cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let transfer = direction_of(op.kind).map(|direction| ActiveTransfer {
            conversation_id: op.conversation.clone(),
            path: op.path.clone(),
            direction,
            started_at: Timestamp::now(),
            bytes_total: op.size,
            bytes_done: 0,
        });
        if let Some(t) = &transfer {
            ctx.session.emit(SyncEvent::TransferStarted(t.clone()));
        }

        let result = execute(&ctx, &op).await;

        if let Some(mut t) = transfer {
            let succeeded = matches!(
                result,
                Ok(OpOutcome::Uploaded(_)) | Ok(OpOutcome::Downloaded(_))
            );
            if succeeded {
                t.bytes_done = t.bytes_total;
            }
            ctx.session.emit(SyncEvent::TransferFinished {
                transfer: t,
                succeeded,
            });
        }

        match result {
            Ok(OpOutcome::Skipped(reason)) => {
                debug!("Skipped {} {}/{}: {reason}", kind_name(op.kind), op.conversation, op.path);
                report.skipped += 1;
                let _ = updates.send(TransferUpdate::Op {
                    op,
                    outcome: OpOutcome::Skipped(reason),
                });
            }
            Ok(outcome) => {
                report.completed += 1;
                let _ = updates.send(TransferUpdate::Op { op, outcome });
            }
            Err(SyncError::Cancelled) => {
                report.cancelled = true;
                break;
            }
            Err(SyncError::QuotaExceeded(msg)) => {
                warn!("Remote quota exhausted, holding remaining uploads: {msg}");
                quota_exhausted.store(true, Ordering::SeqCst);
                report.skipped += 1;
                let _ = updates.send(TransferUpdate::Op {
                    op,
                    outcome: OpOutcome::Skipped("remote quota exhausted"),
                });
            }
            Err(e) => {
                warn!(
                    "{} {}/{} failed, aborting conversation: {e}",
                    kind_name(op.kind),
                    op.conversation,
                    op.path
                );
                report.failure = Some(e);
                break;
            }
        }
    }

    let _ = updates.send(TransferUpdate::ConversationDone(report.conversation.clone()));
    report
}

fn direction_of(kind: OpKind) -> Option<TransferDirection> {
    match kind {
        OpKind::Upload => Some(TransferDirection::Upload),
        OpKind::Download => Some(TransferDirection::Download),
        OpKind::DeleteLocal | OpKind::DeleteRemote => None,
    }
}

fn kind_name(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Upload => "upload",
        OpKind::Download => "download",
        OpKind::DeleteLocal => "local delete",
        OpKind::DeleteRemote => "remote delete",
    }
}

/// Performs one operation. Re-checks the local file before touching it, so a
/// file edited after the scan is never overwritten or uploaded stale.
///
/// A remote delete only drops the path from the manifest; its blob is removed
/// by the engine once a manifest write no longer references it.
pub async fn execute(ctx: &TransferContext, op: &PlannedOp) -> SyncResult<OpOutcome> {
    ctx.cancel.check()?;
    let key = blob_key(&op.conversation, &op.path, &op.hash);

    match op.kind {
        OpKind::Upload => {
            let bytes = match ctx.local.read_file(&op.conversation, &op.path).await {
                Ok(bytes) => bytes,
                Err(SyncError::NotFound(_)) => return Ok(OpOutcome::Skipped("file vanished")),
                Err(e) => return Err(e),
            };
            let hash = content_hash(&bytes);
            if hash != op.hash {
                return Ok(OpOutcome::Skipped("file changed since scan"));
            }
            let size = bytes.len() as u64;
            ctx.store_blob(&key, bytes).await?;
            Ok(OpOutcome::Uploaded(FileEntry::new(hash, size)))
        }
        OpKind::Download => {
            let plaintext = ctx.fetch_verified(&key, &op.hash).await?;
            ctx.cancel.check()?;
            let current = ctx.local.hash_file(&op.conversation, &op.path).await?;
            if current.map(|c| c.hash) != op.local_hash {
                return Ok(OpOutcome::Skipped("local file changed since scan"));
            }
            let written = ctx
                .local
                .write_file(&op.conversation, &op.path, &plaintext)
                .await?;
            Ok(OpOutcome::Downloaded(
                FileEntry::new(op.hash.clone(), written.size).with_modified(written.modified),
            ))
        }
        OpKind::DeleteLocal => {
            let current = ctx.local.hash_file(&op.conversation, &op.path).await?;
            if current.map(|c| c.hash) != op.local_hash {
                return Ok(OpOutcome::Skipped("local file changed since scan"));
            }
            ctx.local.delete_file(&op.conversation, &op.path).await?;
            Ok(OpOutcome::DeletedLocal)
        }
        OpKind::DeleteRemote => Ok(OpOutcome::DeletedRemote),
    }
}
