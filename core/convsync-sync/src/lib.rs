//! Encrypted, differential sync of conversation folders across machines.
//!
//! Each machine keeps conversations as directories of files under a local
//! root. A passive blob store holds one encrypted blob per file plus an
//! encrypted manifest listing every conversation's file hashes.
//!
//! ## Components
//!
//! - **Local**: scans conversation directories, caches hashes by `(mtime, size)`
//! - **Model / Merge**: the manifest and its file-granular three-way merge
//! - **Reconcile / Planner**: three-way diff against the last agreed state and
//!   ordered per-conversation work
//! - **Conflict**: materializes divergent remote versions as local copies
//! - **Transfer**: bounded-parallel upload and download with retry
//! - **Engine**: drives cycles, checkpoints progress, rotates keys
//!
//! ## Sync Cycle
//!
//! 1. **Scan**: rehash local files whose `(mtime, size)` changed
//! 2. **Fetch**: read and decrypt the remote manifest
//! 3. **Reconcile**: compare local, remote and the last agreed state per file
//! 4. **Conflicts**: save divergent remote versions beside the original
//! 5. **Transfer**: run the plan, checkpointing after each conversation
//! 6. **Publish**: merge and write the manifest, record the machine's sync
//!
//! # Example
//!
//! ```no_run
//! use convsync_sync::{MemorySecretStore, FsBlobStore, SyncConfig, SyncEngine, SyncSession};
//! use std::sync::Arc;
//!
//! # async fn run() -> convsync_sync::SyncResult<()> {
//! let config = SyncConfig::new("/home/me/conversations");
//! let store = Arc::new(FsBlobStore::new("/mnt/drive/convsync"));
//! let secrets = Arc::new(MemorySecretStore::new());
//! let engine = SyncEngine::open(config, store, secrets, SyncSession::detached()).await?;
//!
//! engine.setup_passphrase("correct horse battery staple").await?;
//! let summary = engine.sync_now().await?;
//! println!("{} uploaded, {} downloaded", summary.uploaded_files, summary.downloaded_files);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conflict;
mod engine;
mod error;
pub mod events;
pub mod local;
pub mod merge;
pub mod model;
pub mod planner;
pub mod reconcile;
pub mod remote;
pub mod secret;
pub mod state;
pub mod stats;
pub mod transfer;

pub use config::{RetryPolicy, SyncConfig};
pub use conflict::{ConflictCopy, ConflictResolver, ConflictState, PendingConflict};
pub use engine::{LocalRecords, RotationReport, SyncEngine};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use events::{ActiveTransfer, SyncEvent, SyncSession, TransferDirection};
pub use local::{CachedHash, LocalFile, LocalStore};
pub use merge::{merge_manifests, MergeConflict, MergeOutcome};
pub use model::{
    ConversationRecord, FileEntry, FileMap, MachineRecord, QuotaSnapshot, SyncManifest,
};
pub use planner::{ConversationPlan, OpKind, PlannedOp, SyncPlan};
pub use reconcile::{diff_file_maps, reconcile, Divergence, FileDiff, FileRef, Reconciliation};
pub use remote::{BlobStore, FsBlobStore, MemoryBlobStore, CONVERSATIONS_PREFIX, MANIFEST_KEY};
pub use secret::{FileSecretStore, MemorySecretStore, SecretStore};
pub use state::{ConversationMeta, LocalSyncState};
pub use stats::{
    machine_transfer_totals, sync_stats, ConversationFailure, MachineTotals, SyncStats,
    SyncSummary,
};
pub use transfer::{CancelFlag, TransferOrchestrator};
