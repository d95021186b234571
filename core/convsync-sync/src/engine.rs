//! Sync engine: drives one machine's sync cycles.
//!
//! A cycle scans the local tree, fetches and decrypts the remote manifest,
//! reconciles both against the last agreed state, materializes conflicts,
//! runs the transfer plan and writes a merged manifest back. Only one cycle
//! (or conflict resolution, or key rotation) runs at a time per engine.

use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, ConflictState, PendingConflict};
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncSession};
use crate::local::{CachedHash, LocalStore};
use crate::merge::merge_manifests;
use crate::model::{ConversationRecord, FileEntry, SyncManifest};
use crate::planner::{self, OpKind, SyncPlan};
use crate::reconcile::reconcile;
use crate::remote::{blob_key, BlobStore, CONVERSATIONS_PREFIX};
use crate::secret::SecretStore;
use crate::state::{ConversationMeta, LocalSyncState};
use crate::stats::{machine_transfer_totals, sync_stats, MachineTotals, SyncStats, SyncSummary};
use crate::transfer::{
    retry_transient, CancelFlag, ConversationReport, OpOutcome, TransferContext,
    TransferOrchestrator, TransferUpdate,
};
use convsync_crypto::{BlobCodec, PassphraseCodec};
use convsync_types::{ContentHash, ConversationId, MachineId, Timestamp};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Local conversations as records, keyed by id.
pub type LocalRecords = BTreeMap<ConversationId, ConversationRecord>;

/// Outcome of a passphrase rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    /// Blobs decrypted with the old passphrase and sealed with the new one.
    pub resealed: usize,
    /// Blobs that already opened with the new passphrase.
    pub already_current: usize,
}

/// The sync engine for one machine.
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn BlobStore>,
    secrets: Arc<dyn SecretStore>,
    local: LocalStore,
    machine_id: MachineId,
    state: Mutex<LocalSyncState>,
    /// Held for the duration of a cycle.
    cycle: Mutex<()>,
    cancel: CancelFlag,
    session: SyncSession,
}

impl SyncEngine {
    /// Opens the engine, creating the local root and machine identity on
    /// first use.
    pub async fn open(
        config: SyncConfig,
        store: Arc<dyn BlobStore>,
        secrets: Arc<dyn SecretStore>,
        session: SyncSession,
    ) -> SyncResult<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.local_root).await?;
        let state = LocalSyncState::load_or_create(&config.local_root, &config.machine_name).await?;
        info!(
            "Sync engine for machine {} at {} using {}",
            state.machine_id,
            config.local_root.display(),
            store.provider_name()
        );

        Ok(Self {
            local: LocalStore::new(config.local_root.clone()),
            machine_id: state.machine_id,
            state: Mutex::new(state),
            cycle: Mutex::new(()),
            cancel: CancelFlag::new(),
            config,
            store,
            secrets,
            session,
        })
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }

    fn root(&self) -> &Path {
        &self.config.local_root
    }

    // ── Passphrase ───────────────────────────────────────────────

    /// Stores the passphrase after checking it opens the existing remote
    /// manifest, if there is one.
    pub async fn setup_passphrase(&self, passphrase: &str) -> SyncResult<()> {
        let codec = build_codec(passphrase, &self.config).await?;
        match self.fetch_manifest(&codec, &CancelFlag::new()).await {
            Ok(_) => {}
            Err(SyncError::Authentication(_)) => {
                return Err(SyncError::Authentication(
                    "passphrase does not open the existing remote manifest".into(),
                ));
            }
            Err(e) => return Err(e),
        }
        self.secrets.set_secret(passphrase).await?;
        info!("Passphrase configured");
        Ok(())
    }

    async fn codec(&self) -> SyncResult<Arc<dyn BlobCodec>> {
        let secret = self
            .secrets
            .get_secret()
            .await?
            .map(Zeroizing::new)
            .ok_or(SyncError::MissingPassphrase)?;
        build_codec(&secret, &self.config).await
    }

    /// Re-encrypts every remote blob under `new_passphrase`, then stores it.
    ///
    /// Blobs already readable with the new passphrase are left alone, so an
    /// interrupted rotation can simply be run again.
    pub async fn rotate_passphrase(&self, new_passphrase: &str) -> SyncResult<RotationReport> {
        let Ok(_guard) = self.cycle.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };
        self.cancel.reset();

        let old = self.codec().await?;
        let new = build_codec(new_passphrase, &self.config).await?;

        let mut keys = self.store.list(CONVERSATIONS_PREFIX).await?;
        keys.extend(
            self.store
                .list(&self.config.manifest_key)
                .await?
                .into_iter()
                .filter(|k| k == &self.config.manifest_key),
        );

        let mut report = RotationReport::default();
        for key in keys {
            self.cancel.check()?;
            let envelope = retry_transient(&self.config.retry, &self.cancel, &key, || {
                self.store.get(&key)
            })
            .await?;

            match open_blocking(new.clone(), envelope.clone()).await {
                Ok(_) => {
                    report.already_current += 1;
                    continue;
                }
                Err(SyncError::Authentication(_)) => {}
                Err(e) => return Err(e),
            }

            let plaintext = open_blocking(old.clone(), envelope).await?;
            let sealed = seal_blocking(new.clone(), plaintext).await?;
            retry_transient(&self.config.retry, &self.cancel, &key, || {
                self.store.put(&key, sealed.clone())
            })
            .await?;
            report.resealed += 1;
            debug!("Resealed {key}");
        }

        self.secrets.set_secret(new_passphrase).await?;
        info!(
            "Passphrase rotated: {} blob(s) resealed, {} already current",
            report.resealed, report.already_current
        );
        Ok(report)
    }

    // ── Manifest store ───────────────────────────────────────────

    /// Fetches and decrypts the remote manifest with the stored passphrase.
    pub async fn fetch_remote(&self) -> SyncResult<SyncManifest> {
        let codec = self.codec().await?;
        self.fetch_manifest(&codec, &CancelFlag::new()).await
    }

    async fn fetch_manifest(
        &self,
        codec: &Arc<dyn BlobCodec>,
        cancel: &CancelFlag,
    ) -> SyncResult<SyncManifest> {
        let key = &self.config.manifest_key;
        let envelope =
            match retry_transient(&self.config.retry, cancel, key, || self.store.get(key)).await {
                Ok(envelope) => envelope,
                Err(SyncError::NotFound(_)) => {
                    debug!("No remote manifest yet");
                    return Ok(SyncManifest::new());
                }
                Err(e) => return Err(e),
            };

        let plaintext = open_blocking(codec.clone(), envelope)
            .await
            .map_err(|e| match e {
                SyncError::Authentication(_) => SyncError::Authentication(
                    "remote manifest cannot be decrypted with this passphrase".into(),
                ),
                other => other,
            })?;
        SyncManifest::from_json(&plaintext)
    }

    async fn store_manifest(
        &self,
        codec: &Arc<dyn BlobCodec>,
        manifest: &SyncManifest,
    ) -> SyncResult<()> {
        let sealed = seal_blocking(codec.clone(), manifest.to_json()?).await?;
        let key = &self.config.manifest_key;
        retry_transient(&self.config.retry, &self.cancel, key, || {
            self.store.put(key, sealed.clone())
        })
        .await
    }

    /// Scans the local tree and returns its conversations as records.
    pub async fn load_local(&self, force: bool) -> SyncResult<LocalRecords> {
        let mut state = self.state.lock().await;
        let records = self.scan_local(&mut state, force).await?;
        state.save(self.root()).await?;
        Ok(records)
    }

    async fn scan_local(
        &self,
        state: &mut LocalSyncState,
        force: bool,
    ) -> SyncResult<LocalRecords> {
        let mut records = LocalRecords::new();

        for id in self.local.list_conversations().await? {
            if id.is_conflict_copy() {
                continue;
            }
            let mut cache = state.hash_cache.remove(&id).unwrap_or_default();
            let scan = self.local.scan(&id, &mut cache, force).await?;
            if scan.files.is_empty() {
                continue;
            }
            state.hash_cache.insert(id.clone(), cache);

            let mut meta =
                state.meta_or_default(&id, state.last_known_remote.conversation(&id), scan.oldest);
            if scan.changed {
                meta.modified_by = self.machine_id;
                // A deletion can leave only older files behind.
                meta.last_modified = if scan.newest > meta.last_modified {
                    scan.newest
                } else {
                    Timestamp::now()
                };
            }
            state.conversations.insert(id.clone(), meta.clone());
            records.insert(id.clone(), meta.to_record(id, scan.files));
        }

        state.hash_cache.retain(|id, _| records.contains_key(id));
        debug!("Scanned {} local conversation(s)", records.len());
        Ok(records)
    }

    // ── Cycles ───────────────────────────────────────────────────

    /// Runs one sync cycle.
    pub async fn sync_now(&self) -> SyncResult<SyncSummary> {
        self.run_cycle(false).await
    }

    /// Runs one cycle that rehashes every local file and drops any state the
    /// store buffers.
    pub async fn force_sync(&self) -> SyncResult<SyncSummary> {
        self.run_cycle(true).await
    }

    /// Asks the running cycle to stop before its next file operation.
    pub fn cancel_sync(&self) {
        info!("Sync cancellation requested");
        self.cancel.cancel();
    }

    async fn run_cycle(&self, force: bool) -> SyncResult<SyncSummary> {
        let Ok(_guard) = self.cycle.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };
        self.cancel.reset();

        let started_at = Timestamp::now();
        self.session.emit(SyncEvent::CycleStarted { force, started_at });
        info!("Sync cycle started{}", if force { " (forced)" } else { "" });

        match self.execute_cycle(force, started_at).await {
            Ok(summary) => {
                info!(
                    "Sync cycle finished: {} up, {} down, {} failed, {} conflict(s) pending",
                    summary.uploaded_files,
                    summary.downloaded_files,
                    summary.failed,
                    summary.conflicts_pending
                );
                self.session.emit(SyncEvent::CycleFinished(summary.clone()));
                Ok(summary)
            }
            Err(SyncError::Cancelled) => {
                info!("Sync cycle cancelled before transfers");
                let summary = SyncSummary {
                    cancelled: true,
                    conflicts_pending: self.state.lock().await.pending_conflicts.len(),
                    started_at,
                    finished_at: Timestamp::now(),
                    ..SyncSummary::default()
                };
                self.session.emit(SyncEvent::CycleFinished(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                warn!("Sync cycle failed: {e}");
                self.session.emit(SyncEvent::CycleFailed {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn execute_cycle(&self, force: bool, started_at: Timestamp) -> SyncResult<SyncSummary> {
        let codec = self.codec().await?;
        if force {
            self.store.discard_buffered().await?;
        }

        let mut state = self.state.lock().await;
        let local = self.scan_local(&mut state, force).await?;
        self.cancel.check()?;
        let remote = self.fetch_manifest(&codec, &self.cancel).await?;

        let reconciliation = reconcile(&local, &remote, &state.last_known_remote);
        let plan = planner::plan(reconciliation, &state.held_paths());
        debug!(
            "Planned {} file operation(s) across {} conversation(s)",
            plan.total_ops(),
            plan.conversations.len()
        );

        let ctx = Arc::new(TransferContext {
            store: self.store.clone(),
            codec: codec.clone(),
            local: self.local.clone(),
            retry: self.config.retry.clone(),
            cancel: self.cancel.clone(),
            session: self.session.clone(),
        });

        let mut summary = SyncSummary {
            started_at,
            ..SyncSummary::default()
        };
        self.handle_divergences(&ctx, &mut state, &plan, &remote, &mut summary)
            .await?;
        state.save(self.root()).await?;

        self.session.emit(SyncEvent::Planned {
            upload_files: plan.upload_files,
            download_files: plan.download_files,
            upload_bytes: plan.upload_bytes,
            download_bytes: plan.download_bytes,
            divergences: plan.divergence_count(),
        });

        let orchestrator = TransferOrchestrator::new(ctx, self.config.max_concurrent_transfers);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut checkpoint = Checkpoint {
            engine: self,
            codec: &codec,
            state: &mut state,
            local: &local,
            remote: &remote,
            ancestor: remote.clone(),
            working: remote.clone(),
            touched: BTreeSet::new(),
            unconfirmed: BTreeMap::new(),
            summary: &mut summary,
        };

        let (reports, ()) = tokio::join!(orchestrator.run(plan, tx), checkpoint.consume(rx));
        let cancelled = self.cancel.is_cancelled() || reports.iter().any(|r| r.cancelled);
        if orchestrator.quota_exhausted() {
            warn!("Remote storage is full; some uploads were held back");
        }

        if cancelled {
            if !checkpoint.unconfirmed.is_empty() {
                if let Err(e) = checkpoint.write_manifest().await {
                    warn!("Could not checkpoint uploads of the cancelled cycle: {e}");
                }
            }
        } else {
            checkpoint.finish_cycle().await?;
        }
        checkpoint.agree();
        let remote_view = checkpoint.ancestor;

        fold_reports(&mut summary, reports);
        summary.cancelled = cancelled;
        summary.finished_at = Timestamp::now();
        if !cancelled {
            state.last_sync = Some(summary.finished_at);
        }
        let known: BTreeSet<ConversationId> = remote_view.conversation_ids().cloned().collect();
        let gone: Vec<ConversationId> = state
            .conversations
            .keys()
            .filter(|id| !local.contains_key(*id) && !known.contains(*id))
            .cloned()
            .collect();
        for id in &gone {
            state.forget_conversation(id);
        }
        summary.conflicts_pending = state.pending_conflicts.len();
        state.save(self.root()).await?;
        Ok(summary)
    }

    async fn handle_divergences(
        &self,
        ctx: &TransferContext,
        state: &mut LocalSyncState,
        plan: &SyncPlan,
        remote: &SyncManifest,
        summary: &mut SyncSummary,
    ) -> SyncResult<()> {
        let resolver = ConflictResolver::new(self.local.clone());
        for mut conflict in resolver.detect(plan, remote, &state.pending_conflicts)? {
            let previous_copy = state
                .pending_conflicts
                .get(&conflict.original)
                .map(|p| p.copy.clone());
            if let Some(previous) = previous_copy.filter(|p| p != &conflict.copy) {
                self.local.remove_conversation(&previous).await?;
            }

            match resolver.materialize(ctx, &mut conflict).await {
                Ok(_) => {
                    self.session.emit(SyncEvent::ConflictDetected {
                        original: conflict.original.clone(),
                        copy: conflict.copy.clone(),
                        paths: conflict.paths.iter().cloned().collect(),
                    });
                    state
                        .pending_conflicts
                        .insert(conflict.original.clone(), conflict);
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!("Could not materialize conflict in {}: {e}", conflict.original);
                    summary.record_failure(conflict.original.clone(), &e);
                }
            }
        }
        Ok(())
    }

    // ── Conflicts & statistics ───────────────────────────────────

    /// Conflicts awaiting a decision.
    pub async fn pending_conflicts(&self) -> Vec<PendingConflict> {
        self.state
            .lock()
            .await
            .pending_conflicts
            .values()
            .cloned()
            .collect()
    }

    /// Resolves the conflict on `id`, which may name the original or its
    /// copy. Returns `None` when nothing was pending.
    pub async fn resolve_conflict(
        &self,
        id: &ConversationId,
        keep_local: bool,
    ) -> SyncResult<Option<ConflictState>> {
        let Ok(_guard) = self.cycle.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };
        let original = id
            .conflict_origin()
            .map(|(origin, _)| origin)
            .unwrap_or_else(|| id.clone());

        let mut state = self.state.lock().await;
        let resolved = ConflictResolver::new(self.local.clone())
            .resolve(&mut state, &original, keep_local)
            .await?;
        if resolved.is_some() {
            state.save(self.root()).await?;
            self.session
                .emit(SyncEvent::ConflictResolved { original, keep_local });
        }
        Ok(resolved)
    }

    /// How far local and remote conversation sets overlap.
    pub async fn stats(&self) -> SyncResult<SyncStats> {
        let codec = self.codec().await?;
        let local = self.load_local(false).await?;
        let remote = self.fetch_manifest(&codec, &CancelFlag::new()).await?;
        let remote_ids: Vec<&ConversationId> =
            remote.live_conversations().map(|r| &r.id).collect();
        Ok(sync_stats(local.keys(), remote_ids))
    }

    /// Remote conversation sizes split by whether this machine created them.
    pub async fn transfer_totals(&self) -> SyncResult<MachineTotals> {
        let remote = self.fetch_remote().await?;
        Ok(machine_transfer_totals(
            self.machine_id,
            remote.live_conversations(),
        ))
    }
}

/// Bookkeeping for transfer results while a cycle's plan runs.
struct Checkpoint<'a> {
    engine: &'a SyncEngine,
    codec: &'a Arc<dyn BlobCodec>,
    state: &'a mut LocalSyncState,
    local: &'a LocalRecords,
    remote: &'a SyncManifest,
    /// The manifest `working` was derived from: the last one read or written.
    ancestor: SyncManifest,
    working: SyncManifest,
    /// Conversations with remote changes not yet written.
    touched: BTreeSet<ConversationId>,
    /// Remote changes written to `working` but not confirmed by a manifest
    /// write, per conversation and path.
    unconfirmed: BTreeMap<ConversationId, BTreeMap<String, RemoteChange>>,
    summary: &'a mut SyncSummary,
}

/// One path this cycle changed on the remote.
struct RemoteChange {
    /// The new entry, `None` for a deletion.
    entry: Option<FileEntry>,
    /// Version the manifest pointed at before the change.
    replaced: Option<ContentHash>,
}

impl Checkpoint<'_> {
    async fn consume(&mut self, mut rx: mpsc::UnboundedReceiver<TransferUpdate>) {
        while let Some(update) = rx.recv().await {
            match update {
                TransferUpdate::Op { op, outcome } => {
                    self.apply(op.kind, &op.conversation, &op.path, outcome).await;
                }
                TransferUpdate::ConversationDone(id) => {
                    if self.touched.remove(&id) {
                        if let Err(e) = self.write_manifest().await {
                            warn!("Manifest checkpoint after {id} failed: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn apply(&mut self, kind: OpKind, id: &ConversationId, path: &str, outcome: OpOutcome) {
        let me = self.engine.machine_id;
        match outcome {
            OpOutcome::Downloaded(entry) => {
                self.summary.downloaded_files += 1;
                self.summary.downloaded_bytes += entry.size;
                self.state.record_local_file(
                    id,
                    path,
                    CachedHash {
                        hash: entry.hash.clone(),
                        size: entry.size,
                        modified: entry.modified_at,
                    },
                );
                if let Some(record) = self.remote.conversation(id) {
                    self.state.set_base_file(record, path, Some(entry));
                    if !self.state.conversations.contains_key(id) {
                        self.state
                            .conversations
                            .insert(id.clone(), ConversationMeta::from_record(record));
                    }
                }
                self.save_state().await;
            }
            OpOutcome::DeletedLocal => {
                self.summary.deleted_local += 1;
                self.state.forget_local_file(id, path);
                if let Some(record) = self.state.last_known_remote.conversation(id).cloned() {
                    self.state.set_base_file(&record, path, None);
                }
                self.save_state().await;
            }
            OpOutcome::Uploaded(entry) => {
                self.summary.uploaded_files += 1;
                self.summary.uploaded_bytes += entry.size;
                let replaced = self.working.file(id, path).map(|e| e.hash.clone());
                if self.working.conversation(id).is_none() {
                    let fresh = match self.local.get(id) {
                        Some(local) => local.with_files(Default::default()),
                        None => ConversationRecord::new(id.clone(), id.as_str(), me, Timestamp::now()),
                    };
                    self.working.upsert_conversation(fresh);
                }
                let modified = self
                    .local
                    .get(id)
                    .map_or_else(Timestamp::now, |l| l.last_modified);
                if let Some(record) = self.working.conversation_mut(id) {
                    record.file_hashes.insert(path.to_string(), entry.clone());
                    record.touch(me, modified);
                }
                self.mark(id, path, Some(entry), replaced);
            }
            OpOutcome::DeletedRemote => {
                self.summary.deleted_remote += 1;
                let replaced = self.working.file(id, path).map(|e| e.hash.clone());
                if let Some(record) = self.working.conversation_mut(id) {
                    record.file_hashes.remove(path);
                    if record.is_tombstone() {
                        debug!("{id} is now a tombstone");
                    }
                    record.touch(me, Timestamp::now());
                }
                self.mark(id, path, None, replaced);
            }
            OpOutcome::Skipped(_) => {
                self.summary.skipped += 1;
                debug!("Skipped {kind:?} of {id}/{path}");
            }
        }
    }

    fn mark(
        &mut self,
        id: &ConversationId,
        path: &str,
        entry: Option<FileEntry>,
        replaced: Option<ContentHash>,
    ) {
        self.touched.insert(id.clone());
        self.unconfirmed
            .entry(id.clone())
            .or_default()
            .insert(path.to_string(), RemoteChange { entry, replaced });
    }

    async fn save_state(&self) {
        if let Err(e) = self.state.save(self.engine.root()).await {
            warn!("Could not save sync state: {e}");
        }
    }

    /// Merges `working` into the current remote manifest and writes it. On
    /// success, changes the merged manifest kept become the agreed state and
    /// blobs it no longer references are deleted: the versions our kept
    /// changes replaced, and our uploads the merge rejected.
    async fn write_manifest(&mut self) -> SyncResult<()> {
        let theirs = self
            .engine
            .fetch_manifest(self.codec, &CancelFlag::new())
            .await?;
        let outcome = merge_manifests(&self.ancestor, &self.working, &theirs);
        for conflict in &outcome.conflicts {
            debug!(
                "Concurrent change to {}/{} kept the remote version",
                conflict.conversation, conflict.path
            );
        }
        self.engine
            .store_manifest(self.codec, &outcome.manifest)
            .await?;
        self.ancestor = outcome.manifest.clone();
        self.working = outcome.manifest;

        let mut stale = Vec::new();
        for (id, paths) in std::mem::take(&mut self.unconfirmed) {
            let template = self
                .working
                .conversation(&id)
                .or_else(|| self.remote.conversation(&id))
                .or_else(|| self.local.get(&id))
                .cloned();
            for (path, change) in paths {
                let current = self.working.file(&id, &path).cloned();
                let kept =
                    current.as_ref().map(|e| &e.hash) == change.entry.as_ref().map(|e| &e.hash);
                let unreferenced = if kept {
                    change.replaced
                } else {
                    change.entry.map(|e| e.hash)
                };
                let referenced = |h: &ContentHash| current.as_ref().is_some_and(|e| &e.hash == h);
                if let Some(hash) = unreferenced.filter(|h| !referenced(h)) {
                    stale.push(blob_key(&id, &path, &hash));
                }
                if let (true, Some(template)) = (kept, &template) {
                    self.state.set_base_file(template, &path, current);
                }
            }
        }
        self.save_state().await;

        let store = &self.engine.store;
        for key in stale {
            let deleted = retry_transient(&self.engine.config.retry, &CancelFlag::new(), &key, || {
                store.delete(&key)
            })
            .await;
            match deleted {
                Ok(()) => debug!("Deleted unreferenced blob {key}"),
                Err(e) => warn!("Could not delete unreferenced blob {key}: {e}"),
            }
        }
        Ok(())
    }

    /// Records this machine's sync, prunes settled tombstones and writes the
    /// final manifest.
    async fn finish_cycle(&mut self) -> SyncResult<()> {
        let engine = self.engine;
        let machine = self
            .working
            .ensure_machine(engine.machine_id, &engine.config.machine_name);
        machine.name = engine.config.machine_name.clone();
        machine.last_sync = Timestamp::now();
        machine.uploaded_bytes += self.summary.uploaded_bytes;
        machine.downloaded_bytes += self.summary.downloaded_bytes;
        machine.uploaded_files += self.summary.uploaded_files;
        machine.downloaded_files += self.summary.downloaded_files;

        let pruned = self.working.prune_tombstones();
        if !pruned.is_empty() {
            info!("Pruned {} tombstone(s)", pruned.len());
        }
        self.write_manifest().await
    }

    /// Records every file on which local and remote now agree as the common
    /// ancestor. Paths held by a pending conflict are left alone.
    fn agree(&mut self) {
        let held = self.state.held_paths();
        let ids: BTreeSet<ConversationId> = self
            .state
            .hash_cache
            .keys()
            .chain(self.ancestor.conversation_ids())
            .chain(self.state.last_known_remote.conversation_ids())
            .filter(|id| !id.is_conflict_copy())
            .cloned()
            .collect();

        for id in ids {
            let local = self.state.hash_cache.get(&id).cloned().unwrap_or_default();
            let remote = self.ancestor.conversation(&id).cloned();
            let remote_files = remote.as_ref().map(|r| r.file_hashes.clone()).unwrap_or_default();
            let base = self.state.last_known_remote.conversation(&id).cloned();

            let paths: BTreeSet<String> = local
                .keys()
                .chain(remote_files.keys())
                .chain(base.iter().flat_map(|b| b.file_hashes.keys()))
                .cloned()
                .collect();

            let mut all_agree = true;
            for path in paths {
                if held.get(&id).is_some_and(|p| p.contains(&path)) {
                    all_agree = false;
                    continue;
                }
                let l = local.get(&path).map(|c| &c.hash);
                let r = remote_files.get(&path);
                if l != r.map(|e| &e.hash) {
                    all_agree = false;
                    continue;
                }
                if let Some(template) = remote.as_ref().or(base.as_ref()) {
                    self.state.set_base_file(template, &path, r.cloned());
                }
            }

            if !all_agree {
                continue;
            }
            match &remote {
                Some(record) if !record.is_tombstone() => {
                    self.state
                        .conversations
                        .insert(id.clone(), ConversationMeta::from_record(record));
                }
                _ => {
                    self.state.last_known_remote.remove_conversation(&id);
                }
            }
        }
    }
}

fn fold_reports(summary: &mut SyncSummary, reports: Vec<ConversationReport>) {
    for report in reports {
        match report.failure {
            Some(e) => summary.record_failure(report.conversation, &e),
            None if !report.cancelled => summary.succeeded += 1,
            None => {}
        }
    }
}

async fn build_codec(passphrase: &str, config: &SyncConfig) -> SyncResult<Arc<dyn BlobCodec>> {
    if passphrase.is_empty() {
        return Err(SyncError::MissingPassphrase);
    }
    let passphrase = Zeroizing::new(passphrase.to_string());
    let params = config.kdf.clone();
    let limit = params.scaled(config.kdf_open_factor);
    let codec = tokio::task::spawn_blocking(move || {
        PassphraseCodec::new(&passphrase, params).map(|c| c.with_open_limit(limit))
    })
    .await??;
    Ok(Arc::new(codec))
}

async fn seal_blocking(codec: Arc<dyn BlobCodec>, plaintext: Vec<u8>) -> SyncResult<Vec<u8>> {
    Ok(tokio::task::spawn_blocking(move || codec.seal(&plaintext)).await??)
}

async fn open_blocking(codec: Arc<dyn BlobCodec>, envelope: Vec<u8>) -> SyncResult<Vec<u8>> {
    Ok(tokio::task::spawn_blocking(move || codec.open(&envelope)).await??)
}
