//! Conflict detection and resolution.
//!
//! When a file changed on both sides since they last agreed, nothing is
//! merged. The remote version of the whole conversation is downloaded into a
//! sibling directory named `<id>.conflict-<machine>`, the diverged paths are
//! held back from transfers, and the user picks a side.

use crate::error::{SyncError, SyncResult};
use crate::local::LocalStore;
use crate::model::{ConversationRecord, SyncManifest};
use crate::planner::SyncPlan;
use crate::remote::blob_key;
use crate::state::LocalSyncState;
use crate::transfer::TransferContext;
use convsync_types::{ConversationId, MachineId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Lifecycle of a conflict on one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    Clean,
    Diverged,
    ConflictMaterialized,
    ResolvedKeepLocal,
    ResolvedKeepRemote,
}

impl ConflictState {
    /// Moves to `to`, or fails with `InvalidTransition`.
    pub fn transition(self, to: ConflictState) -> SyncResult<ConflictState> {
        use ConflictState::*;
        let allowed = matches!(
            (self, to),
            (Clean, Diverged)
                | (Diverged, ConflictMaterialized)
                | (Diverged, ResolvedKeepLocal)
                | (Diverged, ResolvedKeepRemote)
                | (ConflictMaterialized, ResolvedKeepLocal)
                | (ConflictMaterialized, ResolvedKeepRemote)
                | (ResolvedKeepLocal, Clean)
                | (ResolvedKeepRemote, Clean)
        );
        if allowed {
            Ok(to)
        } else {
            Err(SyncError::InvalidTransition { from: self, to })
        }
    }
}

/// A divergent remote version, materialized locally under its copy id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictCopy {
    pub origin: ConversationId,
    pub machine: MachineId,
    /// The remote record re-keyed to the copy id.
    pub record: ConversationRecord,
}

impl ConflictCopy {
    pub fn new(remote: &ConversationRecord) -> Self {
        let machine = remote.modified_by;
        let mut record = remote.clone();
        record.id = remote.id.conflict_copy(machine);
        Self {
            origin: remote.id.clone(),
            machine,
            record,
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.record.id
    }
}

/// A conflict awaiting the user's decision. Persisted with the local state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConflict {
    pub original: ConversationId,
    pub copy: ConversationId,
    /// Machine whose edit diverged from ours.
    pub machine: MachineId,
    /// Paths held back from transfers until resolution.
    pub paths: BTreeSet<String>,
    /// The remote version the copy was built from.
    pub remote: ConversationRecord,
    pub state: ConflictState,
    pub detected_at: Timestamp,
}

impl PendingConflict {
    fn copy(&self) -> ConflictCopy {
        let mut record = self.remote.clone();
        record.id = self.copy.clone();
        ConflictCopy {
            origin: self.original.clone(),
            machine: self.machine,
            record,
        }
    }
}

/// Detects, materializes and resolves conflicts.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    local: LocalStore,
}

impl ConflictResolver {
    pub fn new(local: LocalStore) -> Self {
        Self { local }
    }

    /// Builds a pending conflict for every conversation whose plan has
    /// divergences, and for every held conflict whose remote version changed.
    /// Paths already held for a conversation are carried over, so a newer
    /// conflict replaces the older one.
    pub fn detect(
        &self,
        plan: &SyncPlan,
        remote: &SyncManifest,
        existing: &BTreeMap<ConversationId, PendingConflict>,
    ) -> SyncResult<Vec<PendingConflict>> {
        let mut found = Vec::new();
        for conversation in plan.conversations.iter().filter(|c| !c.divergences.is_empty()) {
            let Some(record) = remote.conversation(&conversation.conversation) else {
                warn!(
                    "Divergence in {} without a remote record",
                    conversation.conversation
                );
                continue;
            };
            let copy = ConflictCopy::new(record);

            let mut paths: BTreeSet<String> = conversation
                .divergences
                .iter()
                .map(|d| d.path.clone())
                .collect();
            if let Some(previous) = existing.get(&conversation.conversation) {
                paths.extend(previous.paths.iter().cloned());
            }

            found.push(PendingConflict {
                original: copy.origin.clone(),
                copy: copy.id().clone(),
                machine: copy.machine,
                paths,
                remote: record.clone(),
                state: ConflictState::Clean.transition(ConflictState::Diverged)?,
                detected_at: Timestamp::now(),
            });
        }

        // A held conflict whose remote side moved again gets a fresh copy.
        for previous in existing.values() {
            if found.iter().any(|c| c.original == previous.original) {
                continue;
            }
            let Some(record) = remote.conversation(&previous.original) else {
                continue;
            };
            if record.is_tombstone() || record.file_hashes == previous.remote.file_hashes {
                continue;
            }
            let copy = ConflictCopy::new(record);
            found.push(PendingConflict {
                original: copy.origin.clone(),
                copy: copy.id().clone(),
                machine: copy.machine,
                paths: previous.paths.clone(),
                remote: record.clone(),
                state: ConflictState::Clean.transition(ConflictState::Diverged)?,
                detected_at: Timestamp::now(),
            });
        }
        Ok(found)
    }

    /// Downloads the remote version's full file set into the copy directory.
    /// On failure the partial copy is removed.
    pub async fn materialize(
        &self,
        ctx: &TransferContext,
        conflict: &mut PendingConflict,
    ) -> SyncResult<ConflictCopy> {
        let copy = conflict.copy();
        self.local.remove_conversation(&conflict.copy).await?;

        let written = async {
            for (path, entry) in &conflict.remote.file_hashes {
                ctx.cancel.check()?;
                let key = blob_key(&conflict.original, path, &entry.hash);
                let bytes = ctx.fetch_verified(&key, &entry.hash).await?;
                self.local.write_file(&conflict.copy, path, &bytes).await?;
            }
            Ok::<_, SyncError>(())
        }
        .await;

        if let Err(e) = written {
            let _ = self.local.remove_conversation(&conflict.copy).await;
            return Err(e);
        }

        conflict.state = conflict.state.transition(ConflictState::ConflictMaterialized)?;
        info!(
            "Conflict in {}: remote version saved as {} ({} file(s) held)",
            conflict.original,
            conflict.copy,
            conflict.paths.len()
        );
        Ok(copy)
    }

    /// Resolves the conflict on `original`.
    ///
    /// `keep_local` deletes the copy and marks the held paths as agreed at
    /// the remote version, so the next cycle uploads ours over it. Otherwise
    /// the original's files are replaced by the copy's and the copy removed.
    /// Returns `None` when nothing is pending.
    pub async fn resolve(
        &self,
        state: &mut LocalSyncState,
        original: &ConversationId,
        keep_local: bool,
    ) -> SyncResult<Option<ConflictState>> {
        let Some(mut conflict) = state.pending_conflicts.get(original).cloned() else {
            return Ok(None);
        };

        let resolved = if keep_local {
            conflict.state.transition(ConflictState::ResolvedKeepLocal)?
        } else {
            conflict.state.transition(ConflictState::ResolvedKeepRemote)?
        };

        if keep_local {
            self.local.remove_conversation(&conflict.copy).await?;
            for path in &conflict.paths {
                let entry = conflict.remote.file_hashes.get(path).cloned();
                state.set_base_file(&conflict.remote, path, entry);
            }
        } else {
            self.adopt_copy(state, &conflict).await?;
        }

        conflict.state = resolved.transition(ConflictState::Clean)?;
        state.pending_conflicts.remove(original);
        info!(
            "Resolved conflict in {} keeping {} version",
            original,
            if keep_local { "local" } else { "remote" }
        );
        Ok(Some(resolved))
    }

    async fn adopt_copy(
        &self,
        state: &mut LocalSyncState,
        conflict: &PendingConflict,
    ) -> SyncResult<()> {
        if !self.local.conversation_exists(&conflict.copy).await {
            return Err(SyncError::NotFound(format!(
                "conflict copy {} is missing",
                conflict.copy
            )));
        }

        let copy_files: BTreeSet<String> = self
            .local
            .list_files(&conflict.copy)
            .await?
            .into_iter()
            .map(|f| f.path)
            .collect();
        let original_files = self.local.list_files(&conflict.original).await?;

        for file in original_files {
            if !copy_files.contains(&file.path) {
                self.local.delete_file(&conflict.original, &file.path).await?;
                state.forget_local_file(&conflict.original, &file.path);
            }
        }
        for path in &copy_files {
            let bytes = self.local.read_file(&conflict.copy, path).await?;
            self.local.write_file(&conflict.original, path, &bytes).await?;
        }

        self.local.remove_conversation(&conflict.copy).await?;
        if let Some(meta) = state.conversations.get_mut(&conflict.original) {
            meta.title = conflict.remote.title.clone();
        }
        Ok(())
    }
}
