//! Per-machine sync state.
//!
//! Persisted as JSON at `<local_root>/.convsync/state.json`. Holds the
//! machine's identity, the hash cache, local conversation metadata, the last
//! manifest both sides agreed on, and pending conflicts.

use crate::conflict::PendingConflict;
use crate::error::{SyncError, SyncResult};
use crate::local::{CachedHash, STATE_DIR};
use crate::model::{ConversationRecord, FileEntry, FileMap, SyncManifest};
use convsync_types::{ConversationId, MachineId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// File name of the state document inside the state directory.
pub const STATE_FILE: &str = "state.json";

/// Cached hashes per conversation, keyed by relative path.
pub type HashCache = BTreeMap<ConversationId, BTreeMap<String, CachedHash>>;

/// Local metadata of a conversation. Files live on disk, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMeta {
    pub title: String,
    pub created_by: MachineId,
    pub created_at: Timestamp,
    pub modified_by: MachineId,
    pub last_modified: Timestamp,
}

impl ConversationMeta {
    /// Metadata for a conversation first seen locally.
    pub fn created_here(id: &ConversationId, machine: MachineId, now: Timestamp) -> Self {
        Self {
            title: id.to_string(),
            created_by: machine,
            created_at: now,
            modified_by: machine,
            last_modified: now,
        }
    }

    /// Copies the metadata of a remote record.
    pub fn from_record(record: &ConversationRecord) -> Self {
        Self {
            title: record.title.clone(),
            created_by: record.created_by,
            created_at: record.created_at,
            modified_by: record.modified_by,
            last_modified: record.last_modified,
        }
    }

    /// Builds a record from this metadata and a file set.
    pub fn to_record(&self, id: ConversationId, file_hashes: FileMap) -> ConversationRecord {
        ConversationRecord {
            id,
            title: self.title.clone(),
            created_by: self.created_by,
            created_at: self.created_at,
            modified_by: self.modified_by,
            last_modified: self.last_modified,
            file_hashes,
        }
    }
}

/// Everything a machine remembers between cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSyncState {
    pub machine_id: MachineId,
    pub machine_name: String,
    /// End of the last completed cycle.
    #[serde(default)]
    pub last_sync: Option<Timestamp>,
    #[serde(default)]
    pub hash_cache: HashCache,
    #[serde(default)]
    pub conversations: BTreeMap<ConversationId, ConversationMeta>,
    /// The common ancestor for three-way reconciliation.
    #[serde(default)]
    pub last_known_remote: SyncManifest,
    #[serde(default)]
    pub pending_conflicts: BTreeMap<ConversationId, PendingConflict>,
}

impl LocalSyncState {
    /// Fresh state for a machine that has never synced.
    pub fn new(machine_id: MachineId, machine_name: impl Into<String>) -> Self {
        Self {
            machine_id,
            machine_name: machine_name.into(),
            last_sync: None,
            hash_cache: HashCache::new(),
            conversations: BTreeMap::new(),
            last_known_remote: SyncManifest::new(),
            pending_conflicts: BTreeMap::new(),
        }
    }

    /// Location of the state file under `local_root`.
    pub fn path_in(local_root: &Path) -> PathBuf {
        local_root.join(STATE_DIR).join(STATE_FILE)
    }

    /// Reads the state file. Missing file is `NotFound`.
    pub async fn load(path: &Path) -> SyncResult<Self> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SyncError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Loads the state under `local_root`, or creates one with a new machine
    /// id. The stored machine name follows `machine_name`.
    pub async fn load_or_create(local_root: &Path, machine_name: &str) -> SyncResult<Self> {
        let path = Self::path_in(local_root);
        match Self::load(&path).await {
            Ok(mut state) => {
                if state.machine_name != machine_name {
                    state.machine_name = machine_name.to_string();
                }
                debug!("Loaded sync state for machine {}", state.machine_id);
                Ok(state)
            }
            Err(SyncError::NotFound(_)) => {
                let state = Self::new(MachineId::new(), machine_name);
                info!("Created machine identity {}", state.machine_id);
                state.save(local_root).await?;
                Ok(state)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes the state atomically under `local_root`.
    pub async fn save(&self, local_root: &Path) -> SyncResult<()> {
        let path = Self::path_in(local_root);
        let dir = local_root.join(STATE_DIR);
        fs::create_dir_all(&dir).await?;

        let json = serde_json::to_vec_pretty(self)?;
        let tmp = dir.join(format!("{STATE_FILE}.tmp"));
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Paths held back from transfers by pending conflicts.
    pub fn held_paths(&self) -> HashMap<ConversationId, BTreeSet<String>> {
        self.pending_conflicts
            .iter()
            .map(|(id, conflict)| (id.clone(), conflict.paths.clone()))
            .collect()
    }

    /// Metadata for `id`, falling back to what the remote says, then to a
    /// record created by this machine.
    pub fn meta_or_default(
        &self,
        id: &ConversationId,
        remote: Option<&ConversationRecord>,
        now: Timestamp,
    ) -> ConversationMeta {
        if let Some(meta) = self.conversations.get(id) {
            return meta.clone();
        }
        match remote {
            Some(record) => ConversationMeta::from_record(record),
            None => ConversationMeta::created_here(id, self.machine_id, now),
        }
    }

    // ── Mutations ────────────────────────────────────────────────

    /// Caches the hash of a file just written or verified on disk.
    pub fn record_local_file(&mut self, id: &ConversationId, path: &str, hash: CachedHash) {
        self.hash_cache
            .entry(id.clone())
            .or_default()
            .insert(path.to_string(), hash);
    }

    /// Drops a file from the hash cache.
    pub fn forget_local_file(&mut self, id: &ConversationId, path: &str) {
        if let Some(files) = self.hash_cache.get_mut(id) {
            files.remove(path);
            if files.is_empty() {
                self.hash_cache.remove(id);
            }
        }
    }

    /// Sets (or clears) one file of the last-known-remote snapshot. The
    /// conversation is created from `template`'s metadata if absent.
    pub fn set_base_file(
        &mut self,
        template: &ConversationRecord,
        path: &str,
        entry: Option<FileEntry>,
    ) {
        let base = &mut self.last_known_remote;
        if base.conversation(&template.id).is_none() {
            if entry.is_none() {
                return;
            }
            base.upsert_conversation(template.with_files(FileMap::new()));
        }
        let Some(record) = base.conversation_mut(&template.id) else {
            return;
        };
        match entry {
            Some(entry) => {
                record.file_hashes.insert(path.to_string(), entry);
            }
            None => {
                record.file_hashes.remove(path);
            }
        }
    }

    /// Forgets everything about a conversation that no longer exists on
    /// either side.
    pub fn forget_conversation(&mut self, id: &ConversationId) {
        self.hash_cache.remove(id);
        self.conversations.remove(id);
    }
}
