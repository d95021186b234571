//! The synchronized data model: conversations, their files, and machines.
//!
//! `SyncManifest` is the single document written (encrypted) to the remote
//! store. It lists every conversation with the hash of each constituent file,
//! and every machine that has ever synced.

use crate::error::{SyncError, SyncResult};
use convsync_types::{ContentHash, ConversationId, MachineId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Files of one conversation keyed by relative, `/`-separated path.
pub type FileMap = BTreeMap<String, FileEntry>;

/// One file of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub hash: ContentHash,
    pub size: u64,
    /// Local modification time. Not part of the manifest.
    #[serde(skip)]
    pub modified_at: Timestamp,
}

impl FileEntry {
    pub fn new(hash: ContentHash, size: u64) -> Self {
        Self {
            hash,
            size,
            modified_at: Timestamp::EPOCH,
        }
    }

    pub fn with_modified(mut self, modified_at: Timestamp) -> Self {
        self.modified_at = modified_at;
        self
    }
}

// Entries are equal when their content is; mtimes are local bookkeeping.
impl PartialEq for FileEntry {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.size == other.size
    }
}

impl Eq for FileEntry {}

/// A conversation and the hashes of its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub created_by: MachineId,
    pub created_at: Timestamp,
    pub modified_by: MachineId,
    pub last_modified: Timestamp,
    #[serde(default)]
    pub file_hashes: FileMap,
}

impl ConversationRecord {
    /// A new, empty record created by `machine` at `now`.
    pub fn new(
        id: ConversationId,
        title: impl Into<String>,
        machine: MachineId,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            created_by: machine,
            created_at: now,
            modified_by: machine,
            last_modified: now,
            file_hashes: FileMap::new(),
        }
    }

    /// A record with no files marks a deleted conversation.
    pub fn is_tombstone(&self) -> bool {
        self.file_hashes.is_empty()
    }

    /// Sum of file sizes.
    pub fn total_size(&self) -> u64 {
        self.file_hashes.values().map(|f| f.size).sum()
    }

    /// Records a modification by `machine`.
    pub fn touch(&mut self, machine: MachineId, now: Timestamp) {
        self.modified_by = machine;
        self.last_modified = now;
    }

    /// Same record with its file set replaced.
    pub fn with_files(&self, file_hashes: FileMap) -> Self {
        Self {
            file_hashes,
            ..self.clone()
        }
    }
}

/// Remote storage usage as last observed by a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub captured_at: Timestamp,
}

/// A machine participating in sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    pub id: MachineId,
    pub name: String,
    /// End of this machine's last completed cycle; the epoch if it never finished one.
    #[serde(default)]
    pub last_sync: Timestamp,
    #[serde(default)]
    pub uploaded_bytes: u64,
    #[serde(default)]
    pub downloaded_bytes: u64,
    #[serde(default)]
    pub uploaded_files: u64,
    #[serde(default)]
    pub downloaded_files: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
}

impl MachineRecord {
    pub fn new(id: MachineId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            last_sync: Timestamp::EPOCH,
            uploaded_bytes: 0,
            downloaded_bytes: 0,
            uploaded_files: 0,
            downloaded_files: 0,
            quota: None,
        }
    }
}

/// The canonical record of all conversations and machines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ManifestWire", into = "ManifestWire")]
pub struct SyncManifest {
    conversations: BTreeMap<ConversationId, ConversationRecord>,
    machines: BTreeMap<MachineId, MachineRecord>,
}

#[derive(Serialize, Deserialize)]
struct ManifestWire {
    #[serde(default)]
    conversations: Vec<ConversationRecord>,
    #[serde(default)]
    machines: Vec<MachineRecord>,
}

impl TryFrom<ManifestWire> for SyncManifest {
    type Error = SyncError;

    fn try_from(wire: ManifestWire) -> Result<Self, Self::Error> {
        let mut manifest = SyncManifest::new();
        for record in wire.conversations {
            if manifest.conversations.contains_key(&record.id) {
                return Err(SyncError::ManifestConflict(format!(
                    "duplicate conversation id {}",
                    record.id
                )));
            }
            manifest.conversations.insert(record.id.clone(), record);
        }
        for machine in wire.machines {
            if manifest.machines.contains_key(&machine.id) {
                return Err(SyncError::ManifestConflict(format!(
                    "duplicate machine id {}",
                    machine.id
                )));
            }
            manifest.machines.insert(machine.id, machine);
        }
        Ok(manifest)
    }
}

impl From<SyncManifest> for ManifestWire {
    fn from(manifest: SyncManifest) -> Self {
        Self {
            conversations: manifest.conversations.into_values().collect(),
            machines: manifest.machines.into_values().collect(),
        }
    }
}

impl SyncManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the JSON form, rejecting duplicate ids with `ManifestConflict`.
    pub fn from_json(bytes: &[u8]) -> SyncResult<Self> {
        let wire: ManifestWire = serde_json::from_slice(bytes)?;
        Self::try_from(wire)
    }

    pub fn to_json(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty() && self.machines.is_empty()
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&ConversationRecord> {
        self.conversations.get(id)
    }

    pub fn conversation_mut(&mut self, id: &ConversationId) -> Option<&mut ConversationRecord> {
        self.conversations.get_mut(id)
    }

    /// All conversations, tombstones included, ordered by id.
    pub fn conversations(&self) -> impl Iterator<Item = &ConversationRecord> {
        self.conversations.values()
    }

    /// Conversations that still have files.
    pub fn live_conversations(&self) -> impl Iterator<Item = &ConversationRecord> {
        self.conversations.values().filter(|c| !c.is_tombstone())
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &ConversationId> {
        self.conversations.keys()
    }

    /// Inserts or replaces a conversation, returning the previous record.
    pub fn upsert_conversation(&mut self, record: ConversationRecord) -> Option<ConversationRecord> {
        self.conversations.insert(record.id.clone(), record)
    }

    pub fn remove_conversation(&mut self, id: &ConversationId) -> Option<ConversationRecord> {
        self.conversations.remove(id)
    }

    /// Looks up one file of one conversation.
    pub fn file(&self, id: &ConversationId, path: &str) -> Option<&FileEntry> {
        self.conversations.get(id)?.file_hashes.get(path)
    }

    pub fn machine(&self, id: &MachineId) -> Option<&MachineRecord> {
        self.machines.get(id)
    }

    pub fn machines(&self) -> impl Iterator<Item = &MachineRecord> {
        self.machines.values()
    }

    pub fn upsert_machine(&mut self, record: MachineRecord) -> Option<MachineRecord> {
        self.machines.insert(record.id, record)
    }

    /// Returns the machine's record, creating it under `name` if absent.
    pub fn ensure_machine(&mut self, id: MachineId, name: &str) -> &mut MachineRecord {
        self.machines
            .entry(id)
            .or_insert_with(|| MachineRecord::new(id, name))
    }

    /// Removes tombstones every known machine has synced past.
    ///
    /// A tombstone survives while any machine's last completed sync is older
    /// than the deletion, since that machine may still hold the files.
    pub fn prune_tombstones(&mut self) -> Vec<ConversationId> {
        if self.machines.is_empty() {
            return Vec::new();
        }
        let oldest_sync = self
            .machines
            .values()
            .map(|m| m.last_sync)
            .min()
            .unwrap_or(Timestamp::EPOCH);

        let pruned: Vec<ConversationId> = self
            .conversations
            .values()
            .filter(|c| c.is_tombstone() && oldest_sync >= c.last_modified)
            .map(|c| c.id.clone())
            .collect();
        for id in &pruned {
            self.conversations.remove(id);
        }
        pruned
    }
}
