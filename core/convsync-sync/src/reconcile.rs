//! Reconciliation of local files against the remote manifest.
//!
//! Every file is compared three ways: the local hash, the remote hash, and the
//! hash both sides last agreed on (the last known remote state). Whichever
//! side still matches the ancestor is the side that did not move, so the other
//! side's change is propagated. When both moved to different content the file
//! has diverged and goes to the conflict resolver.

use crate::model::{ConversationRecord, FileEntry, FileMap, SyncManifest};
use convsync_types::{ContentHash, ConversationId};
use std::collections::{BTreeMap, BTreeSet};

/// Two-way comparison of file maps. The three sets are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDiff {
    pub local_only: BTreeSet<String>,
    pub remote_only: BTreeSet<String>,
    /// Present on both sides with different hashes.
    pub changed: BTreeSet<String>,
}

impl FileDiff {
    pub fn is_empty(&self) -> bool {
        self.local_only.is_empty() && self.remote_only.is_empty() && self.changed.is_empty()
    }
}

/// Compares two file maps by hash.
pub fn diff_file_maps(local: &FileMap, remote: &FileMap) -> FileDiff {
    let mut diff = FileDiff::default();
    for (path, entry) in local {
        match remote.get(path) {
            None => {
                diff.local_only.insert(path.clone());
            }
            Some(r) if r.hash != entry.hash => {
                diff.changed.insert(path.clone());
            }
            Some(_) => {}
        }
    }
    for path in remote.keys() {
        if !local.contains_key(path) {
            diff.remote_only.insert(path.clone());
        }
    }
    diff
}

/// One file to move or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub conversation: ConversationId,
    pub path: String,
    /// Content being transferred, or the content being deleted.
    pub hash: ContentHash,
    pub size: u64,
    /// Local hash at reconciliation time, if the file exists locally.
    pub local_hash: Option<ContentHash>,
}

/// A file both sides changed to different content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub conversation: ConversationId,
    pub path: String,
    pub local: FileEntry,
    pub remote: FileEntry,
}

/// Everything that has to happen to bring both sides level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub to_upload: Vec<FileRef>,
    pub to_download: Vec<FileRef>,
    pub to_delete_local: Vec<FileRef>,
    pub to_delete_remote: Vec<FileRef>,
    pub conflicts: Vec<Divergence>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.to_upload.is_empty()
            && self.to_download.is_empty()
            && self.to_delete_local.is_empty()
            && self.to_delete_remote.is_empty()
            && self.conflicts.is_empty()
    }

    /// Conversations touched by any action.
    pub fn conversations(&self) -> BTreeSet<&ConversationId> {
        self.to_upload
            .iter()
            .chain(&self.to_download)
            .chain(&self.to_delete_local)
            .chain(&self.to_delete_remote)
            .map(|f| &f.conversation)
            .chain(self.conflicts.iter().map(|d| &d.conversation))
            .collect()
    }
}

/// Three-way reconciliation of `local` and `remote` against `last_known`.
///
/// Remote tombstones count as "no files". Conflict copies on either side are
/// ignored; they never leave the machine that created them.
pub fn reconcile(
    local: &BTreeMap<ConversationId, ConversationRecord>,
    remote: &SyncManifest,
    last_known: &SyncManifest,
) -> Reconciliation {
    let mut out = Reconciliation::default();
    let empty = FileMap::new();

    let ids: BTreeSet<&ConversationId> = local
        .keys()
        .chain(remote.conversation_ids())
        .chain(last_known.conversation_ids())
        .filter(|id| !id.is_conflict_copy())
        .collect();

    for id in ids {
        let l = local.get(id).map_or(&empty, |r| &r.file_hashes);
        let r = remote.conversation(id).map_or(&empty, |r| &r.file_hashes);
        let b = last_known.conversation(id).map_or(&empty, |r| &r.file_hashes);
        reconcile_files(id, l, r, b, &mut out);
    }
    out
}

fn reconcile_files(
    id: &ConversationId,
    local: &FileMap,
    remote: &FileMap,
    base: &FileMap,
    out: &mut Reconciliation,
) {
    let paths: BTreeSet<&String> = local.keys().chain(remote.keys()).chain(base.keys()).collect();

    for path in paths {
        let l = local.get(path);
        let r = remote.get(path);
        let b = base.get(path);
        let lh = l.map(|e| &e.hash);
        let rh = r.map(|e| &e.hash);
        let bh = b.map(|e| &e.hash);

        if lh == rh {
            continue;
        }

        let file_ref = |entry: &FileEntry| FileRef {
            conversation: id.clone(),
            path: path.clone(),
            hash: entry.hash.clone(),
            size: entry.size,
            local_hash: lh.cloned(),
        };

        match (l, r) {
            // Remote moved.
            (_, Some(remote_entry)) if lh == bh => {
                out.to_download.push(file_ref(remote_entry));
            }
            (Some(local_entry), None) if lh == bh => {
                out.to_delete_local.push(file_ref(local_entry));
            }
            // Local moved.
            (Some(local_entry), _) if rh == bh => {
                out.to_upload.push(file_ref(local_entry));
            }
            (None, Some(remote_entry)) if rh == bh => {
                out.to_delete_remote.push(file_ref(remote_entry));
            }
            // Both moved.
            (Some(local_entry), Some(remote_entry)) => out.conflicts.push(Divergence {
                conversation: id.clone(),
                path: path.clone(),
                local: local_entry.clone(),
                remote: remote_entry.clone(),
            }),
            // One side deleted what the other modified: the modification wins.
            (None, Some(remote_entry)) => out.to_download.push(file_ref(remote_entry)),
            (Some(local_entry), None) => out.to_upload.push(file_ref(local_entry)),
            (None, None) => {}
        }
    }
}
