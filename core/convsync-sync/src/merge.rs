//! Three-way manifest merge.
//!
//! Before the manifest is written, the current remote copy is re-read and
//! merged with ours against the version both were derived from. The merge is
//! file-entry granular: concurrent edits to different files of the same
//! conversation both survive, and only edits to the same file with different
//! content are reported.

use crate::model::{ConversationRecord, FileEntry, FileMap, MachineRecord, SyncManifest};
use convsync_types::{ContentHash, ConversationId};
use std::collections::BTreeSet;
use tracing::debug;

/// A file both sides changed differently since the ancestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub conversation: ConversationId,
    pub path: String,
    pub ours: Option<ContentHash>,
    pub theirs: Option<ContentHash>,
}

/// Result of `merge_manifests`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub manifest: SyncManifest,
    /// Files where theirs was kept over a different change of ours.
    pub conflicts: Vec<MergeConflict>,
}

/// Merges `ours` and `theirs`, both derived from `ancestor`.
///
/// On a same-file conflict theirs is kept; ours is not lost, since the local
/// file still differs and the next cycle reconciles it.
pub fn merge_manifests(
    ancestor: &SyncManifest,
    ours: &SyncManifest,
    theirs: &SyncManifest,
) -> MergeOutcome {
    let mut manifest = SyncManifest::new();
    let mut conflicts = Vec::new();

    let ids: BTreeSet<&ConversationId> = ancestor
        .conversation_ids()
        .chain(ours.conversation_ids())
        .chain(theirs.conversation_ids())
        .collect();

    for id in ids {
        let base = ancestor.conversation(id);
        let o = ours.conversation(id);
        let t = theirs.conversation(id);

        let files = merge_files(
            id,
            base.map(|r| &r.file_hashes),
            o.map(|r| &r.file_hashes),
            t.map(|r| &r.file_hashes),
            &mut conflicts,
        );

        let Some(meta) = pick_metadata(o, t) else {
            continue;
        };

        if files.is_empty() {
            // Keep a tombstone only while somebody still needs to learn about
            // the deletion; a side that dropped the record has pruned it.
            let had_files = [o, t].into_iter().flatten().any(|r| !r.is_tombstone());
            let both_tombstoned = o.is_some_and(|r| r.is_tombstone())
                && t.is_some_and(|r| r.is_tombstone());
            if !had_files && !both_tombstoned {
                continue;
            }
        }

        manifest.upsert_conversation(meta.with_files(files));
    }

    let machine_ids: BTreeSet<_> = ours
        .machines()
        .chain(theirs.machines())
        .map(|m| m.id)
        .collect();
    for id in machine_ids {
        let merged = match (ours.machine(&id), theirs.machine(&id)) {
            (Some(o), Some(t)) => merge_machine(o, t),
            (Some(m), None) | (None, Some(m)) => m.clone(),
            (None, None) => continue,
        };
        manifest.upsert_machine(merged);
    }

    if !conflicts.is_empty() {
        debug!("manifest merge kept remote side for {} file(s)", conflicts.len());
    }

    MergeOutcome {
        manifest,
        conflicts,
    }
}

fn merge_files(
    id: &ConversationId,
    base: Option<&FileMap>,
    ours: Option<&FileMap>,
    theirs: Option<&FileMap>,
    conflicts: &mut Vec<MergeConflict>,
) -> FileMap {
    let empty = FileMap::new();
    let base = base.unwrap_or(&empty);
    let ours = ours.unwrap_or(&empty);
    let theirs = theirs.unwrap_or(&empty);

    let paths: BTreeSet<&String> = base.keys().chain(ours.keys()).chain(theirs.keys()).collect();
    let mut merged = FileMap::new();

    for path in paths {
        let b = base.get(path);
        let o = ours.get(path);
        let t = theirs.get(path);

        let chosen: Option<&FileEntry> = if same(o, t) || same(o, b) {
            t
        } else if same(t, b) {
            o
        } else {
            conflicts.push(MergeConflict {
                conversation: id.clone(),
                path: path.clone(),
                ours: o.map(|e| e.hash.clone()),
                theirs: t.map(|e| e.hash.clone()),
            });
            t
        };

        if let Some(entry) = chosen {
            merged.insert(path.clone(), entry.clone());
        }
    }
    merged
}

fn same(a: Option<&FileEntry>, b: Option<&FileEntry>) -> bool {
    a.map(|e| &e.hash) == b.map(|e| &e.hash)
}

/// Metadata of the more recently modified side; theirs on ties.
fn pick_metadata<'a>(
    ours: Option<&'a ConversationRecord>,
    theirs: Option<&'a ConversationRecord>,
) -> Option<&'a ConversationRecord> {
    match (ours, theirs) {
        (Some(o), Some(t)) if o.last_modified > t.last_modified => Some(o),
        (_, Some(t)) => Some(t),
        (Some(o), None) => Some(o),
        (None, None) => None,
    }
}

/// Machine counters only grow, and each machine only advances its own, so the
/// field-wise maximum is the newest value.
fn merge_machine(ours: &MachineRecord, theirs: &MachineRecord) -> MachineRecord {
    let newer = if ours.last_sync >= theirs.last_sync {
        ours
    } else {
        theirs
    };
    let quota = match (ours.quota, theirs.quota) {
        (Some(o), Some(t)) => Some(if o.captured_at >= t.captured_at { o } else { t }),
        (o, t) => o.or(t),
    };
    MachineRecord {
        id: ours.id,
        name: newer.name.clone(),
        last_sync: ours.last_sync.max(theirs.last_sync),
        uploaded_bytes: ours.uploaded_bytes.max(theirs.uploaded_bytes),
        downloaded_bytes: ours.downloaded_bytes.max(theirs.downloaded_bytes),
        uploaded_files: ours.uploaded_files.max(theirs.uploaded_files),
        downloaded_files: ours.downloaded_files.max(theirs.downloaded_files),
        quota,
    }
}
