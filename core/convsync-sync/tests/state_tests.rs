//! Tests for state.rs: persistence and base-state bookkeeping.

use convsync_crypto::content_hash;
use convsync_sync::{
    CachedHash, ConflictState, ConversationRecord, ErrorKind, FileEntry, LocalSyncState,
    PendingConflict,
};
use convsync_types::{ConversationId, MachineId, Timestamp};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use tempfile::TempDir;

fn conv(id: &str) -> ConversationId {
    ConversationId::new(id).unwrap()
}

fn entry(content: &str) -> FileEntry {
    FileEntry::new(content_hash(content.as_bytes()), content.len() as u64)
}

#[tokio::test]
async fn load_or_create_persists_identity() {
    let dir = TempDir::new().unwrap();
    let first = LocalSyncState::load_or_create(dir.path(), "laptop").await.unwrap();
    assert!(LocalSyncState::path_in(dir.path()).exists());

    let second = LocalSyncState::load_or_create(dir.path(), "renamed").await.unwrap();
    assert_eq!(first.machine_id, second.machine_id);
    assert_eq!(second.machine_name, "renamed");
}

#[tokio::test]
async fn load_missing_is_not_found() {
    let dir = TempDir::new().unwrap();
    let err = LocalSyncState::load(&LocalSyncState::path_in(dir.path()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn save_and_load_roundtrip() {
    let dir = TempDir::new().unwrap();
    let machine = MachineId::new();
    let mut state = LocalSyncState::new(machine, "desk");
    state.last_sync = Some(Timestamp::from_millis(42));
    state.record_local_file(
        &conv("c"),
        "a.md",
        CachedHash {
            hash: content_hash(b"a"),
            size: 1,
            modified: Timestamp::from_millis(7),
        },
    );

    let remote = ConversationRecord::new(conv("c"), "C", machine, Timestamp::from_millis(1));
    state.set_base_file(&remote, "a.md", Some(entry("a")));
    state.pending_conflicts.insert(
        conv("c"),
        PendingConflict {
            original: conv("c"),
            copy: conv("c").conflict_copy(machine),
            machine,
            paths: BTreeSet::from(["a.md".to_string()]),
            remote: remote.clone(),
            state: ConflictState::ConflictMaterialized,
            detected_at: Timestamp::from_millis(3),
        },
    );

    state.save(dir.path()).await.unwrap();
    let loaded = LocalSyncState::load(&LocalSyncState::path_in(dir.path()))
        .await
        .unwrap();
    assert_eq!(loaded, state);
}

#[test]
fn set_base_file_creates_and_clears() {
    let machine = MachineId::new();
    let mut state = LocalSyncState::new(machine, "m");
    let template = ConversationRecord::new(conv("c"), "Title", machine, Timestamp::EPOCH);

    // Clearing a path of an unknown conversation is a no-op.
    state.set_base_file(&template, "x", None);
    assert!(state.last_known_remote.conversation(&conv("c")).is_none());

    state.set_base_file(&template, "x", Some(entry("1")));
    state.set_base_file(&template, "y", Some(entry("2")));
    assert_eq!(state.last_known_remote.file(&conv("c"), "x"), Some(&entry("1")));
    assert_eq!(
        state.last_known_remote.conversation(&conv("c")).unwrap().title,
        "Title"
    );

    state.set_base_file(&template, "x", None);
    assert!(state.last_known_remote.file(&conv("c"), "x").is_none());
    assert!(state.last_known_remote.file(&conv("c"), "y").is_some());
}

#[test]
fn forget_local_file_drops_empty_conversations() {
    let mut state = LocalSyncState::new(MachineId::new(), "m");
    let cached = CachedHash {
        hash: content_hash(b""),
        size: 0,
        modified: Timestamp::EPOCH,
    };
    state.record_local_file(&conv("c"), "a", cached.clone());
    state.record_local_file(&conv("c"), "b", cached);

    state.forget_local_file(&conv("c"), "a");
    assert_eq!(state.hash_cache[&conv("c")].len(), 1);
    state.forget_local_file(&conv("c"), "b");
    assert!(state.hash_cache.is_empty());
}

#[test]
fn forget_conversation_drops_cache_and_metadata() {
    let mut state = LocalSyncState::new(MachineId::new(), "m");
    let cached = CachedHash {
        hash: content_hash(b"x"),
        size: 1,
        modified: Timestamp::EPOCH,
    };
    state.record_local_file(&conv("gone"), "a", cached.clone());
    state.record_local_file(&conv("kept"), "a", cached);
    let meta = state.meta_or_default(&conv("gone"), None, Timestamp::EPOCH);
    state.conversations.insert(conv("gone"), meta);

    state.forget_conversation(&conv("gone"));
    assert!(!state.hash_cache.contains_key(&conv("gone")));
    assert!(!state.conversations.contains_key(&conv("gone")));
    assert!(state.hash_cache.contains_key(&conv("kept")));
}

#[test]
fn held_paths_come_from_pending_conflicts() {
    let machine = MachineId::new();
    let mut state = LocalSyncState::new(machine, "m");
    assert!(state.held_paths().is_empty());

    state.pending_conflicts.insert(
        conv("c"),
        PendingConflict {
            original: conv("c"),
            copy: conv("c").conflict_copy(machine),
            machine,
            paths: BTreeSet::from(["a".to_string(), "b".to_string()]),
            remote: ConversationRecord::new(conv("c"), "c", machine, Timestamp::EPOCH),
            state: ConflictState::Diverged,
            detected_at: Timestamp::EPOCH,
        },
    );
    let held = state.held_paths();
    assert_eq!(held[&conv("c")].len(), 2);
}
