//! Tests for model.rs: manifest serialization, tombstones and pruning.

use convsync_crypto::content_hash;
use convsync_sync::{
    ConversationRecord, ErrorKind, FileEntry, FileMap, MachineRecord, SyncManifest,
};
use convsync_types::{ConversationId, MachineId, Timestamp};
use pretty_assertions::assert_eq;

fn conv(id: &str) -> ConversationId {
    ConversationId::new(id).unwrap()
}

fn entry(content: &[u8]) -> FileEntry {
    FileEntry::new(content_hash(content), content.len() as u64)
}

fn record(id: &str, machine: MachineId, files: &[(&str, &[u8])], modified: u64) -> ConversationRecord {
    let mut record = ConversationRecord::new(conv(id), id, machine, Timestamp::from_millis(modified));
    for (path, content) in files {
        record.file_hashes.insert(path.to_string(), entry(content));
    }
    record
}

// ── FileEntry ───────────────────────────────────────────────────

#[test]
fn file_entries_compare_by_content() {
    let a = entry(b"hello").with_modified(Timestamp::from_millis(1));
    let b = entry(b"hello").with_modified(Timestamp::from_millis(2));
    assert_eq!(a, b);
    assert_ne!(a, entry(b"world"));
}

// ── ConversationRecord ──────────────────────────────────────────

#[test]
fn empty_record_is_tombstone() {
    let machine = MachineId::new();
    assert!(record("a", machine, &[], 1).is_tombstone());
    assert!(!record("a", machine, &[("x.md", b"x")], 1).is_tombstone());
}

#[test]
fn total_size_sums_files() {
    let r = record("a", MachineId::new(), &[("a", b"123"), ("b/c", b"45")], 1);
    assert_eq!(r.total_size(), 5);
}

#[test]
fn touch_updates_modifier() {
    let creator = MachineId::new();
    let editor = MachineId::new();
    let mut r = record("a", creator, &[], 1);
    r.touch(editor, Timestamp::from_millis(9));
    assert_eq!(r.created_by, creator);
    assert_eq!(r.modified_by, editor);
    assert_eq!(r.last_modified, Timestamp::from_millis(9));
}

// ── Serialization ───────────────────────────────────────────────

#[test]
fn record_serializes_camel_case_without_mtime() {
    let r = record("conv-1", MachineId::new(), &[("notes.md", b"hello")], 5);
    let json: serde_json::Value = serde_json::to_value(&r).unwrap();

    assert_eq!(json["id"], "conv-1");
    assert!(json.get("createdBy").is_some());
    assert!(json.get("lastModified").is_some());
    assert_eq!(
        json["fileHashes"]["notes.md"],
        serde_json::json!({ "hash": "5d41402abc4b2a76b9719d911017c592", "size": 5 })
    );
}

#[test]
fn manifest_json_roundtrip() {
    let machine = MachineId::new();
    let mut manifest = SyncManifest::new();
    manifest.upsert_conversation(record("a", machine, &[("x", b"1")], 1));
    manifest.upsert_conversation(record("b", machine, &[], 2));
    manifest.upsert_machine(MachineRecord::new(machine, "laptop"));

    let parsed = SyncManifest::from_json(&manifest.to_json().unwrap()).unwrap();
    assert_eq!(parsed, manifest);

    let value: serde_json::Value = serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
    assert!(value["conversations"].is_array());
    assert!(value["machines"].is_array());
}

#[test]
fn duplicate_conversation_ids_are_rejected() {
    let machine = MachineId::new();
    let r = serde_json::to_value(record("dup", machine, &[("x", b"1")], 1)).unwrap();
    let json = serde_json::json!({ "conversations": [r.clone(), r], "machines": [] });

    let err = SyncManifest::from_json(json.to_string().as_bytes()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ManifestConflict);
}

#[test]
fn missing_sections_default_to_empty() {
    let manifest = SyncManifest::from_json(b"{}").unwrap();
    assert!(manifest.is_empty());
}

#[test]
fn garbage_is_serialization_error() {
    let err = SyncManifest::from_json(b"not json").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Serialization);
}

// ── Queries ─────────────────────────────────────────────────────

#[test]
fn live_conversations_skip_tombstones() {
    let machine = MachineId::new();
    let mut manifest = SyncManifest::new();
    manifest.upsert_conversation(record("live", machine, &[("x", b"1")], 1));
    manifest.upsert_conversation(record("dead", machine, &[], 1));

    let live: Vec<&str> = manifest.live_conversations().map(|r| r.id.as_str()).collect();
    assert_eq!(live, vec!["live"]);
    assert_eq!(manifest.conversations().count(), 2);
    assert!(manifest.file(&conv("live"), "x").is_some());
    assert!(manifest.file(&conv("live"), "y").is_none());
}

#[test]
fn ensure_machine_creates_once() {
    let machine = MachineId::new();
    let mut manifest = SyncManifest::new();
    manifest.ensure_machine(machine, "desk").uploaded_files = 3;
    assert_eq!(manifest.ensure_machine(machine, "other").uploaded_files, 3);
    assert_eq!(manifest.machine(&machine).unwrap().name, "desk");
}

// ── Tombstone pruning ───────────────────────────────────────────

#[test]
fn tombstone_kept_until_every_machine_synced_past_it() {
    let a = MachineId::new();
    let b = MachineId::new();
    let mut manifest = SyncManifest::new();
    manifest.upsert_conversation(record("gone", a, &[], 100));

    let mut ma = MachineRecord::new(a, "a");
    ma.last_sync = Timestamp::from_millis(200);
    let mut mb = MachineRecord::new(b, "b");
    mb.last_sync = Timestamp::from_millis(50);
    manifest.upsert_machine(ma);
    manifest.upsert_machine(mb.clone());

    assert!(manifest.prune_tombstones().is_empty());
    assert!(manifest.conversation(&conv("gone")).is_some());

    mb.last_sync = Timestamp::from_millis(100);
    manifest.upsert_machine(mb);
    assert_eq!(manifest.prune_tombstones(), vec![conv("gone")]);
    assert!(manifest.conversation(&conv("gone")).is_none());
}

#[test]
fn pruning_leaves_live_conversations() {
    let a = MachineId::new();
    let mut manifest = SyncManifest::new();
    manifest.upsert_conversation(record("live", a, &[("x", b"1")], 1));
    let mut m = MachineRecord::new(a, "a");
    m.last_sync = Timestamp::from_millis(1_000);
    manifest.upsert_machine(m);

    assert!(manifest.prune_tombstones().is_empty());
    assert_eq!(manifest.conversations().count(), 1);
}

#[test]
fn pruning_without_machines_keeps_everything() {
    let mut manifest = SyncManifest::new();
    manifest.upsert_conversation(record("gone", MachineId::new(), &[], 0));
    assert!(manifest.prune_tombstones().is_empty());
}

#[test]
fn with_files_replaces_file_set() {
    let r = record("a", MachineId::new(), &[("x", b"1")], 1);
    let emptied = r.with_files(FileMap::new());
    assert!(emptied.is_tombstone());
    assert_eq!(emptied.title, r.title);
}
