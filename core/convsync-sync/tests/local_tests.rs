//! Tests for local.rs: directory scanning, hash cache, atomic writes.

use convsync_crypto::content_hash;
use convsync_sync::local::{validate_relative_path, LocalStore, STATE_DIR};
use convsync_sync::ErrorKind;
use convsync_types::{ConversationId, MachineId};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use tempfile::TempDir;

fn conv(id: &str) -> ConversationId {
    ConversationId::new(id).unwrap()
}

fn setup() -> (TempDir, LocalStore) {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path());
    (dir, store)
}

// ── Paths ───────────────────────────────────────────────────────

#[test]
fn relative_paths_validated() {
    assert!(validate_relative_path("notes.md").is_ok());
    assert!(validate_relative_path("attachments/img 1.png").is_ok());
    assert!(validate_relative_path("").is_err());
    assert!(validate_relative_path("/etc/passwd").is_err());
    assert!(validate_relative_path("../escape").is_err());
    assert!(validate_relative_path("a/./b").is_err());
    assert!(validate_relative_path("a//b").is_err());
    assert!(validate_relative_path("a\\b").is_err());
}

#[test]
fn file_path_rejects_traversal() {
    let (_dir, store) = setup();
    let err = store.file_path(&conv("c"), "../../x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
}

// ── Listing ─────────────────────────────────────────────────────

#[tokio::test]
async fn lists_conversations_skipping_state_dir() {
    let (dir, store) = setup();
    std::fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
    std::fs::create_dir_all(dir.path().join("b")).unwrap();
    std::fs::create_dir_all(dir.path().join("a")).unwrap();
    std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

    let copy = conv("a").conflict_copy(MachineId::new());
    std::fs::create_dir_all(dir.path().join(copy.as_str())).unwrap();

    let listed = store.list_conversations().await.unwrap();
    assert_eq!(listed, vec![conv("a"), copy, conv("b")]);
}

#[tokio::test]
async fn missing_root_lists_nothing() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path().join("absent"));
    assert!(store.list_conversations().await.unwrap().is_empty());
}

#[tokio::test]
async fn lists_nested_files() {
    let (_dir, store) = setup();
    let id = conv("c");
    store.write_file(&id, "z.md", b"z").await.unwrap();
    store.write_file(&id, "attachments/a.png", b"png").await.unwrap();

    let files: Vec<String> = store
        .list_files(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert_eq!(files, vec!["attachments/a.png", "z.md"]);
}

// ── Write / read / delete ───────────────────────────────────────

#[tokio::test]
async fn write_then_read() {
    let (_dir, store) = setup();
    let id = conv("c");
    let written = store.write_file(&id, "notes.md", b"hello").await.unwrap();
    assert_eq!(written.size, 5);
    assert_eq!(store.read_file(&id, "notes.md").await.unwrap(), b"hello");
}

#[tokio::test]
async fn write_leaves_no_temp_files() {
    let (dir, store) = setup();
    let id = conv("c");
    store.write_file(&id, "a", b"1").await.unwrap();
    store.write_file(&id, "a", b"2").await.unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path().join("c"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["a"]);
}

#[tokio::test]
async fn read_missing_is_not_found() {
    let (_dir, store) = setup();
    let err = store.read_file(&conv("c"), "nope").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn delete_prunes_empty_directories() {
    let (dir, store) = setup();
    let id = conv("c");
    store.write_file(&id, "deep/nested/file", b"x").await.unwrap();
    store.delete_file(&id, "deep/nested/file").await.unwrap();

    assert!(!dir.path().join("c").exists());
    assert!(dir.path().exists());
    assert!(!store.conversation_exists(&id).await);
}

#[tokio::test]
async fn delete_keeps_non_empty_directories() {
    let (dir, store) = setup();
    let id = conv("c");
    store.write_file(&id, "keep", b"x").await.unwrap();
    store.write_file(&id, "sub/drop", b"y").await.unwrap();
    store.delete_file(&id, "sub/drop").await.unwrap();

    assert!(dir.path().join("c").join("keep").exists());
    assert!(!dir.path().join("c").join("sub").exists());
}

#[tokio::test]
async fn delete_missing_is_ok() {
    let (_dir, store) = setup();
    store.delete_file(&conv("c"), "ghost").await.unwrap();
}

#[tokio::test]
async fn remove_conversation_is_recursive_and_idempotent() {
    let (_dir, store) = setup();
    let id = conv("c");
    store.write_file(&id, "a/b/c", b"x").await.unwrap();
    store.remove_conversation(&id).await.unwrap();
    assert!(!store.conversation_exists(&id).await);
    store.remove_conversation(&id).await.unwrap();
}

// ── Hashing and scanning ────────────────────────────────────────

#[tokio::test]
async fn hash_file_matches_content_hash() {
    let (_dir, store) = setup();
    let id = conv("c");
    store.write_file(&id, "f", b"hello").await.unwrap();

    let hashed = store.hash_file(&id, "f").await.unwrap().unwrap();
    assert_eq!(hashed.hash, content_hash(b"hello"));
    assert_eq!(hashed.size, 5);
    assert!(store.hash_file(&id, "missing").await.unwrap().is_none());
}

#[tokio::test]
async fn scan_detects_changes_and_reuses_cache() {
    let (_dir, store) = setup();
    let id = conv("c");
    store.write_file(&id, "a", b"one").await.unwrap();

    let mut cache = BTreeMap::new();
    let first = store.scan(&id, &mut cache, false).await.unwrap();
    assert!(first.changed);
    assert_eq!(first.files["a"].hash, content_hash(b"one"));
    assert_eq!(cache.len(), 1);

    let second = store.scan(&id, &mut cache, false).await.unwrap();
    assert!(!second.changed);

    store.write_file(&id, "b", b"two").await.unwrap();
    let third = store.scan(&id, &mut cache, false).await.unwrap();
    assert!(third.changed);
    assert_eq!(third.files.len(), 2);

    store.delete_file(&id, "b").await.unwrap();
    let fourth = store.scan(&id, &mut cache, false).await.unwrap();
    assert!(fourth.changed);
    assert_eq!(fourth.files.len(), 1);
}

#[tokio::test]
async fn stale_cache_entry_is_not_trusted_with_force() {
    let (_dir, store) = setup();
    let id = conv("c");
    store.write_file(&id, "a", b"real").await.unwrap();

    let mut cache = BTreeMap::new();
    store.scan(&id, &mut cache, false).await.unwrap();
    // Poison the cache while keeping (mtime, size).
    let cached = cache.get_mut("a").unwrap();
    cached.hash = content_hash(b"fake");

    let trusted = store.scan(&id, &mut cache.clone(), false).await.unwrap();
    assert_eq!(trusted.files["a"].hash, content_hash(b"fake"));

    let forced = store.scan(&id, &mut cache, true).await.unwrap();
    assert_eq!(forced.files["a"].hash, content_hash(b"real"));
    assert!(forced.changed);
}
