//! Tests for conflict.rs: state machine, detection, materialization, resolution.

use convsync_crypto::{content_hash, PassthroughCodec};
use convsync_sync::planner::plan;
use convsync_sync::remote::blob_key;
use convsync_sync::transfer::TransferContext;
use convsync_sync::{
    CancelFlag, ConflictCopy, ConflictResolver, ConflictState, ConversationRecord, Divergence,
    ErrorKind, FileEntry, LocalStore, LocalSyncState, MemoryBlobStore, PendingConflict,
    Reconciliation, RetryPolicy, SyncManifest, SyncSession,
};
use convsync_types::{ConversationId, MachineId, Timestamp};
use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tempfile::TempDir;

fn conv(id: &str) -> ConversationId {
    ConversationId::new(id).unwrap()
}

fn entry(content: &[u8]) -> FileEntry {
    FileEntry::new(content_hash(content), content.len() as u64)
}

struct Fixture {
    _dir: TempDir,
    local: LocalStore,
    store: Arc<MemoryBlobStore>,
    ctx: TransferContext,
    other: MachineId,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let local = LocalStore::new(dir.path());
    let store = Arc::new(MemoryBlobStore::new());
    let ctx = TransferContext {
        store: store.clone(),
        codec: Arc::new(PassthroughCodec),
        local: local.clone(),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        },
        cancel: CancelFlag::new(),
        session: SyncSession::detached(),
    };
    Fixture {
        _dir: dir,
        local,
        store,
        ctx,
        other: MachineId::new(),
    }
}

/// A remote record for `id` written by the other machine, with its blobs stored.
async fn remote_version(
    f: &Fixture,
    id: &str,
    files: &[(&str, &str)],
) -> ConversationRecord {
    let mut record = ConversationRecord::new(conv(id), "Remote title", f.other, Timestamp::EPOCH);
    for (path, content) in files {
        record.file_hashes.insert(path.to_string(), entry(content.as_bytes()));
        f.store
            .insert_raw(
                &blob_key(&conv(id), path, &content_hash(content.as_bytes())),
                content.as_bytes().to_vec(),
            )
            .await;
    }
    record
}

fn diverged_plan(id: &str, path: &str, local: &[u8], remote: &[u8]) -> convsync_sync::SyncPlan {
    plan(
        Reconciliation {
            conflicts: vec![Divergence {
                conversation: conv(id),
                path: path.into(),
                local: entry(local),
                remote: entry(remote),
            }],
            ..Reconciliation::default()
        },
        &HashMap::new(),
    )
}

fn manifest_with(record: ConversationRecord) -> SyncManifest {
    let mut manifest = SyncManifest::new();
    manifest.upsert_conversation(record);
    manifest
}

// ── State machine ───────────────────────────────────────────────

#[test]
fn allowed_transitions() {
    use ConflictState::*;
    for (from, to) in [
        (Clean, Diverged),
        (Diverged, ConflictMaterialized),
        (Diverged, ResolvedKeepLocal),
        (Diverged, ResolvedKeepRemote),
        (ConflictMaterialized, ResolvedKeepLocal),
        (ConflictMaterialized, ResolvedKeepRemote),
        (ResolvedKeepLocal, Clean),
        (ResolvedKeepRemote, Clean),
    ] {
        assert_eq!(from.transition(to).unwrap(), to);
    }
}

#[test]
fn rejected_transitions() {
    use ConflictState::*;
    for (from, to) in [
        (Clean, ConflictMaterialized),
        (Clean, ResolvedKeepLocal),
        (Diverged, Clean),
        (ConflictMaterialized, Clean),
        (ConflictMaterialized, Diverged),
        (ResolvedKeepLocal, ResolvedKeepRemote),
        (Clean, Clean),
    ] {
        let err = from.transition(to).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }
}

#[test]
fn conflict_copy_named_after_remote_editor() {
    let machine = MachineId::new();
    let record = ConversationRecord::new(conv("chat"), "t", machine, Timestamp::EPOCH);
    let copy = ConflictCopy::new(&record);
    assert_eq!(copy.id(), &conv("chat").conflict_copy(machine));
    assert_eq!(copy.origin, conv("chat"));
    assert_eq!(copy.id().conflict_origin(), Some((conv("chat"), machine)));
}

// ── Detection ───────────────────────────────────────────────────

#[tokio::test]
async fn detect_creates_one_conflict_per_conversation() {
    let f = fixture();
    let record = remote_version(&f, "c", &[("a", "theirs"), ("b", "same")]).await;
    let remote = manifest_with(record);
    let plan = diverged_plan("c", "a", b"mine", b"theirs");

    let resolver = ConflictResolver::new(f.local.clone());
    let found = resolver.detect(&plan, &remote, &BTreeMap::new()).unwrap();

    assert_eq!(found.len(), 1);
    let conflict = &found[0];
    assert_eq!(conflict.original, conv("c"));
    assert_eq!(conflict.copy, conv("c").conflict_copy(f.other));
    assert_eq!(conflict.paths, BTreeSet::from(["a".to_string()]));
    assert_eq!(conflict.state, ConflictState::Diverged);
}

#[tokio::test]
async fn detect_carries_previously_held_paths() {
    let f = fixture();
    let record = remote_version(&f, "c", &[("a", "theirs"), ("b", "theirs too")]).await;
    let remote = manifest_with(record.clone());

    let previous = PendingConflict {
        original: conv("c"),
        copy: conv("c").conflict_copy(f.other),
        machine: f.other,
        paths: BTreeSet::from(["b".to_string()]),
        remote: record,
        state: ConflictState::ConflictMaterialized,
        detected_at: Timestamp::EPOCH,
    };
    let existing = BTreeMap::from([(conv("c"), previous)]);

    let resolver = ConflictResolver::new(f.local.clone());
    let found = resolver
        .detect(&diverged_plan("c", "a", b"mine", b"theirs"), &remote, &existing)
        .unwrap();
    assert_eq!(
        found[0].paths,
        BTreeSet::from(["a".to_string(), "b".to_string()])
    );
}

#[tokio::test]
async fn detect_refreshes_stale_held_conflict() {
    let f = fixture();
    let old = remote_version(&f, "c", &[("a", "v1")]).await;
    let newer = remote_version(&f, "c", &[("a", "v2")]).await;

    let held = PendingConflict {
        original: conv("c"),
        copy: conv("c").conflict_copy(f.other),
        machine: f.other,
        paths: BTreeSet::from(["a".to_string()]),
        remote: old.clone(),
        state: ConflictState::ConflictMaterialized,
        detected_at: Timestamp::EPOCH,
    };
    let existing = BTreeMap::from([(conv("c"), held)]);
    let resolver = ConflictResolver::new(f.local.clone());
    let empty_plan = plan(Reconciliation::default(), &HashMap::new());

    // Unchanged remote: nothing new.
    let unchanged = resolver
        .detect(&empty_plan, &manifest_with(old), &existing)
        .unwrap();
    assert!(unchanged.is_empty());

    let refreshed = resolver
        .detect(&empty_plan, &manifest_with(newer.clone()), &existing)
        .unwrap();
    assert_eq!(refreshed.len(), 1);
    assert_eq!(refreshed[0].remote, newer);
    assert_eq!(refreshed[0].state, ConflictState::Diverged);
}

// ── Materialization ─────────────────────────────────────────────

#[tokio::test]
async fn materialize_writes_full_remote_version() {
    let f = fixture();
    let record = remote_version(&f, "c", &[("a", "theirs"), ("att/img", "png")]).await;
    let remote = manifest_with(record);
    let resolver = ConflictResolver::new(f.local.clone());
    let mut conflict = resolver
        .detect(&diverged_plan("c", "a", b"mine", b"theirs"), &remote, &BTreeMap::new())
        .unwrap()
        .remove(0);

    let copy = resolver.materialize(&f.ctx, &mut conflict).await.unwrap();

    assert_eq!(conflict.state, ConflictState::ConflictMaterialized);
    assert_eq!(copy.id(), &conflict.copy);
    assert_eq!(copy.record.file_hashes.len(), 2);
    assert_eq!(f.local.read_file(&conflict.copy, "a").await.unwrap(), b"theirs");
    assert_eq!(f.local.read_file(&conflict.copy, "att/img").await.unwrap(), b"png");
}

#[tokio::test]
async fn failed_materialize_leaves_no_partial_copy() {
    let f = fixture();
    let mut record = remote_version(&f, "c", &[("a", "present")]).await;
    // Listed in the manifest but never uploaded.
    record.file_hashes.insert("z".into(), entry(b"missing"));
    let remote = manifest_with(record);

    let resolver = ConflictResolver::new(f.local.clone());
    let mut conflict = resolver
        .detect(&diverged_plan("c", "a", b"mine", b"present"), &remote, &BTreeMap::new())
        .unwrap()
        .remove(0);

    let err = resolver.materialize(&f.ctx, &mut conflict).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!f.local.conversation_exists(&conflict.copy).await);
    assert_eq!(conflict.state, ConflictState::Diverged);
}

// ── Resolution ──────────────────────────────────────────────────

async fn materialized(f: &Fixture, state: &mut LocalSyncState) -> PendingConflict {
    f.local.write_file(&conv("c"), "a", b"mine").await.unwrap();
    f.local.write_file(&conv("c"), "only-local", b"x").await.unwrap();
    let record = remote_version(f, "c", &[("a", "theirs"), ("b", "extra")]).await;
    let remote = manifest_with(record);

    let resolver = ConflictResolver::new(f.local.clone());
    let mut conflict = resolver
        .detect(&diverged_plan("c", "a", b"mine", b"theirs"), &remote, &BTreeMap::new())
        .unwrap()
        .remove(0);
    resolver.materialize(&f.ctx, &mut conflict).await.unwrap();
    state.pending_conflicts.insert(conv("c"), conflict.clone());
    conflict
}

#[tokio::test]
async fn keep_local_discards_copy_and_agrees_on_remote_base() {
    let f = fixture();
    let mut state = LocalSyncState::new(MachineId::new(), "me");
    let conflict = materialized(&f, &mut state).await;

    let resolver = ConflictResolver::new(f.local.clone());
    let resolved = resolver.resolve(&mut state, &conv("c"), true).await.unwrap();

    assert_eq!(resolved, Some(ConflictState::ResolvedKeepLocal));
    assert!(!f.local.conversation_exists(&conflict.copy).await);
    assert_eq!(f.local.read_file(&conv("c"), "a").await.unwrap(), b"mine");
    assert!(state.pending_conflicts.is_empty());
    // The base now says "remote has theirs", so ours counts as a local edit.
    assert_eq!(
        state.last_known_remote.file(&conv("c"), "a"),
        Some(&entry(b"theirs"))
    );
}

#[tokio::test]
async fn keep_remote_replaces_original_with_copy() {
    let f = fixture();
    let mut state = LocalSyncState::new(MachineId::new(), "me");
    state.conversations.insert(
        conv("c"),
        convsync_sync::ConversationMeta::created_here(&conv("c"), state.machine_id, Timestamp::EPOCH),
    );
    let conflict = materialized(&f, &mut state).await;

    let resolver = ConflictResolver::new(f.local.clone());
    let resolved = resolver.resolve(&mut state, &conv("c"), false).await.unwrap();

    assert_eq!(resolved, Some(ConflictState::ResolvedKeepRemote));
    assert!(!f.local.conversation_exists(&conflict.copy).await);
    assert_eq!(f.local.read_file(&conv("c"), "a").await.unwrap(), b"theirs");
    assert_eq!(f.local.read_file(&conv("c"), "b").await.unwrap(), b"extra");
    assert_eq!(
        f.local
            .read_file(&conv("c"), "only-local")
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
    assert_eq!(state.conversations[&conv("c")].title, "Remote title");
    assert!(state.pending_conflicts.is_empty());
}

#[tokio::test]
async fn keep_remote_without_copy_fails() {
    let f = fixture();
    let mut state = LocalSyncState::new(MachineId::new(), "me");
    let conflict = materialized(&f, &mut state).await;
    f.local.remove_conversation(&conflict.copy).await.unwrap();

    let resolver = ConflictResolver::new(f.local.clone());
    let err = resolver
        .resolve(&mut state, &conv("c"), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(state.pending_conflicts.contains_key(&conv("c")));
}

#[tokio::test]
async fn resolving_twice_is_a_no_op() {
    let f = fixture();
    let mut state = LocalSyncState::new(MachineId::new(), "me");
    materialized(&f, &mut state).await;

    let resolver = ConflictResolver::new(f.local.clone());
    resolver.resolve(&mut state, &conv("c"), true).await.unwrap();
    assert_eq!(
        resolver.resolve(&mut state, &conv("c"), true).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn keeping_the_conflict_twice_is_a_no_op() {
    let f = fixture();
    let mut state = LocalSyncState::new(MachineId::new(), "me");
    let conflict = materialized(&f, &mut state).await;

    let resolver = ConflictResolver::new(f.local.clone());
    assert_eq!(
        resolver.resolve(&mut state, &conv("c"), false).await.unwrap(),
        Some(ConflictState::ResolvedKeepRemote)
    );
    let after_first = state.clone();

    assert_eq!(
        resolver.resolve(&mut state, &conv("c"), false).await.unwrap(),
        None
    );
    assert_eq!(state, after_first);
    assert!(!f.local.conversation_exists(&conflict.copy).await);
    assert_eq!(f.local.read_file(&conv("c"), "a").await.unwrap(), b"theirs");
    assert_eq!(f.local.read_file(&conv("c"), "b").await.unwrap(), b"extra");
}
