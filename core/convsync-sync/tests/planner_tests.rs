//! Tests for planner.rs: ordering, totals and held paths.

use convsync_crypto::content_hash;
use convsync_sync::planner::plan;
use convsync_sync::{Divergence, FileEntry, FileRef, OpKind, Reconciliation};
use convsync_types::ConversationId;
use pretty_assertions::assert_eq;
use std::collections::{BTreeSet, HashMap};

fn conv(id: &str) -> ConversationId {
    ConversationId::new(id).unwrap()
}

fn file(id: &str, path: &str, size: u64) -> FileRef {
    FileRef {
        conversation: conv(id),
        path: path.to_string(),
        hash: content_hash(path.as_bytes()),
        size,
        local_hash: None,
    }
}

fn divergence(id: &str, path: &str) -> Divergence {
    Divergence {
        conversation: conv(id),
        path: path.to_string(),
        local: FileEntry::new(content_hash(b"local"), 5),
        remote: FileEntry::new(content_hash(b"remote"), 6),
    }
}

#[test]
fn transfers_smallest_first_then_deletions() {
    let reconciliation = Reconciliation {
        to_upload: vec![file("c", "big", 300), file("c", "small", 10)],
        to_download: vec![file("c", "medium", 100)],
        to_delete_local: vec![file("c", "gone-local", 1)],
        to_delete_remote: vec![file("c", "gone-remote", 0)],
        conflicts: vec![],
    };
    let plan = plan(reconciliation, &HashMap::new());

    let order: Vec<(&str, OpKind)> = plan.conversations[0]
        .ops
        .iter()
        .map(|op| (op.path.as_str(), op.kind))
        .collect();
    assert_eq!(
        order,
        vec![
            ("small", OpKind::Upload),
            ("medium", OpKind::Download),
            ("big", OpKind::Upload),
            ("gone-remote", OpKind::DeleteRemote),
            ("gone-local", OpKind::DeleteLocal),
        ]
    );
}

#[test]
fn equal_sizes_ordered_by_path() {
    let reconciliation = Reconciliation {
        to_upload: vec![file("c", "b", 10), file("c", "a", 10)],
        ..Reconciliation::default()
    };
    let plan = plan(reconciliation, &HashMap::new());
    let order: Vec<&str> = plan.conversations[0].ops.iter().map(|op| op.path.as_str()).collect();
    assert_eq!(order, vec!["a", "b"]);
}

#[test]
fn conversations_ordered_by_id_with_totals() {
    let reconciliation = Reconciliation {
        to_upload: vec![file("z", "a", 10), file("a", "a", 5)],
        to_download: vec![file("m", "a", 7), file("m", "b", 3)],
        ..Reconciliation::default()
    };
    let plan = plan(reconciliation, &HashMap::new());

    let ids: Vec<&str> = plan.conversations.iter().map(|c| c.conversation.as_str()).collect();
    assert_eq!(ids, vec!["a", "m", "z"]);
    assert_eq!(plan.upload_bytes, 15);
    assert_eq!(plan.upload_files, 2);
    assert_eq!(plan.download_bytes, 10);
    assert_eq!(plan.download_files, 2);
    assert_eq!(plan.total_ops(), 4);
    assert_eq!(plan.conversation(&conv("m")).unwrap().bytes(OpKind::Download), 10);
}

#[test]
fn divergences_never_become_transfers() {
    let reconciliation = Reconciliation {
        to_upload: vec![file("c", "other", 1)],
        conflicts: vec![divergence("c", "shared")],
        ..Reconciliation::default()
    };
    let plan = plan(reconciliation, &HashMap::new());

    let c = plan.conversation(&conv("c")).unwrap();
    assert_eq!(c.divergences.len(), 1);
    assert!(c.ops.iter().all(|op| op.path != "shared"));
    assert_eq!(plan.divergence_count(), 1);
}

#[test]
fn held_paths_are_excluded() {
    let held = HashMap::from([(conv("c"), BTreeSet::from(["held".to_string()]))]);
    let reconciliation = Reconciliation {
        to_upload: vec![file("c", "held", 1), file("c", "free", 1)],
        conflicts: vec![divergence("c", "held")],
        ..Reconciliation::default()
    };
    let plan = plan(reconciliation, &held);

    let c = plan.conversation(&conv("c")).unwrap();
    let paths: Vec<&str> = c.ops.iter().map(|op| op.path.as_str()).collect();
    assert_eq!(paths, vec!["free"]);
    assert!(c.divergences.is_empty());
}

#[test]
fn empty_reconciliation_is_empty_plan() {
    let plan = plan(Reconciliation::default(), &HashMap::new());
    assert!(plan.is_empty());
    assert_eq!(plan.total_ops(), 0);
}

#[test]
fn op_kind_helpers() {
    assert!(OpKind::Upload.is_transfer());
    assert!(OpKind::Download.is_transfer());
    assert!(!OpKind::DeleteLocal.is_transfer());
}
