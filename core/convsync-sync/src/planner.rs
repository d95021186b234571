//! Differential planning: turns a reconciliation into ordered per-conversation
//! work.

use crate::reconcile::{Divergence, FileRef, Reconciliation};
use convsync_types::{ContentHash, ConversationId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// What a planned operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
}

impl OpKind {
    /// Uploads and downloads move bytes; deletions do not.
    pub fn is_transfer(self) -> bool {
        matches!(self, OpKind::Upload | OpKind::Download)
    }
}

/// One file operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOp {
    pub kind: OpKind,
    pub conversation: ConversationId,
    pub path: String,
    /// Content moved by a transfer, or content expected at the deleted path.
    pub hash: ContentHash,
    pub size: u64,
    /// Local hash when the plan was made; a download or local delete only
    /// proceeds if the file still has it.
    pub local_hash: Option<ContentHash>,
}

impl PlannedOp {
    fn from_ref(kind: OpKind, file: FileRef) -> Self {
        Self {
            kind,
            conversation: file.conversation,
            path: file.path,
            hash: file.hash,
            size: file.size,
            local_hash: file.local_hash,
        }
    }
}

/// Work for a single conversation, executed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationPlan {
    pub conversation: ConversationId,
    pub ops: Vec<PlannedOp>,
    /// Diverged files, routed to the conflict resolver instead of transferred.
    pub divergences: Vec<Divergence>,
}

impl ConversationPlan {
    fn new(conversation: ConversationId) -> Self {
        Self {
            conversation,
            ops: Vec::new(),
            divergences: Vec::new(),
        }
    }

    pub fn bytes(&self, kind: OpKind) -> u64 {
        self.ops.iter().filter(|op| op.kind == kind).map(|op| op.size).sum()
    }

    pub fn count(&self, kind: OpKind) -> usize {
        self.ops.iter().filter(|op| op.kind == kind).count()
    }

    fn sort(&mut self) {
        // Transfers smallest first, then deletions; ties by path.
        self.ops.sort_by(|a, b| {
            (!a.kind.is_transfer(), a.size, &a.path, a.kind)
                .cmp(&(!b.kind.is_transfer(), b.size, &b.path, b.kind))
        });
        self.divergences.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

/// The whole cycle's work, conversations ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub conversations: Vec<ConversationPlan>,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub upload_files: usize,
    pub download_files: usize,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Number of file operations across all conversations.
    pub fn total_ops(&self) -> usize {
        self.conversations.iter().map(|c| c.ops.len()).sum()
    }

    pub fn divergence_count(&self) -> usize {
        self.conversations.iter().map(|c| c.divergences.len()).sum()
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&ConversationPlan> {
        self.conversations.iter().find(|c| &c.conversation == id)
    }
}

/// Builds a plan, leaving out paths held by pending conflicts.
pub fn plan(
    reconciliation: Reconciliation,
    held: &HashMap<ConversationId, BTreeSet<String>>,
) -> SyncPlan {
    let is_held = |conversation: &ConversationId, path: &str| {
        held.get(conversation).is_some_and(|paths| paths.contains(path))
    };

    let mut by_id: BTreeMap<ConversationId, ConversationPlan> = BTreeMap::new();
    let Reconciliation {
        to_upload,
        to_download,
        to_delete_local,
        to_delete_remote,
        conflicts,
    } = reconciliation;

    let ops = to_upload
        .into_iter()
        .map(|f| (OpKind::Upload, f))
        .chain(to_download.into_iter().map(|f| (OpKind::Download, f)))
        .chain(to_delete_local.into_iter().map(|f| (OpKind::DeleteLocal, f)))
        .chain(to_delete_remote.into_iter().map(|f| (OpKind::DeleteRemote, f)));

    for (kind, file) in ops {
        if is_held(&file.conversation, &file.path) {
            continue;
        }
        by_id
            .entry(file.conversation.clone())
            .or_insert_with(|| ConversationPlan::new(file.conversation.clone()))
            .ops
            .push(PlannedOp::from_ref(kind, file));
    }

    for divergence in conflicts {
        if is_held(&divergence.conversation, &divergence.path) {
            continue;
        }
        by_id
            .entry(divergence.conversation.clone())
            .or_insert_with(|| ConversationPlan::new(divergence.conversation.clone()))
            .divergences
            .push(divergence);
    }

    let mut plan = SyncPlan::default();
    for (_, mut conversation) in by_id {
        conversation.sort();
        plan.upload_bytes += conversation.bytes(OpKind::Upload);
        plan.download_bytes += conversation.bytes(OpKind::Download);
        plan.upload_files += conversation.count(OpKind::Upload);
        plan.download_files += conversation.count(OpKind::Download);
        plan.conversations.push(conversation);
    }
    plan
}
