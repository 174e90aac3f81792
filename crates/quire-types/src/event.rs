//! Lifecycle notifications consumed by the Chronicle collaborator.

use serde::{Deserialize, Serialize};

use crate::ids::{BlockId, BookId};
use crate::version::ChangeType;

/// Notification kinds. Subjects are dot-separated for pattern subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    BlockCreated,
    BlockUpdated,
    BlockSoftDeleted,
    BlockRestored,
    BlockTypeChanged,
    BlockPurged,
}

impl LifecycleKind {
    /// The notification a change produces.
    pub fn for_change(change: ChangeType) -> Self {
        match change {
            ChangeType::Created => LifecycleKind::BlockCreated,
            ChangeType::ContentUpdated | ChangeType::Reordered => LifecycleKind::BlockUpdated,
            ChangeType::TypeChanged => LifecycleKind::BlockTypeChanged,
            ChangeType::SoftDeleted => LifecycleKind::BlockSoftDeleted,
            ChangeType::Restored => LifecycleKind::BlockRestored,
            ChangeType::Purged => LifecycleKind::BlockPurged,
        }
    }

    /// Wire name, e.g. `block_soft_deleted`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleKind::BlockCreated => "block_created",
            LifecycleKind::BlockUpdated => "block_updated",
            LifecycleKind::BlockSoftDeleted => "block_soft_deleted",
            LifecycleKind::BlockRestored => "block_restored",
            LifecycleKind::BlockTypeChanged => "block_type_changed",
            LifecycleKind::BlockPurged => "block_purged",
        }
    }

    /// Bus subject, e.g. `block.soft_deleted`.
    pub fn subject(&self) -> &'static str {
        match self {
            LifecycleKind::BlockCreated => "block.created",
            LifecycleKind::BlockUpdated => "block.updated",
            LifecycleKind::BlockSoftDeleted => "block.soft_deleted",
            LifecycleKind::BlockRestored => "block.restored",
            LifecycleKind::BlockTypeChanged => "block.type_changed",
            LifecycleKind::BlockPurged => "block.purged",
        }
    }
}

impl std::fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A lifecycle transition, emitted after the mutation and its history entry
/// are durable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub block_id: BlockId,
    pub book_id: BookId,
    pub change_type: ChangeType,
    /// Unix millis.
    pub occurred_at: u64,
}

impl LifecycleEvent {
    pub fn new(block_id: BlockId, book_id: BookId, change_type: ChangeType, occurred_at: u64) -> Self {
        Self {
            kind: LifecycleKind::for_change(change_type),
            block_id,
            book_id,
            change_type,
            occurred_at,
        }
    }

    pub fn subject(&self) -> &'static str {
        self.kind.subject()
    }
}
