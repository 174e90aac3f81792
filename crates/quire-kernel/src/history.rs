//! History Recorder.
//!
//! Every repository write carries a [`Change`]; the backend turns it into the
//! next [`BlockVersion`] in the same unit of work as the block write, so a
//! block's history can never diverge from its state. If the entry cannot be
//! stored, the whole write fails.

use quire_types::{Block, BlockId, BlockVersion, ChangeType, VersionSnapshot};

use crate::error::{Error, Result};
use crate::repository::BlockRepository;

/// What a write records in history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Change {
    pub change_type: ChangeType,
    /// Unix millis.
    pub occurred_at: u64,
}

impl Change {
    pub fn new(change_type: ChangeType, occurred_at: u64) -> Self {
        Self {
            change_type,
            occurred_at,
        }
    }

    /// Verb used in transition errors.
    pub fn action(&self) -> &'static str {
        match self.change_type {
            ChangeType::Created => "create",
            ChangeType::ContentUpdated => "update",
            ChangeType::TypeChanged => "convert",
            ChangeType::Reordered => "reorder",
            ChangeType::SoftDeleted => "soft-delete",
            ChangeType::Restored => "restore",
            ChangeType::Purged => "purge",
        }
    }
}

/// The history entry for `block` as it stands after `change`.
pub fn entry(block: &Block, change: Change, sequence: u64) -> BlockVersion {
    BlockVersion {
        block_id: block.id,
        book_id: block.book_id,
        sequence,
        change_type: change.change_type,
        snapshot: VersionSnapshot::of(block),
        block_version: block.version,
        occurred_at: change.occurred_at,
    }
}

/// Sequences run 1, 2, 3, ... with no gaps.
pub fn is_contiguous(versions: &[BlockVersion]) -> bool {
    versions
        .iter()
        .enumerate()
        .all(|(i, v)| v.sequence == i as u64 + 1)
}

/// Full history of a block, oldest first. Works for purged blocks.
pub fn history(repo: &dyn BlockRepository, id: BlockId) -> Result<Vec<BlockVersion>> {
    let versions = repo.versions(id)?;
    if versions.is_empty() && repo.get(id)?.is_none() {
        return Err(Error::BlockNotFound(id));
    }
    Ok(versions)
}
