//! Block Repository: durable storage of block records and their history.
//!
//! Writes are atomic per block: the block row and its history entry land
//! together or not at all. [`BlockRepository::rekey`] is the one multi-block
//! write and is atomic across the whole batch. Cross-block consistency for
//! everything else (neighbour reads, key choice) is the Ordering
//! Coordinator's job.
//!
//! Two backends:
//! - [`MemoryRepository`]: DashMap partitioned by book
//! - [`SqliteRepository`]: rusqlite, one transaction per write

mod memory;
mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

use quire_types::{Block, BlockId, BlockStatus, BlockVersion, BookId, ChangeType};

use crate::error::{Error, Result};
use crate::history::Change;

/// Mutator applied by [`BlockRepository::update`].
pub type Mutator<'a> = &'a mut dyn FnMut(&mut Block) -> Result<()>;

/// Storage contract for blocks and their append-only history.
///
/// Read paths never return purged blocks except [`get`](Self::get), which
/// returns any record so history and audits can resolve it.
pub trait BlockRepository: Send + Sync {
    /// Any block by id, regardless of status.
    fn get(&self, id: BlockId) -> Result<Option<Block>>;

    /// Active blocks of a book, ordered by key ascending.
    fn list_active(&self, book_id: BookId) -> Result<Vec<Block>>;

    /// Active blocks, plus soft-deleted ones when `include_deleted`, ordered
    /// by key ascending.
    fn list_all(&self, book_id: BookId, include_deleted: bool) -> Result<Vec<Block>>;

    /// Store a new block and its first history entry.
    fn insert(&self, block: Block, change: Change) -> Result<Block>;

    /// Apply `mutator` to the block if its version is `expected_version`.
    ///
    /// Bumps `version`, stamps `updated_at`, and appends the history entry
    /// for `change`. Fails with `VersionConflict` on a stale version.
    fn update(
        &self,
        id: BlockId,
        expected_version: u64,
        change: Change,
        mutator: Mutator<'_>,
    ) -> Result<Block>;

    /// Reassign keys of several blocks of one book in a single atomic write.
    /// Each touched block gets a `reordered` entry.
    fn rekey(&self, book_id: BookId, assignments: &[(BlockId, String)], at: u64)
    -> Result<Vec<Block>>;

    /// History of a block, oldest first.
    fn versions(&self, id: BlockId) -> Result<Vec<BlockVersion>>;

    /// Every key held by a block of the book, any status, sorted ascending.
    fn keys(&self, book_id: BookId) -> Result<Vec<String>>;

    /// Soft-deleted blocks (all books) deleted strictly before `cutoff`.
    fn expired(&self, cutoff: u64) -> Result<Vec<Block>>;

    fn soft_delete(&self, id: BlockId, expected_version: u64, at: u64) -> Result<Block> {
        let change = Change::new(ChangeType::SoftDeleted, at);
        self.update(id, expected_version, change, &mut |b| {
            require_status(b, BlockStatus::Active, change)?;
            b.status = BlockStatus::SoftDeleted;
            b.deleted_at = Some(at);
            Ok(())
        })
    }

    fn restore(&self, id: BlockId, expected_version: u64, at: u64) -> Result<Block> {
        let change = Change::new(ChangeType::Restored, at);
        self.update(id, expected_version, change, &mut |b| {
            require_status(b, BlockStatus::SoftDeleted, change)?;
            b.status = BlockStatus::Active;
            b.deleted_at = None;
            Ok(())
        })
    }

    /// Irreversible. Strips content, keeps metadata, key and history.
    fn purge(&self, id: BlockId, expected_version: u64, at: u64) -> Result<Block> {
        let change = Change::new(ChangeType::Purged, at);
        self.update(id, expected_version, change, &mut |b| {
            require_status(b, BlockStatus::SoftDeleted, change)?;
            b.status = BlockStatus::Purged;
            b.content = None;
            Ok(())
        })
    }
}

/// Fail with `InvalidTransition` unless the block is in `status`.
pub(crate) fn require_status(block: &Block, status: BlockStatus, change: Change) -> Result<()> {
    if block.status != status {
        return Err(Error::InvalidTransition {
            from: block.status,
            action: change.action(),
        });
    }
    Ok(())
}

/// Shared update path: checks, mutation, version bump.
///
/// Works on a copy owned by the caller; nothing is stored here.
pub(crate) fn apply_update(
    block: &mut Block,
    expected_version: u64,
    change: Change,
    mutator: Mutator<'_>,
) -> Result<()> {
    if block.is_purged() {
        return Err(Error::InvalidTransition {
            from: BlockStatus::Purged,
            action: change.action(),
        });
    }
    if block.version != expected_version {
        return Err(Error::VersionConflict {
            expected: expected_version,
            actual: block.version,
        });
    }
    let (id, book_id, created_at) = (block.id, block.book_id, block.created_at);
    mutator(block)?;
    if block.id != id || block.book_id != book_id || block.created_at != created_at {
        return Err(Error::validation("mutator changed an immutable field"));
    }
    quire_keys::validate_key(&block.order_key)?;
    block.version += 1;
    block.updated_at = change.occurred_at;
    Ok(())
}

/// Shared rekey path: the new state of every assigned block.
///
/// `current` is the book's full block set. Fails if an assignment names an
/// unknown or purged block, or if the resulting keys would collide.
pub(crate) fn plan_rekey(
    book_id: BookId,
    current: &[Block],
    assignments: &[(BlockId, String)],
    at: u64,
) -> Result<Vec<Block>> {
    let mut updated = Vec::with_capacity(assignments.len());
    for (id, key) in assignments {
        let block = current
            .iter()
            .find(|b| b.id == *id)
            .ok_or(Error::BlockNotFound(*id))?;
        if block.is_purged() {
            return Err(Error::InvalidTransition {
                from: BlockStatus::Purged,
                action: "reorder",
            });
        }
        quire_keys::validate_key(key)?;
        let mut next = block.clone();
        next.order_key = key.clone();
        next.version += 1;
        next.updated_at = at;
        updated.push(next);
    }

    let mut final_keys: Vec<&str> = current
        .iter()
        .map(|b| {
            updated
                .iter()
                .find(|u| u.id == b.id)
                .map_or(b.order_key.as_str(), |u| u.order_key.as_str())
        })
        .collect();
    final_keys.sort_unstable();
    if let Some(dup) = final_keys.windows(2).find(|w| w[0] == w[1]) {
        return Err(Error::validation(format!(
            "order key {} would be held twice in book {book_id}",
            dup[0]
        )));
    }
    Ok(updated)
}

fn sort_by_key(blocks: &mut [Block]) {
    blocks.sort_by(|a, b| a.order_key.cmp(&b.order_key));
}
