//! In-memory repository.
//!
//! # Concurrency Model
//!
//! - DashMap of per-book partitions, created lazily
//! - one parking_lot RwLock per partition guards blocks *and* history, so a
//!   write and its history entry are a single critical section
//! - a block-id index resolves `get(id)` without scanning books

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use quire_types::{Block, BlockId, BlockVersion, BookId};

use super::{apply_update, plan_rekey, sort_by_key, BlockRepository, Mutator};
use crate::error::{Error, Result};
use crate::history::{self, Change};

#[derive(Default)]
struct Partition {
    blocks: HashMap<BlockId, Block>,
    history: HashMap<BlockId, Vec<BlockVersion>>,
}

impl Partition {
    fn key_taken(&self, key: &str, except: Option<BlockId>) -> bool {
        self.blocks
            .values()
            .any(|b| b.order_key == key && Some(b.id) != except)
    }

    fn append(&mut self, block: &Block, change: Change) {
        let log = self.history.entry(block.id).or_default();
        let sequence = log.len() as u64 + 1;
        log.push(history::entry(block, change, sequence));
    }

    fn sorted(&self, filter: impl Fn(&Block) -> bool) -> Vec<Block> {
        let mut out: Vec<Block> = self.blocks.values().filter(|b| filter(b)).cloned().collect();
        sort_by_key(&mut out);
        out
    }
}

/// Block repository held entirely in memory.
#[derive(Default)]
pub struct MemoryRepository {
    books: DashMap<BookId, Arc<RwLock<Partition>>>,
    index: DashMap<BlockId, BookId>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, book_id: BookId) -> Arc<RwLock<Partition>> {
        self.books.entry(book_id).or_default().clone()
    }

    fn existing_partition(&self, book_id: BookId) -> Option<Arc<RwLock<Partition>>> {
        self.books.get(&book_id).map(|p| p.clone())
    }

    fn partition_of(&self, id: BlockId) -> Option<Arc<RwLock<Partition>>> {
        let book_id = *self.index.get(&id)?;
        self.existing_partition(book_id)
    }
}

impl BlockRepository for MemoryRepository {
    fn get(&self, id: BlockId) -> Result<Option<Block>> {
        Ok(self
            .partition_of(id)
            .and_then(|p| p.read().blocks.get(&id).cloned()))
    }

    fn list_active(&self, book_id: BookId) -> Result<Vec<Block>> {
        Ok(self
            .existing_partition(book_id)
            .map(|p| p.read().sorted(Block::is_active))
            .unwrap_or_default())
    }

    fn list_all(&self, book_id: BookId, include_deleted: bool) -> Result<Vec<Block>> {
        Ok(self
            .existing_partition(book_id)
            .map(|p| {
                p.read()
                    .sorted(|b| b.is_active() || (include_deleted && b.is_soft_deleted()))
            })
            .unwrap_or_default())
    }

    fn insert(&self, block: Block, change: Change) -> Result<Block> {
        quire_keys::validate_key(&block.order_key)?;
        let partition = self.partition(block.book_id);
        let mut guard = partition.write();
        if self.index.contains_key(&block.id) {
            return Err(Error::validation(format!("block {} already exists", block.id)));
        }
        if guard.key_taken(&block.order_key, None) {
            return Err(Error::validation(format!(
                "order key {} already used in book {}",
                block.order_key, block.book_id
            )));
        }
        guard.append(&block, change);
        guard.blocks.insert(block.id, block.clone());
        self.index.insert(block.id, block.book_id);
        Ok(block)
    }

    fn update(
        &self,
        id: BlockId,
        expected_version: u64,
        change: Change,
        mutator: Mutator<'_>,
    ) -> Result<Block> {
        let partition = self.partition_of(id).ok_or(Error::BlockNotFound(id))?;
        let mut guard = partition.write();
        let mut next = guard
            .blocks
            .get(&id)
            .cloned()
            .ok_or(Error::BlockNotFound(id))?;
        let old_key = next.order_key.clone();

        apply_update(&mut next, expected_version, change, mutator)?;
        if next.order_key != old_key && guard.key_taken(&next.order_key, Some(id)) {
            return Err(Error::validation(format!(
                "order key {} already used in book {}",
                next.order_key, next.book_id
            )));
        }

        guard.append(&next, change);
        guard.blocks.insert(id, next.clone());
        Ok(next)
    }

    fn rekey(
        &self,
        book_id: BookId,
        assignments: &[(BlockId, String)],
        at: u64,
    ) -> Result<Vec<Block>> {
        let partition = self.partition(book_id);
        let mut guard = partition.write();
        let current: Vec<Block> = guard.blocks.values().cloned().collect();
        let updated = plan_rekey(book_id, &current, assignments, at)?;

        let change = Change::new(quire_types::ChangeType::Reordered, at);
        for block in &updated {
            guard.append(block, change);
            guard.blocks.insert(block.id, block.clone());
        }
        Ok(updated)
    }

    fn versions(&self, id: BlockId) -> Result<Vec<BlockVersion>> {
        Ok(self
            .partition_of(id)
            .and_then(|p| p.read().history.get(&id).cloned())
            .unwrap_or_default())
    }

    fn keys(&self, book_id: BookId) -> Result<Vec<String>> {
        let Some(partition) = self.existing_partition(book_id) else {
            return Ok(Vec::new());
        };
        let mut keys: Vec<String> = partition
            .read()
            .blocks
            .values()
            .map(|b| b.order_key.clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    fn expired(&self, cutoff: u64) -> Result<Vec<Block>> {
        let partitions: Vec<_> = self.books.iter().map(|e| e.value().clone()).collect();
        let mut out: Vec<Block> = partitions
            .iter()
            .flat_map(|p| {
                p.read()
                    .blocks
                    .values()
                    .filter(|b| b.is_soft_deleted() && b.deleted_at.is_some_and(|t| t < cutoff))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by_key(|b| (b.deleted_at, b.id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    #[test]
    fn test_insert_get_list() {
        contract::insert_get_list(&MemoryRepository::new());
    }

    #[test]
    fn test_insert_rejects_bad_keys() {
        contract::insert_rejects_bad_keys(&MemoryRepository::new());
    }

    #[test]
    fn test_update_checks_version() {
        contract::update_checks_version(&MemoryRepository::new());
    }

    #[test]
    fn test_lifecycle_transitions() {
        contract::lifecycle_transitions(&MemoryRepository::new());
    }

    #[test]
    fn test_expired() {
        contract::expired_lists_old_soft_deletes(&MemoryRepository::new());
    }

    #[test]
    fn test_rekey_is_atomic() {
        contract::rekey_is_atomic(&MemoryRepository::new());
    }

    #[test]
    fn test_unknown_book_reads_are_empty() {
        let repo = MemoryRepository::new();
        let book = BookId::new();
        assert!(repo.list_active(book).unwrap().is_empty());
        assert!(repo.keys(book).unwrap().is_empty());
        assert!(repo.versions(BlockId::new()).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_updates_one_wins() {
        use quire_types::{BlockContent, ChangeType};

        let repo = Arc::new(MemoryRepository::new());
        let block = Block::new(BookId::new(), BlockContent::text("x"), "V", 1);
        let id = repo
            .insert(block, Change::new(ChangeType::Created, 1))
            .unwrap()
            .id;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = repo.clone();
                std::thread::spawn(move || {
                    repo.update(id, 1, Change::new(ChangeType::ContentUpdated, 2), &mut |b| {
                        b.content = Some(BlockContent::text(format!("writer {i}")));
                        Ok(())
                    })
                    .is_ok()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(repo.versions(id).unwrap().len(), 2);
    }
}
