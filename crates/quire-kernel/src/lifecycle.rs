//! Lifecycle Manager: the block state machine, key placement, duplication,
//! type conversion and rebalancing.
//!
//! ```text
//! create ──► active ──soft_delete──► soft_deleted ──purge──► purged
//!              ▲                          │
//!              └──────── restore ─────────┘   (within retention window)
//! ```
//!
//! Every operation validates and fails before writing, except for version
//! conflicts, which the repository detects at write time. Callers are
//! expected to hold the book's coordinator token: structural operations
//! read neighbour keys and assume nobody moves them in between.

use std::collections::HashSet;
use std::sync::Arc;

use quire_keys::{average_len, initial_key, key_after, key_before, key_between, spaced_keys_after};
use quire_types::{Block, BlockContent, BlockId, BlockStatus, BlockType, BookId, ChangeType};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::convert::ConversionRegistry;
use crate::error::{Error, Result};
use crate::history::Change;
use crate::repository::{require_status, BlockRepository};
use crate::schema;

/// Where a new block goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    /// After the last block.
    Append,
    /// Before the first block.
    Prepend,
    /// Immediately before an active block of the same book.
    Before(BlockId),
}

pub struct Lifecycle {
    repo: Arc<dyn BlockRepository>,
    conversions: ConversionRegistry,
    clock: Arc<dyn Clock>,
    retention_millis: u64,
    rebalance_threshold: usize,
}

impl Lifecycle {
    pub fn new(
        repo: Arc<dyn BlockRepository>,
        conversions: ConversionRegistry,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            repo,
            conversions,
            clock,
            retention_millis: config.retention_millis(),
            rebalance_threshold: config.rebalance_threshold,
        }
    }

    /// Any block by id, purged included.
    pub fn load(&self, id: BlockId) -> Result<Block> {
        self.repo.get(id)?.ok_or(Error::BlockNotFound(id))
    }

    pub fn create(
        &self,
        book_id: BookId,
        block_type: BlockType,
        content: BlockContent,
        position: Position,
    ) -> Result<Block> {
        schema::validate(block_type, &content)?;
        let key = self.key_for(book_id, position)?;
        let now = self.clock.now_millis();
        let block = self.repo.insert(
            Block::new(book_id, content, key, now),
            Change::new(ChangeType::Created, now),
        )?;
        tracing::debug!(book_id = %book_id, block_id = %block.id, key = %block.order_key, "block created");
        Ok(block)
    }

    pub fn update_content(
        &self,
        id: BlockId,
        content: BlockContent,
        expected_version: u64,
    ) -> Result<Block> {
        let current = self.load(id)?;
        let change = Change::new(ChangeType::ContentUpdated, self.clock.now_millis());
        require_status(&current, BlockStatus::Active, change)?;
        schema::validate(current.block_type, &content)?;

        let block = self.repo.update(id, expected_version, change, &mut |b| {
            b.content = Some(content.clone());
            Ok(())
        })?;
        tracing::debug!(book_id = %block.book_id, block_id = %id, version = block.version, "content updated");
        Ok(block)
    }

    pub fn convert_type(
        &self,
        id: BlockId,
        target: BlockType,
        expected_version: u64,
    ) -> Result<Block> {
        let current = self.load(id)?;
        let change = Change::new(ChangeType::TypeChanged, self.clock.now_millis());
        require_status(&current, BlockStatus::Active, change)?;
        let content = current
            .content
            .as_ref()
            .ok_or_else(|| Error::Storage(format!("active block {id} has no content")))?;
        let converted = self.conversions.convert(content, target)?;
        schema::validate(target, &converted)?;

        let block = self.repo.update(id, expected_version, change, &mut |b| {
            b.block_type = target;
            b.content = Some(converted.clone());
            Ok(())
        })?;
        tracing::debug!(
            book_id = %block.book_id,
            block_id = %id,
            from = %current.block_type,
            to = %target,
            "type converted"
        );
        Ok(block)
    }

    /// Copy an active block to a new block right after it. The source is
    /// left untouched.
    pub fn duplicate(&self, id: BlockId) -> Result<Block> {
        let source = self.load(id)?;
        let now = self.clock.now_millis();
        require_status(&source, BlockStatus::Active, Change::new(ChangeType::Created, now))?;
        let content = source
            .content
            .clone()
            .ok_or_else(|| Error::Storage(format!("active block {id} has no content")))?;

        let keys = self.repo.keys(source.book_id)?;
        let next = keys
            .iter()
            .find(|k| k.as_str() > source.order_key.as_str());
        let key = match next {
            Some(next) => key_between(&source.order_key, next)?,
            None => key_after(&source.order_key)?,
        };

        let block = self.repo.insert(
            Block::new(source.book_id, content, key, now),
            Change::new(ChangeType::Created, now),
        )?;
        tracing::debug!(book_id = %block.book_id, source = %id, block_id = %block.id, "block duplicated");
        Ok(block)
    }

    /// Move an active block before `before` (or to the tail). Only the key
    /// and version change.
    pub fn reorder(
        &self,
        id: BlockId,
        before: Option<BlockId>,
        expected_version: u64,
    ) -> Result<Block> {
        let current = self.load(id)?;
        let change = Change::new(ChangeType::Reordered, self.clock.now_millis());
        require_status(&current, BlockStatus::Active, change)?;
        if before == Some(id) {
            return Err(Error::validation("cannot place a block before itself"));
        }
        if current.version != expected_version {
            return Err(Error::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }

        let position = before.map_or(Position::Append, Position::Before);
        let key = self.key_for(current.book_id, position)?;
        let block = self.repo.update(id, expected_version, change, &mut |b| {
            b.order_key = key.clone();
            Ok(())
        })?;
        tracing::debug!(book_id = %block.book_id, block_id = %id, key = %block.order_key, "block reordered");
        Ok(block)
    }

    pub fn soft_delete(&self, id: BlockId, expected_version: u64) -> Result<Block> {
        let current = self.load(id)?;
        let now = self.clock.now_millis();
        require_status(&current, BlockStatus::Active, Change::new(ChangeType::SoftDeleted, now))?;
        let block = self.repo.soft_delete(id, expected_version, now)?;
        tracing::debug!(book_id = %block.book_id, block_id = %id, "block soft-deleted");
        Ok(block)
    }

    /// Bring a soft-deleted block back at its original position. Fails with
    /// `RetentionExpired` once the window has passed.
    pub fn restore(&self, id: BlockId, expected_version: u64) -> Result<Block> {
        let current = self.load(id)?;
        let now = self.clock.now_millis();
        require_status(&current, BlockStatus::SoftDeleted, Change::new(ChangeType::Restored, now))?;
        if let Some(deleted_at) = current.deleted_at {
            if self.is_expired(deleted_at, now) {
                return Err(Error::RetentionExpired {
                    block_id: id,
                    deleted_at,
                });
            }
        }
        let block = self.repo.restore(id, expected_version, now)?;
        tracing::debug!(book_id = %block.book_id, block_id = %id, "block restored");
        Ok(block)
    }

    /// Purge a soft-deleted block now, regardless of the retention window.
    pub fn purge(&self, id: BlockId, expected_version: u64) -> Result<Block> {
        let current = self.load(id)?;
        let now = self.clock.now_millis();
        require_status(&current, BlockStatus::SoftDeleted, Change::new(ChangeType::Purged, now))?;
        let block = self.repo.purge(id, expected_version, now)?;
        tracing::debug!(book_id = %block.book_id, block_id = %id, "block purged");
        Ok(block)
    }

    /// Soft-deleted blocks whose retention window has elapsed.
    pub fn expired(&self) -> Result<Vec<Block>> {
        let now = self.clock.now_millis();
        self.repo.expired(now.saturating_sub(self.retention_millis))
    }

    /// Purge `id` if it is still soft-deleted and past its window.
    pub fn purge_if_expired(&self, id: BlockId) -> Result<Option<Block>> {
        let current = self.load(id)?;
        let now = self.clock.now_millis();
        let expired = current.is_soft_deleted()
            && current.deleted_at.is_some_and(|t| self.is_expired(t, now));
        if !expired {
            return Ok(None);
        }
        let block = self.repo.purge(id, current.version, now)?;
        tracing::debug!(book_id = %block.book_id, block_id = %id, "expired block purged");
        Ok(Some(block))
    }

    fn is_expired(&self, deleted_at: u64, now: u64) -> bool {
        now.saturating_sub(deleted_at) > self.retention_millis
    }

    /// Whether the book's active keys have grown past the threshold.
    pub fn needs_rebalance(&self, book_id: BookId) -> Result<bool> {
        let active = self.repo.list_active(book_id)?;
        if active.is_empty() {
            return Ok(false);
        }
        let avg = average_len(active.iter().map(|b| b.order_key.as_str()));
        Ok(avg > self.rebalance_threshold as f64)
    }

    /// Renumber every active and soft-deleted block of the book to short,
    /// evenly spaced keys, preserving relative order. Purged keys are never
    /// handed out again. Returns the blocks whose key changed.
    pub fn rebalance(&self, book_id: BookId) -> Result<Vec<Block>> {
        self.plan_and_rekey(book_id).map_err(|e| match e {
            Error::Rebalance { .. } => e,
            other => Error::Rebalance {
                book_id,
                reason: other.to_string(),
            },
        })
    }

    fn plan_and_rekey(&self, book_id: BookId) -> Result<Vec<Block>> {
        let live = self.repo.list_all(book_id, true)?;
        if live.is_empty() {
            return Ok(Vec::new());
        }
        let live_keys: HashSet<&str> = live.iter().map(|b| b.order_key.as_str()).collect();
        let retired: HashSet<String> = self
            .repo
            .keys(book_id)?
            .into_iter()
            .filter(|k| !live_keys.contains(k.as_str()))
            .collect();

        let mut fresh = spaced_keys_after(None, live.len())?;
        for i in 0..fresh.len() {
            while retired.contains(&fresh[i]) {
                fresh[i] = match fresh.get(i + 1) {
                    Some(next) => key_between(&fresh[i], next)?,
                    None => key_after(&fresh[i])?,
                };
            }
        }

        let assignments: Vec<(BlockId, String)> = live
            .iter()
            .zip(fresh)
            .filter(|(b, key)| b.order_key != *key)
            .map(|(b, key)| (b.id, key))
            .collect();
        if assignments.is_empty() {
            return Ok(Vec::new());
        }

        let blocks = self
            .repo
            .rekey(book_id, &assignments, self.clock.now_millis())?;
        tracing::info!(book_id = %book_id, renumbered = blocks.len(), "book rebalanced");
        Ok(blocks)
    }

    /// A key for a new block at `position`.
    ///
    /// Neighbours are taken from every key the book has issued, any status,
    /// so the new key never collides with a retained or retired one.
    fn key_for(&self, book_id: BookId, position: Position) -> Result<String> {
        let keys = self.repo.keys(book_id)?;
        let key = match position {
            Position::Append => match keys.last() {
                Some(max) => key_after(max)?,
                None => initial_key(),
            },
            Position::Prepend => match keys.first() {
                Some(min) => key_before(min)?,
                None => initial_key(),
            },
            Position::Before(anchor_id) => {
                let anchor = self
                    .repo
                    .get(anchor_id)?
                    .filter(|b| b.book_id == book_id && b.is_active())
                    .ok_or(Error::BlockNotFound(anchor_id))?;
                let idx = keys.partition_point(|k| k.as_str() < anchor.order_key.as_str());
                match idx.checked_sub(1).map(|i| &keys[i]) {
                    Some(prev) => key_between(prev, &anchor.order_key)?,
                    None => key_before(&anchor.order_key)?,
                }
            }
        };
        Ok(key)
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("retention_millis", &self.retention_millis)
            .field("rebalance_threshold", &self.rebalance_threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::repository::MemoryRepository;
    use std::time::Duration;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    struct Fixture {
        lifecycle: Lifecycle,
        repo: Arc<MemoryRepository>,
        clock: Arc<ManualClock>,
        book: BookId,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let lifecycle = Lifecycle::new(
            repo.clone(),
            ConversionRegistry::standard(),
            clock.clone(),
            &config,
        );
        Fixture {
            lifecycle,
            repo,
            clock,
            book: BookId::new(),
        }
    }

    fn text(f: &Fixture, s: &str, position: Position) -> Block {
        f.lifecycle
            .create(f.book, BlockType::Text, BlockContent::text(s), position)
            .unwrap()
    }

    fn order(f: &Fixture) -> Vec<String> {
        f.repo
            .list_active(f.book)
            .unwrap()
            .into_iter()
            .map(|b| match b.content {
                Some(BlockContent::Text { text }) => text,
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_create_positions() {
        let f = fixture(EngineConfig::default());
        let b = text(&f, "B", Position::Append);
        assert_eq!(b.order_key, "V");
        text(&f, "D", Position::Append);
        text(&f, "A", Position::Prepend);
        text(&f, "C", Position::Before(f.repo.list_active(f.book).unwrap()[2].id));
        assert_eq!(order(&f), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_create_rejects_mismatched_content() {
        let f = fixture(EngineConfig::default());
        let err = f
            .lifecycle
            .create(f.book, BlockType::Heading, BlockContent::text("x"), Position::Append)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(f.repo.keys(f.book).unwrap().is_empty());
    }

    #[test]
    fn test_before_unknown_anchor() {
        let f = fixture(EngineConfig::default());
        let missing = BlockId::new();
        let err = f
            .lifecycle
            .create(f.book, BlockType::Text, BlockContent::text("x"), Position::Before(missing))
            .unwrap_err();
        assert!(matches!(err, Error::BlockNotFound(id) if id == missing));
    }

    #[test]
    fn test_update_content_validates_against_current_type() {
        let f = fixture(EngineConfig::default());
        let h = f
            .lifecycle
            .create(f.book, BlockType::Heading, BlockContent::heading(1, "T"), Position::Append)
            .unwrap();
        let err = f
            .lifecycle
            .update_content(h.id, BlockContent::text("t"), 1)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let ok = f
            .lifecycle
            .update_content(h.id, BlockContent::heading(2, "New"), 1)
            .unwrap();
        assert_eq!(ok.version, 2);

        let stale = f
            .lifecycle
            .update_content(h.id, BlockContent::heading(2, "Newer"), 1)
            .unwrap_err();
        assert!(stale.is_retryable());
    }

    #[test]
    fn test_convert_type_is_idempotent() {
        let f = fixture(EngineConfig::default());
        let b = f
            .lifecycle
            .create(f.book, BlockType::Video, BlockContent::video("https://v/1", "Demo"), Position::Append)
            .unwrap();
        let once = f.lifecycle.convert_type(b.id, BlockType::Markdown, 1).unwrap();
        assert_eq!(once.block_type, BlockType::Markdown);
        assert_eq!(once.content, Some(BlockContent::markdown("Demo")));
        let twice = f.lifecycle.convert_type(b.id, BlockType::Markdown, 2).unwrap();
        assert_eq!(twice.content, once.content);
        assert_eq!(twice.version, 3);

        let err = f.lifecycle.convert_type(b.id, BlockType::Image, 3).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConversion { .. }));
    }

    #[test]
    fn test_duplicate_lands_right_after_source() {
        let f = fixture(EngineConfig::default());
        let a = text(&f, "A", Position::Append);
        let b = text(&f, "B", Position::Append);
        text(&f, "C", Position::Append);
        f.lifecycle.soft_delete(b.id, 1).unwrap();

        let copy = f.lifecycle.duplicate(a.id).unwrap();
        assert_eq!(copy.content, a.content);
        assert_eq!(copy.version, 1);
        assert_eq!(order(&f), vec!["A", "A", "C"]);
        assert_eq!(f.repo.get(a.id).unwrap().unwrap().version, 1);

        // The trashed B must still sit between the copy and C once restored.
        f.lifecycle.restore(b.id, 2).unwrap();
        assert_eq!(order(&f), vec!["A", "A", "B", "C"]);
    }

    #[test]
    fn test_reorder_to_same_place_bumps_version() {
        let f = fixture(EngineConfig::default());
        let a = text(&f, "A", Position::Append);
        let b = text(&f, "B", Position::Append);
        let moved = f.lifecycle.reorder(a.id, Some(b.id), 1).unwrap();
        assert_eq!(moved.version, 2);
        assert_ne!(moved.order_key, a.order_key);
        assert_eq!(order(&f), vec!["A", "B"]);

        let err = f.lifecycle.reorder(a.id, Some(a.id), 2).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_reorder_to_tail() {
        let f = fixture(EngineConfig::default());
        let a = text(&f, "A", Position::Append);
        text(&f, "B", Position::Append);
        f.lifecycle.reorder(a.id, None, 1).unwrap();
        assert_eq!(order(&f), vec!["B", "A"]);
    }

    #[test]
    fn test_state_machine() {
        let f = fixture(EngineConfig::default());
        let a = text(&f, "A", Position::Append);

        assert!(matches!(
            f.lifecycle.purge(a.id, 1),
            Err(Error::InvalidTransition { from: BlockStatus::Active, action: "purge" })
        ));
        assert!(matches!(
            f.lifecycle.restore(a.id, 1),
            Err(Error::InvalidTransition { from: BlockStatus::Active, action: "restore" })
        ));
        f.lifecycle.soft_delete(a.id, 1).unwrap();
        assert!(matches!(
            f.lifecycle.update_content(a.id, BlockContent::text("x"), 2),
            Err(Error::InvalidTransition { from: BlockStatus::SoftDeleted, .. })
        ));
        f.lifecycle.purge(a.id, 2).unwrap();
        assert!(matches!(
            f.lifecycle.restore(a.id, 3),
            Err(Error::InvalidTransition { from: BlockStatus::Purged, .. })
        ));
    }

    #[test]
    fn test_restore_respects_retention_window() {
        let f = fixture(EngineConfig::default().with_retention_days(30));
        let a = text(&f, "A", Position::Append);
        let b = text(&f, "B", Position::Append);
        f.lifecycle.soft_delete(a.id, 1).unwrap();
        f.lifecycle.soft_delete(b.id, 1).unwrap();

        f.clock.advance(DAY * 30);
        f.lifecycle.restore(a.id, 2).unwrap();

        f.clock.advance(Duration::from_millis(1));
        let err = f.lifecycle.restore(b.id, 2).unwrap_err();
        assert!(matches!(err, Error::RetentionExpired { block_id, .. } if block_id == b.id));
        assert!(f.repo.get(b.id).unwrap().unwrap().is_soft_deleted());
    }

    #[test]
    fn test_purge_if_expired() {
        let f = fixture(EngineConfig::default().with_retention_days(1));
        let a = text(&f, "A", Position::Append);
        f.lifecycle.soft_delete(a.id, 1).unwrap();
        assert!(f.lifecycle.expired().unwrap().is_empty());
        assert!(f.lifecycle.purge_if_expired(a.id).unwrap().is_none());

        f.clock.advance(DAY * 2);
        assert_eq!(f.lifecycle.expired().unwrap().len(), 1);
        let purged = f.lifecycle.purge_if_expired(a.id).unwrap().unwrap();
        assert!(purged.is_purged());
        assert!(purged.content.is_none());
    }

    #[test]
    fn test_new_keys_never_reuse_purged_keys() {
        let f = fixture(EngineConfig::default());
        let a = text(&f, "A", Position::Append);
        f.lifecycle.soft_delete(a.id, 1).unwrap();
        f.lifecycle.purge(a.id, 2).unwrap();
        let b = text(&f, "B", Position::Append);
        let c = text(&f, "C", Position::Prepend);
        assert_ne!(b.order_key, a.order_key);
        assert_ne!(c.order_key, a.order_key);
    }

    #[test]
    fn test_rebalance_preserves_order_and_shortens_keys() {
        let f = fixture(EngineConfig::default().with_rebalance_threshold(2));
        let first = text(&f, "first", Position::Append);
        let mut anchor = text(&f, "last", Position::Append);
        // Squeeze inserts against the same anchor to grow keys.
        for i in 0..40 {
            anchor = text(&f, &format!("m{i:02}"), Position::Before(anchor.id));
        }
        let gone = text(&f, "gone", Position::Append);
        f.lifecycle.soft_delete(gone.id, 1).unwrap();
        f.lifecycle.purge(gone.id, 2).unwrap();
        f.lifecycle.soft_delete(first.id, 1).unwrap();

        let before = order(&f);
        assert!(f.lifecycle.needs_rebalance(f.book).unwrap());
        let touched = f.lifecycle.rebalance(f.book).unwrap();
        assert!(!touched.is_empty());
        assert_eq!(order(&f), before);
        assert!(!f.lifecycle.needs_rebalance(f.book).unwrap());

        let purged_key = f.repo.get(gone.id).unwrap().unwrap().order_key;
        let keys = f.repo.keys(f.book).unwrap();
        assert_eq!(keys.iter().filter(|k| **k == purged_key).count(), 1);

        // Soft-deleted blocks keep their relative position.
        let version = f.repo.get(first.id).unwrap().unwrap().version;
        f.lifecycle.restore(first.id, version).unwrap();
        assert_eq!(order(&f)[0], "first");

        // Every renumbered block that was not restored afterwards ends
        // its history with the rekey.
        let others: Vec<_> = touched.iter().filter(|b| b.id != first.id).collect();
        assert!(!others.is_empty());
        for b in others {
            let last = f.repo.versions(b.id).unwrap().pop().unwrap();
            assert_eq!(last.change_type, ChangeType::Reordered);
            assert_eq!(last.block_version, b.version);
        }
    }

    #[test]
    fn test_rebalance_empty_book() {
        let f = fixture(EngineConfig::default());
        assert!(f.lifecycle.rebalance(f.book).unwrap().is_empty());
        assert!(!f.lifecycle.needs_rebalance(f.book).unwrap());
    }
}
