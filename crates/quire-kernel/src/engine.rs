//! `BlockEngine`: the public face of the kernel.
//!
//! Wires the Lifecycle Manager to the Ordering Coordinator, the Book
//! directory and the Chronicle emitter. Mutations take the book's token,
//! run the lifecycle operation, release the token and only then emit.
//! Reads go straight to the repository.

use std::sync::Arc;

use quire_types::{Block, BlockContent, BlockId, BlockStatus, BlockType, BlockVersion, BookId, ChangeType, LifecycleEvent};

use crate::books::{ensure_writable, BookDirectory};
use crate::chronicle::{ChronicleEmitter, ChronicleSink, DeadLetter, TracingSink};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, EngineConfig};
use crate::convert::ConversionRegistry;
use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::flows::{FlowBus, Subscription};
use crate::history::{self, Change};
use crate::lifecycle::{Lifecycle, Position};
use crate::repository::{require_status, BlockRepository};

/// Builder for [`BlockEngine`].
pub struct EngineBuilder {
    repo: Arc<dyn BlockRepository>,
    books: Arc<dyn BookDirectory>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ChronicleSink>,
    conversions: ConversionRegistry,
}

impl EngineBuilder {
    pub fn new(repo: Arc<dyn BlockRepository>, books: Arc<dyn BookDirectory>) -> Self {
        Self {
            repo,
            books,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingSink),
            conversions: ConversionRegistry::standard(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Where lifecycle notifications are delivered. Defaults to logging.
    pub fn sink(mut self, sink: Arc<dyn ChronicleSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn conversions(mut self, conversions: ConversionRegistry) -> Self {
        self.conversions = conversions;
        self
    }

    /// Validate the config and start the Chronicle delivery task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> std::result::Result<BlockEngine, ConfigError> {
        self.config.validate()?;
        let bus = FlowBus::new(self.config.flow_capacity);
        let emitter = ChronicleEmitter::spawn(self.sink, self.config.chronicle.clone(), bus);
        let lifecycle = Lifecycle::new(
            self.repo.clone(),
            self.conversions,
            self.clock,
            &self.config,
        );
        tracing::debug!(
            retention_days = self.config.retention_days,
            rebalance_threshold = self.config.rebalance_threshold,
            "block engine ready"
        );
        Ok(BlockEngine {
            repo: self.repo,
            books: self.books,
            lifecycle,
            coordinator: Coordinator::new(),
            emitter,
            config: self.config,
        })
    }
}

/// Ordered block collections for every book.
pub struct BlockEngine {
    repo: Arc<dyn BlockRepository>,
    books: Arc<dyn BookDirectory>,
    lifecycle: Lifecycle,
    coordinator: Coordinator,
    emitter: ChronicleEmitter,
    config: EngineConfig,
}

impl BlockEngine {
    pub fn builder(repo: Arc<dyn BlockRepository>, books: Arc<dyn BookDirectory>) -> EngineBuilder {
        EngineBuilder::new(repo, books)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The user-visible sequence of a book.
    #[tracing::instrument(skip(self), name = "read.list_active")]
    pub async fn list_active(&self, book_id: BookId) -> Result<Vec<Block>> {
        self.repo.list_active(book_id)
    }

    #[tracing::instrument(skip(self), name = "read.list_all")]
    pub async fn list_all(&self, book_id: BookId, include_deleted: bool) -> Result<Vec<Block>> {
        self.repo.list_all(book_id, include_deleted)
    }

    /// An active or soft-deleted block. Purged blocks are not found.
    #[tracing::instrument(skip(self), name = "read.get")]
    pub async fn get(&self, id: BlockId) -> Result<Block> {
        self.repo
            .get(id)?
            .filter(|b| !b.is_purged())
            .ok_or(Error::BlockNotFound(id))
    }

    /// Full history of a block, purged ones included.
    #[tracing::instrument(skip(self), name = "read.history")]
    pub async fn history(&self, id: BlockId) -> Result<Vec<BlockVersion>> {
        history::history(self.repo.as_ref(), id)
    }

    // ========================================================================
    // Structural mutations
    // ========================================================================

    #[tracing::instrument(skip(self, content), name = "block.create")]
    pub async fn create(
        &self,
        book_id: BookId,
        block_type: BlockType,
        content: BlockContent,
        position: Position,
    ) -> Result<Block> {
        ensure_writable(self.books.as_ref(), book_id).await?;
        let token = self.coordinator.structural(book_id).await;
        let rebalanced = self.auto_rebalance(book_id)?;
        let result = self.lifecycle.create(book_id, block_type, content, position);
        drop(token);

        self.emit_all(&rebalanced, ChangeType::Reordered);
        let block = result?;
        self.emit(&block, ChangeType::Created);
        Ok(block)
    }

    #[tracing::instrument(skip(self), name = "block.duplicate")]
    pub async fn duplicate(&self, id: BlockId) -> Result<Block> {
        let book_id = self.lifecycle.load(id)?.book_id;
        ensure_writable(self.books.as_ref(), book_id).await?;
        let token = self.coordinator.structural(book_id).await;
        let rebalanced = self.auto_rebalance(book_id)?;
        let result = self.lifecycle.duplicate(id);
        drop(token);

        self.emit_all(&rebalanced, ChangeType::Reordered);
        let block = result?;
        self.emit(&block, ChangeType::Created);
        Ok(block)
    }

    /// Move a block before `before`, or to the tail when `None`.
    #[tracing::instrument(skip(self), name = "block.reorder")]
    pub async fn reorder(
        &self,
        id: BlockId,
        before: Option<BlockId>,
        expected_version: u64,
    ) -> Result<Block> {
        let book_id = self.lifecycle.load(id)?.book_id;
        ensure_writable(self.books.as_ref(), book_id).await?;
        let token = self.coordinator.structural(book_id).await;

        let current = self.lifecycle.load(id)?;
        let change = Change::new(ChangeType::Reordered, current.updated_at);
        require_status(&current, BlockStatus::Active, change)?;
        if current.version != expected_version {
            return Err(Error::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }

        let rebalanced = self.auto_rebalance(book_id)?;
        // A rebalance that renumbered this block has already bumped its
        // version on the caller's behalf.
        let expected_version = rebalanced
            .iter()
            .find(|b| b.id == id)
            .map_or(expected_version, |b| b.version);
        let result = self.lifecycle.reorder(id, before, expected_version);
        drop(token);

        self.emit_all(&rebalanced, ChangeType::Reordered);
        let block = result?;
        self.emit(&block, ChangeType::Reordered);
        Ok(block)
    }

    #[tracing::instrument(skip(self), name = "block.soft_delete")]
    pub async fn soft_delete(&self, id: BlockId, expected_version: u64) -> Result<Block> {
        let book_id = self.lifecycle.load(id)?.book_id;
        ensure_writable(self.books.as_ref(), book_id).await?;
        let block = {
            let _token = self.coordinator.structural(book_id).await;
            self.lifecycle.soft_delete(id, expected_version)?
        };
        self.emit(&block, ChangeType::SoftDeleted);
        Ok(block)
    }

    #[tracing::instrument(skip(self), name = "block.restore")]
    pub async fn restore(&self, id: BlockId, expected_version: u64) -> Result<Block> {
        let book_id = self.lifecycle.load(id)?.book_id;
        ensure_writable(self.books.as_ref(), book_id).await?;
        let block = {
            let _token = self.coordinator.structural(book_id).await;
            self.lifecycle.restore(id, expected_version)?
        };
        self.emit(&block, ChangeType::Restored);
        Ok(block)
    }

    /// Empty one block from the trash.
    #[tracing::instrument(skip(self), name = "block.purge")]
    pub async fn purge(&self, id: BlockId, expected_version: u64) -> Result<Block> {
        let book_id = self.lifecycle.load(id)?.book_id;
        ensure_writable(self.books.as_ref(), book_id).await?;
        let block = {
            let _token = self.coordinator.structural(book_id).await;
            self.lifecycle.purge(id, expected_version)?
        };
        self.emit(&block, ChangeType::Purged);
        Ok(block)
    }

    /// Purge every soft-deleted block whose retention window has elapsed,
    /// across all books. Deleted books are swept too.
    ///
    /// A block that fails to purge is logged and skipped; the sweep goes on.
    #[tracing::instrument(skip(self), name = "book.purge_expired")]
    pub async fn purge_expired(&self) -> Result<Vec<Block>> {
        let candidates = self.lifecycle.expired()?;
        let mut purged = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let outcome = {
                let _token = self.coordinator.structural(candidate.book_id).await;
                self.lifecycle.purge_if_expired(candidate.id)
            };
            match outcome {
                Ok(Some(block)) => {
                    self.emit(&block, ChangeType::Purged);
                    purged.push(block);
                }
                // Restored or purged by someone else in the meantime.
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        block_id = %candidate.id,
                        book_id = %candidate.book_id,
                        error = %e,
                        "retention purge failed"
                    );
                }
            }
        }
        if !purged.is_empty() {
            tracing::info!(purged = purged.len(), "retention sweep complete");
        }
        Ok(purged)
    }

    /// Renumber a book's keys now. Returns the blocks whose key changed.
    #[tracing::instrument(skip(self), name = "book.rebalance")]
    pub async fn rebalance(&self, book_id: BookId) -> Result<Vec<Block>> {
        ensure_writable(self.books.as_ref(), book_id).await?;
        let result = {
            let _token = self.coordinator.structural(book_id).await;
            self.lifecycle.rebalance(book_id)
        };
        let blocks = result.inspect_err(|e| {
            tracing::error!(book_id = %book_id, error = %e, "rebalance failed");
        })?;
        self.emit_all(&blocks, ChangeType::Reordered);
        Ok(blocks)
    }

    // ========================================================================
    // Content mutations
    // ========================================================================

    #[tracing::instrument(skip(self, content), name = "block.update_content")]
    pub async fn update_content(
        &self,
        id: BlockId,
        content: BlockContent,
        expected_version: u64,
    ) -> Result<Block> {
        let book_id = self.lifecycle.load(id)?.book_id;
        let block = {
            let _token = self.coordinator.content(book_id).await;
            self.lifecycle.update_content(id, content, expected_version)?
        };
        self.emit(&block, ChangeType::ContentUpdated);
        Ok(block)
    }

    #[tracing::instrument(skip(self), name = "block.convert_type")]
    pub async fn convert_type(
        &self,
        id: BlockId,
        target: BlockType,
        expected_version: u64,
    ) -> Result<Block> {
        let book_id = self.lifecycle.load(id)?.book_id;
        let block = {
            let _token = self.coordinator.content(book_id).await;
            self.lifecycle.convert_type(id, target, expected_version)?
        };
        self.emit(&block, ChangeType::TypeChanged);
        Ok(block)
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Lifecycle notifications whose subject matches `pattern`
    /// (`block.created`, `block.*`, `block.>`).
    pub fn subscribe(&self, pattern: &str) -> Subscription<LifecycleEvent> {
        self.emitter.bus().subscribe(pattern)
    }

    /// Notifications that exhausted their delivery attempts, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.emitter.dead_letters().snapshot()
    }

    pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        self.emitter.dead_letters().drain()
    }

    /// Wait for pending notifications to be delivered or dead-lettered.
    pub async fn flush(&self) {
        self.emitter.flush().await;
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Rebalance the book if its keys have grown too long. Caller holds the
    /// structural token.
    fn auto_rebalance(&self, book_id: BookId) -> Result<Vec<Block>> {
        let result = match self.lifecycle.needs_rebalance(book_id) {
            Ok(true) => self.lifecycle.rebalance(book_id),
            Ok(false) => return Ok(Vec::new()),
            Err(e) => Err(e),
        };
        result.inspect_err(|e| {
            tracing::error!(book_id = %book_id, error = %e, "automatic rebalance failed");
        })
    }

    fn emit(&self, block: &Block, change_type: ChangeType) {
        self.emitter.emit(LifecycleEvent::new(
            block.id,
            block.book_id,
            change_type,
            block.updated_at,
        ));
    }

    fn emit_all(&self, blocks: &[Block], change_type: ChangeType) {
        for block in blocks {
            self.emit(block, change_type);
        }
    }
}

impl std::fmt::Debug for BlockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockEngine")
            .field("config", &self.config)
            .field("lifecycle", &self.lifecycle)
            .field("emitter", &self.emitter)
            .finish_non_exhaustive()
    }
}
