//! Kernel error types.

use quire_keys::KeyError;
use quire_types::{BlockId, BlockStatus, BlockType, BookId};
use thiserror::Error;

/// Errors surfaced by the block engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("book not found: {0}")]
    BookNotFound(BookId),

    #[error("book is deleted: {0}")]
    BookDeleted(BookId),

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// Key space misuse. Not retryable.
    #[error(transparent)]
    InvalidKeyRange(#[from] KeyError),

    #[error("cannot {action} a {from} block")]
    InvalidTransition {
        from: BlockStatus,
        action: &'static str,
    },

    #[error("retention window elapsed for block {block_id} (deleted at {deleted_at})")]
    RetentionExpired { block_id: BlockId, deleted_at: u64 },

    #[error("unsupported conversion: {from} -> {to}")]
    UnsupportedConversion { from: BlockType, to: BlockType },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("rebalance of book {book_id} failed: {reason}")]
    Rebalance { book_id: BookId, reason: String },
}

impl Error {
    /// Whether the caller may retry the same request after re-reading.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(format!("encoding: {e}"))
    }
}

/// Result type for kernel operations.
pub type Result<T> = std::result::Result<T, Error>;
