//! Shared identity, block, and history types for Quire.
//!
//! This crate is the leaf of the workspace: typed IDs, the block record and
//! its tagged content union, the append-only version record, and the
//! lifecycle notification shape. It has **no internal quire dependencies**.
//!
//! # Entity-Relationship Overview
//!
//! ```text
//! Book (BookId) ← owned elsewhere; only its id crosses this boundary
//!     └── contains Block (BlockId), ordered by order_key
//!             └── carries BlockContent (one variant per BlockType)
//!             └── accumulates BlockVersion (sequence 1, 2, 3, ...)
//!             └── announces LifecycleEvent (best-effort, after commit)
//! ```
//!
//! # Key Types
//!
//! |--------------------|------------------------------------------------|
//! | Type               | Purpose                                        |
//! |--------------------|------------------------------------------------|
//! | [`Block`]          | Stored block record                            |
//! | [`BlockContent`]   | Type-tagged payload                            |
//! | [`BlockStatus`]    | active / soft_deleted / purged                 |
//! | [`BlockVersion`]   | Immutable history entry                        |
//! | [`LifecycleEvent`] | Notification for the Chronicle collaborator    |
//! |--------------------|------------------------------------------------|

pub mod block;
pub mod event;
pub mod ids;
pub mod version;

// Re-export primary types at crate root for convenience.
pub use block::{Block, BlockContent, BlockStatus, BlockType, TodoItem};
pub use event::{LifecycleEvent, LifecycleKind};
pub use ids::{BlockId, BookId};
pub use version::{BlockVersion, ChangeType, VersionSnapshot};

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
