//! Append-only block history.
//!
//! Every successful mutation of a block produces exactly one [`BlockVersion`].
//! Sequences are contiguous per block starting at 1, and entries are never
//! rewritten once stored.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::block::{Block, BlockContent, BlockType};
use crate::ids::{BlockId, BookId};

/// What kind of mutation a history entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ChangeType {
    Created,
    ContentUpdated,
    TypeChanged,
    Reordered,
    SoftDeleted,
    Restored,
    Purged,
}

impl ChangeType {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::ContentUpdated => "content_updated",
            ChangeType::TypeChanged => "type_changed",
            ChangeType::Reordered => "reordered",
            ChangeType::SoftDeleted => "soft_deleted",
            ChangeType::Restored => "restored",
            ChangeType::Purged => "purged",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Frozen type + content of a block at one point in its history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    /// `None` for the purged entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<BlockContent>,
    pub order_key: String,
}

impl VersionSnapshot {
    /// Capture the current state of a block.
    pub fn of(block: &Block) -> Self {
        Self {
            block_type: block.block_type,
            content: block.content.clone(),
            order_key: block.order_key.clone(),
        }
    }
}

/// One immutable history entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVersion {
    pub block_id: BlockId,
    pub book_id: BookId,
    /// Contiguous per block, starting at 1.
    pub sequence: u64,
    pub change_type: ChangeType,
    pub snapshot: VersionSnapshot,
    /// The block's `version` right after this change.
    pub block_version: u64,
    /// Unix millis.
    pub occurred_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_type_roundtrip() {
        for ct in [
            ChangeType::Created,
            ChangeType::ContentUpdated,
            ChangeType::TypeChanged,
            ChangeType::Reordered,
            ChangeType::SoftDeleted,
            ChangeType::Restored,
            ChangeType::Purged,
        ] {
            assert_eq!(ChangeType::from_str(ct.as_str()), Some(ct));
            let json = serde_json::to_string(&ct).unwrap();
            assert_eq!(json, format!("\"{}\"", ct.as_str()));
        }
    }

    #[test]
    fn test_snapshot_of_block() {
        let block = Block::new(BookId::new(), BlockContent::text("x"), "V", 7);
        let snap = VersionSnapshot::of(&block);
        assert_eq!(snap.block_type, BlockType::Text);
        assert_eq!(snap.content, Some(BlockContent::text("x")));
        assert_eq!(snap.order_key, "V");
    }

    #[test]
    fn test_purged_snapshot_omits_content_in_json() {
        let snap = VersionSnapshot {
            block_type: BlockType::Image,
            content: None,
            order_key: "F".into(),
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json, serde_json::json!({"type": "image", "order_key": "F"}));
    }
}
