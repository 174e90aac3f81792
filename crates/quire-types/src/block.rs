//! Block records, types, lifecycle status, and the tagged content union.
//!
//! ## Design: BlockType + BlockContent
//!
//! `BlockType` names what a block *is*; `BlockContent` carries the payload in a
//! variant of the same name. The two must always agree: `Block::new` derives
//! the type from the content, and the kernel's schema check rejects a content
//! variant that does not match the block's declared type.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::{BlockId, BookId};

/// What a block *is* (content type).
///
/// Text-like types carry a body of prose or code; media types carry a
/// reference plus a caption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum BlockType {
    /// Markdown source.
    #[strum(serialize = "markdown", serialize = "md")]
    Markdown,
    /// Section heading with a level (1..=6).
    Heading,
    /// Plain text paragraph.
    Text,
    /// Block quotation.
    Quote,
    /// Source code with an optional language tag.
    Code,
    /// Image reference with caption.
    Image,
    /// Video reference with caption.
    Video,
    /// Checklist of items.
    #[strum(serialize = "todo_list", serialize = "todolist", serialize = "todo")]
    TodoList,
    /// Progress marker inside a book.
    Checkpoint,
}

impl BlockType {
    /// Every block type, in declaration order.
    pub const ALL: [BlockType; 9] = [
        BlockType::Markdown,
        BlockType::Heading,
        BlockType::Text,
        BlockType::Quote,
        BlockType::Code,
        BlockType::Image,
        BlockType::Video,
        BlockType::TodoList,
        BlockType::Checkpoint,
    ];

    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Markdown => "markdown",
            BlockType::Heading => "heading",
            BlockType::Text => "text",
            BlockType::Quote => "quote",
            BlockType::Code => "code",
            BlockType::Image => "image",
            BlockType::Video => "video",
            BlockType::TodoList => "todo_list",
            BlockType::Checkpoint => "checkpoint",
        }
    }

    /// Check if this type references external media.
    pub fn is_media(&self) -> bool {
        matches!(self, BlockType::Image | BlockType::Video)
    }

    /// Check if this type's payload is text the user writes directly.
    pub fn is_textual(&self) -> bool {
        !self.is_media()
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a block.
///
/// `Active ⇄ SoftDeleted → Purged`. Purged is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum BlockStatus {
    /// Visible in the book.
    #[default]
    Active,
    /// In the trash; restorable until the retention window elapses.
    #[strum(serialize = "soft_deleted", serialize = "deleted")]
    SoftDeleted,
    /// Gone for good. Metadata and history remain, content does not.
    Purged,
}

impl BlockStatus {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Active => "active",
            BlockStatus::SoftDeleted => "soft_deleted",
            BlockStatus::Purged => "purged",
        }
    }

    /// Check if this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BlockStatus::Purged)
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of a todo list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub done: bool,
}

impl TodoItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }

    pub fn done(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: true,
        }
    }
}

/// Type-tagged block payload. The tag is the block type's string form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockContent {
    Markdown {
        source: String,
    },
    Heading {
        level: u8,
        text: String,
    },
    Text {
        text: String,
    },
    Quote {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attribution: Option<String>,
    },
    Code {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        source: String,
    },
    Image {
        url: String,
        #[serde(default)]
        caption: String,
    },
    Video {
        url: String,
        #[serde(default)]
        caption: String,
    },
    TodoList {
        items: Vec<TodoItem>,
    },
    Checkpoint {
        title: String,
        #[serde(default)]
        note: String,
    },
}

/// Helper for `#[serde(skip_serializing_if)]` on bool fields.
fn is_false(v: &bool) -> bool {
    !v
}

impl BlockContent {
    /// The block type this payload belongs to.
    pub fn block_type(&self) -> BlockType {
        match self {
            BlockContent::Markdown { .. } => BlockType::Markdown,
            BlockContent::Heading { .. } => BlockType::Heading,
            BlockContent::Text { .. } => BlockType::Text,
            BlockContent::Quote { .. } => BlockType::Quote,
            BlockContent::Code { .. } => BlockType::Code,
            BlockContent::Image { .. } => BlockType::Image,
            BlockContent::Video { .. } => BlockType::Video,
            BlockContent::TodoList { .. } => BlockType::TodoList,
            BlockContent::Checkpoint { .. } => BlockType::Checkpoint,
        }
    }

    pub fn markdown(source: impl Into<String>) -> Self {
        BlockContent::Markdown {
            source: source.into(),
        }
    }

    pub fn heading(level: u8, text: impl Into<String>) -> Self {
        BlockContent::Heading {
            level,
            text: text.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        BlockContent::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>, caption: impl Into<String>) -> Self {
        BlockContent::Image {
            url: url.into(),
            caption: caption.into(),
        }
    }

    pub fn video(url: impl Into<String>, caption: impl Into<String>) -> Self {
        BlockContent::Video {
            url: url.into(),
            caption: caption.into(),
        }
    }

    pub fn todo_list(items: impl IntoIterator<Item = TodoItem>) -> Self {
        BlockContent::TodoList {
            items: items.into_iter().collect(),
        }
    }
}

/// A stored block record.
///
/// `content` is `None` only once the block is purged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub book_id: BookId,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<BlockContent>,
    /// Fractional index; ascending order is the book's visible sequence.
    pub order_key: String,
    pub status: BlockStatus,
    /// Bumped on every mutation, starts at 1.
    pub version: u64,
    /// Unix millis.
    pub created_at: u64,
    /// Unix millis.
    pub updated_at: u64,
    /// Unix millis; set while soft-deleted or purged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<u64>,
}

impl Block {
    /// A freshly created active block at version 1.
    pub fn new(book_id: BookId, content: BlockContent, order_key: impl Into<String>, now: u64) -> Self {
        Self {
            id: BlockId::new(),
            book_id,
            block_type: content.block_type(),
            content: Some(content),
            order_key: order_key.into(),
            status: BlockStatus::Active,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == BlockStatus::Active
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.status == BlockStatus::SoftDeleted
    }

    pub fn is_purged(&self) -> bool {
        self.status == BlockStatus::Purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_type_parsing() {
        assert_eq!(BlockType::from_str("markdown"), Some(BlockType::Markdown));
        assert_eq!(BlockType::from_str("MD"), Some(BlockType::Markdown));
        assert_eq!(BlockType::from_str("todo_list"), Some(BlockType::TodoList));
        assert_eq!(BlockType::from_str("todo"), Some(BlockType::TodoList));
        assert_eq!(BlockType::from_str("Checkpoint"), Some(BlockType::Checkpoint));
        assert_eq!(BlockType::from_str("spreadsheet"), None);
    }

    #[test]
    fn test_block_type_as_str_parses_back() {
        for t in BlockType::ALL {
            assert_eq!(BlockType::from_str(t.as_str()), Some(t));
        }
    }

    #[test]
    fn test_block_type_serde_matches_as_str() {
        for t in BlockType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn test_media_types() {
        assert!(BlockType::Image.is_media());
        assert!(BlockType::Video.is_media());
        assert!(BlockType::Heading.is_textual());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(BlockStatus::from_str("deleted"), Some(BlockStatus::SoftDeleted));
        assert_eq!(BlockStatus::from_str("soft_deleted"), Some(BlockStatus::SoftDeleted));
        assert_eq!(BlockStatus::from_str("PURGED"), Some(BlockStatus::Purged));
        assert!(BlockStatus::Purged.is_terminal());
        assert!(!BlockStatus::SoftDeleted.is_terminal());
    }

    #[test]
    fn test_content_tag_matches_block_type() {
        let samples = [
            BlockContent::markdown("# hi"),
            BlockContent::heading(2, "Intro"),
            BlockContent::text("plain"),
            BlockContent::Quote { text: "q".into(), attribution: None },
            BlockContent::Code { language: Some("rust".into()), source: "fn main() {}".into() },
            BlockContent::image("https://x/y.png", "cap"),
            BlockContent::video("https://x/y.mp4", "cap"),
            BlockContent::todo_list([TodoItem::new("a")]),
            BlockContent::Checkpoint { title: "Chapter 1".into(), note: String::new() },
        ];
        for content in samples {
            let value = serde_json::to_value(&content).unwrap();
            assert_eq!(value["type"], content.block_type().as_str());
        }
    }

    #[test]
    fn test_content_json_shape() {
        let content = BlockContent::todo_list([TodoItem::done("ship"), TodoItem::new("test")]);
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "todo_list",
                "items": [{"text": "ship", "done": true}, {"text": "test"}]
            })
        );
    }

    #[test]
    fn test_new_block_defaults() {
        let book = BookId::new();
        let block = Block::new(book, BlockContent::heading(1, "Title"), "V", 42);
        assert_eq!(block.book_id, book);
        assert_eq!(block.block_type, BlockType::Heading);
        assert_eq!(block.status, BlockStatus::Active);
        assert_eq!(block.version, 1);
        assert_eq!(block.created_at, 42);
        assert_eq!(block.updated_at, 42);
        assert!(block.deleted_at.is_none());
        assert!(block.is_active());
    }

    #[test]
    fn test_block_serde_roundtrip() {
        let block = Block::new(BookId::new(), BlockContent::text("hello"), "V", 1);
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains("\"type\":\"text\""));
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
    }
}
