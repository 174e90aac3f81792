//! Block type conversion registry.
//!
//! A conversion is a pure function from one content variant to another,
//! registered under `(from, to)`. Conversions may be lossy (video → markdown
//! keeps only the caption) but are always deterministic.
//!
//! The standard table registers:
//! - identity for every type, so converting to the current type is a no-op
//! - every pair of text-like types
//! - media → any text-like type, via the caption
//!
//! Nothing converts into a media type, and image ↔ video is unsupported.
//!
//! Every registered conversion of schema-valid content yields schema-valid
//! content: empty titles become [`UNTITLED`], bodies are cut at
//! [`MAX_BODY_BYTES`], and a fence info string keeps only its first word.

use std::collections::HashMap;

use quire_types::{BlockContent, BlockType, TodoItem};

use crate::error::{Error, Result};
use crate::schema::MAX_BODY_BYTES;

/// A registered content transform.
pub type ConvertFn = fn(&BlockContent) -> BlockContent;

const TEXT_LIKE: [BlockType; 7] = [
    BlockType::Markdown,
    BlockType::Heading,
    BlockType::Text,
    BlockType::Quote,
    BlockType::Code,
    BlockType::TodoList,
    BlockType::Checkpoint,
];

/// Level used when a heading is made from content that has none.
const DEFAULT_HEADING_LEVEL: u8 = 2;

/// Heading or checkpoint title used when the source has no words.
pub const UNTITLED: &str = "Untitled";

/// Conversion functions keyed by `(from, to)`.
#[derive(Clone)]
pub struct ConversionRegistry {
    table: HashMap<(BlockType, BlockType), ConvertFn>,
}

impl ConversionRegistry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// The standard conversion table.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for t in BlockType::ALL {
            registry.register(t, t, identity);
        }
        for from in BlockType::ALL {
            for to in TEXT_LIKE {
                if from != to {
                    registry.register(from, to, into_fn(to));
                }
            }
        }
        registry
    }

    /// Register (or replace) the conversion for `(from, to)`.
    pub fn register(&mut self, from: BlockType, to: BlockType, f: ConvertFn) {
        self.table.insert((from, to), f);
    }

    pub fn supports(&self, from: BlockType, to: BlockType) -> bool {
        self.table.contains_key(&(from, to))
    }

    /// Convert `content` to `to`.
    pub fn convert(&self, content: &BlockContent, to: BlockType) -> Result<BlockContent> {
        let from = content.block_type();
        let f = self
            .table
            .get(&(from, to))
            .ok_or(Error::UnsupportedConversion { from, to })?;
        Ok(f(content))
    }

    /// Number of registered pairs.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for ConversionRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for ConversionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionRegistry")
            .field("pairs", &self.table.len())
            .finish()
    }
}

fn into_fn(to: BlockType) -> ConvertFn {
    match to {
        BlockType::Markdown => to_markdown,
        BlockType::Heading => to_heading,
        BlockType::Text => to_text,
        BlockType::Quote => to_quote,
        BlockType::Code => to_code,
        BlockType::TodoList => to_todo_list,
        BlockType::Checkpoint => to_checkpoint,
        BlockType::Image | BlockType::Video => identity,
    }
}

fn identity(content: &BlockContent) -> BlockContent {
    content.clone()
}

// ============================================================================
// Target conversions
// ============================================================================

fn to_markdown(content: &BlockContent) -> BlockContent {
    let source = match content {
        BlockContent::Markdown { source } => source.clone(),
        BlockContent::Heading { level, text } => {
            format!("{} {}", "#".repeat(*level as usize), text)
        }
        BlockContent::Quote { text, attribution } => {
            let mut out: Vec<String> = text
                .lines()
                .map(|l| if l.is_empty() { ">".to_string() } else { format!("> {l}") })
                .collect();
            if let Some(attribution) = attribution {
                out.push(">".into());
                out.push(format!("> -- {attribution}"));
            }
            out.join("\n")
        }
        BlockContent::Code { language, source } => {
            format!("```{}\n{}\n```", language.as_deref().unwrap_or(""), source)
        }
        BlockContent::TodoList { items } => items
            .iter()
            .map(|i| format!("- [{}] {}", if i.done { "x" } else { " " }, i.text))
            .collect::<Vec<_>>()
            .join("\n"),
        BlockContent::Checkpoint { title, note } => {
            if note.is_empty() {
                format!("**{title}**")
            } else {
                format!("**{title}**\n\n{note}")
            }
        }
        other => plain_text(other),
    };
    BlockContent::Markdown {
        source: clamp_body(source),
    }
}

fn to_heading(content: &BlockContent) -> BlockContent {
    match content {
        BlockContent::Heading { .. } => content.clone(),
        BlockContent::Markdown { source } => {
            let line = first_line(source);
            let (level, rest) = split_heading_marker(line);
            BlockContent::Heading {
                level: level.unwrap_or(DEFAULT_HEADING_LEVEL),
                text: title(rest),
            }
        }
        other => BlockContent::Heading {
            level: DEFAULT_HEADING_LEVEL,
            text: title(first_line(&plain_text(other))),
        },
    }
}

fn to_text(content: &BlockContent) -> BlockContent {
    match content {
        BlockContent::Text { .. } => content.clone(),
        other => BlockContent::Text {
            text: clamp_body(plain_text(other)),
        },
    }
}

fn to_quote(content: &BlockContent) -> BlockContent {
    match content {
        BlockContent::Quote { .. } => content.clone(),
        BlockContent::Markdown { source } => BlockContent::Quote {
            text: clamp_body(
                source
                    .lines()
                    .map(|l| l.strip_prefix('>').map(str::trim_start).unwrap_or(l))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            attribution: None,
        },
        other => BlockContent::Quote {
            text: clamp_body(plain_text(other)),
            attribution: None,
        },
    }
}

fn to_code(content: &BlockContent) -> BlockContent {
    match content {
        BlockContent::Code { .. } => content.clone(),
        BlockContent::Markdown { source } => match split_fence(source) {
            Some((language, body)) => BlockContent::Code {
                language,
                source: body.to_string(),
            },
            None => BlockContent::Code {
                language: None,
                source: source.clone(),
            },
        },
        other => BlockContent::Code {
            language: None,
            source: clamp_body(plain_text(other)),
        },
    }
}

fn to_todo_list(content: &BlockContent) -> BlockContent {
    match content {
        BlockContent::TodoList { .. } => content.clone(),
        other => BlockContent::TodoList {
            items: plain_text(other)
                .lines()
                .filter_map(parse_todo_line)
                .collect(),
        },
    }
}

fn to_checkpoint(content: &BlockContent) -> BlockContent {
    match content {
        BlockContent::Checkpoint { .. } => content.clone(),
        BlockContent::Heading { text, .. } => BlockContent::Checkpoint {
            title: text.clone(),
            note: String::new(),
        },
        other => {
            let text = plain_text(other);
            let mut lines = text.lines().skip_while(|l| l.trim().is_empty());
            let title = lines.next().unwrap_or("");
            let title = match other {
                BlockContent::Markdown { .. } => split_heading_marker(title).1,
                _ => title,
            };
            let note = lines.collect::<Vec<_>>().join("\n");
            BlockContent::Checkpoint {
                title: self::title(title),
                note: clamp_body(note.trim().to_string()),
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// The prose of a block, without structure.
fn plain_text(content: &BlockContent) -> String {
    match content {
        BlockContent::Markdown { source } => source.clone(),
        BlockContent::Heading { text, .. } => text.clone(),
        BlockContent::Text { text } | BlockContent::Quote { text, .. } => text.clone(),
        BlockContent::Code { source, .. } => source.clone(),
        BlockContent::Image { caption, .. } | BlockContent::Video { caption, .. } => {
            caption.clone()
        }
        BlockContent::TodoList { items } => items
            .iter()
            .map(|i| i.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        BlockContent::Checkpoint { title, note } => {
            if note.is_empty() {
                title.clone()
            } else {
                format!("{title}\n{note}")
            }
        }
    }
}

fn first_line(s: &str) -> &str {
    s.lines().find(|l| !l.trim().is_empty()).unwrap_or("")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One-line title, never empty.
fn title(s: &str) -> String {
    let collapsed = collapse_whitespace(s);
    if collapsed.is_empty() {
        UNTITLED.to_string()
    } else {
        collapsed
    }
}

/// Cut `s` to the body limit on a char boundary.
fn clamp_body(mut s: String) -> String {
    if s.len() > MAX_BODY_BYTES {
        let mut cut = MAX_BODY_BYTES;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

/// `"### Title"` → `(Some(3), "Title")`. Seven or more `#` is not a heading.
fn split_heading_marker(line: &str) -> (Option<u8>, &str) {
    let trimmed = line.trim_start();
    let hashes = trimmed.bytes().take_while(|&b| b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return (None, line);
    }
    let rest = &trimmed[hashes..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return (None, line);
    }
    (Some(hashes as u8), rest.trim())
}

/// A markdown source that is exactly one fenced code block.
fn split_fence(source: &str) -> Option<(Option<String>, &str)> {
    let trimmed = source.trim();
    let inner = trimmed.strip_prefix("```")?.strip_suffix("```")?;
    let (info, body) = inner.split_once('\n')?;
    if body.contains("```") {
        return None;
    }
    // "rust edition2021" names the language by its first word.
    let language = info.split_whitespace().next().map(str::to_string);
    Some((language, body.strip_suffix('\n').unwrap_or(body)))
}

/// One checklist line; bullets and `[ ]`/`[x]` boxes are stripped.
fn parse_todo_line(line: &str) -> Option<TodoItem> {
    let mut rest = line.trim();
    if let Some(r) = rest.strip_prefix("- ").or_else(|| rest.strip_prefix("* ")) {
        rest = r.trim_start();
    }
    let mut done = false;
    if let Some(r) = rest.strip_prefix("[ ]") {
        rest = r;
    } else if let Some(r) = rest.strip_prefix("[x]").or_else(|| rest.strip_prefix("[X]")) {
        rest = r;
        done = true;
    }
    let text = collapse_whitespace(rest);
    if text.is_empty() {
        return None;
    }
    Some(TodoItem { text, done })
}
