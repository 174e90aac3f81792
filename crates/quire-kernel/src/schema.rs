//! Content schema validation, one rule set per block type.

use quire_types::{BlockContent, BlockType};

use crate::error::{Error, Result};

/// Upper bound on any text body, in bytes.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Heading levels accepted (h1 through h6).
pub const HEADING_LEVELS: std::ops::RangeInclusive<u8> = 1..=6;

/// Check `content` against the schema of `declared`.
///
/// The content variant must match the declared type; then the variant's own
/// rules apply.
pub fn validate(declared: BlockType, content: &BlockContent) -> Result<()> {
    let actual = content.block_type();
    if actual != declared {
        return Err(Error::validation(format!(
            "{actual} content does not match block type {declared}"
        )));
    }

    match content {
        BlockContent::Markdown { source } => body("source", source),
        BlockContent::Text { text } => body("text", text),
        BlockContent::Quote { text, attribution } => {
            body("text", text)?;
            if let Some(attribution) = attribution {
                single_line("attribution", attribution)?;
            }
            Ok(())
        }
        BlockContent::Code { language, source } => {
            body("source", source)?;
            if let Some(language) = language {
                if language.is_empty() || language.chars().any(char::is_whitespace) {
                    return Err(Error::validation(format!(
                        "code language {language:?} must be a single word"
                    )));
                }
            }
            Ok(())
        }
        BlockContent::Heading { level, text } => {
            if !HEADING_LEVELS.contains(level) {
                return Err(Error::validation(format!(
                    "heading level {level} outside 1..=6"
                )));
            }
            non_empty("heading text", text)?;
            single_line("heading text", text)
        }
        BlockContent::Image { url, caption } | BlockContent::Video { url, caption } => {
            non_empty("media url", url)?;
            if url.chars().any(char::is_whitespace) {
                return Err(Error::validation("media url contains whitespace"));
            }
            body("caption", caption)
        }
        BlockContent::TodoList { items } => {
            for (i, item) in items.iter().enumerate() {
                let field = format!("todo item {i}");
                non_empty(&field, &item.text)?;
                single_line(&field, &item.text)?;
            }
            Ok(())
        }
        BlockContent::Checkpoint { title, note } => {
            non_empty("checkpoint title", title)?;
            single_line("checkpoint title", title)?;
            body("note", note)
        }
    }
}

fn body(field: &str, value: &str) -> Result<()> {
    if value.len() > MAX_BODY_BYTES {
        return Err(Error::validation(format!(
            "{field} is {} bytes, limit is {MAX_BODY_BYTES}",
            value.len()
        )));
    }
    Ok(())
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{field} is empty")));
    }
    Ok(())
}

fn single_line(field: &str, value: &str) -> Result<()> {
    if value.contains(['\n', '\r']) {
        return Err(Error::validation(format!("{field} spans multiple lines")));
    }
    body(field, value)
}
