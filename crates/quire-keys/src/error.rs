//! Key space errors.

use thiserror::Error;

/// Errors from key validation and generation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid order key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("invalid key range ({lo:?}, {hi:?}): {reason}")]
    InvalidKeyRange {
        lo: Option<String>,
        hi: Option<String>,
        reason: &'static str,
    },
}

impl KeyError {
    /// Short description of what was wrong.
    pub fn reason(&self) -> &'static str {
        match self {
            KeyError::InvalidKey { reason, .. } | KeyError::InvalidKeyRange { reason, .. } => reason,
        }
    }
}
