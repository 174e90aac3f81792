//! Engine configuration.
//!
//! Loaded from TOML; every field has a default so an empty file (or no file)
//! is a valid configuration.
//!
//! ```toml
//! retention_days = 30
//! rebalance_threshold = 16
//!
//! [chronicle]
//! max_attempts = 5
//! timeout_ms = 2000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Block engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Days a soft-deleted block stays restorable.
    pub retention_days: u64,
    /// Average active key length (symbols) above which a book is renumbered.
    pub rebalance_threshold: usize,
    /// FlowBus channel capacity for lifecycle notifications.
    pub flow_capacity: usize,
    pub chronicle: ChronicleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            rebalance_threshold: 16,
            flow_capacity: 1024,
            chronicle: ChronicleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rebalance_threshold < 2 {
            return Err(ConfigError::Invalid(
                "rebalance_threshold must be at least 2".into(),
            ));
        }
        if self.flow_capacity == 0 {
            return Err(ConfigError::Invalid("flow_capacity must be positive".into()));
        }
        self.chronicle.validate()
    }

    /// Retention window in milliseconds.
    pub fn retention_millis(&self) -> u64 {
        self.retention_days.saturating_mul(MILLIS_PER_DAY)
    }

    pub fn with_retention_days(mut self, days: u64) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_rebalance_threshold(mut self, threshold: usize) -> Self {
        self.rebalance_threshold = threshold;
        self
    }

    pub fn with_chronicle(mut self, chronicle: ChronicleConfig) -> Self {
        self.chronicle = chronicle;
        self
    }
}

/// Delivery settings for the Chronicle emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChronicleConfig {
    /// Delivery attempts per notification before it is dead-lettered.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Notifications waiting for delivery. Overflow is dead-lettered
    /// without an attempt.
    pub queue_capacity: usize,
    /// Dead letters kept; the oldest are dropped beyond this.
    pub dead_letter_capacity: usize,
}

impl Default for ChronicleConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
            timeout_ms: 2000,
            queue_capacity: 4096,
            dead_letter_capacity: 1024,
        }
    }
}

impl ChronicleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "chronicle.max_attempts must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "chronicle.queue_capacity must be positive".into(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::Invalid(
                "chronicle.max_backoff_ms is below initial_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff before attempt `attempt + 1` (attempts count from 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}
