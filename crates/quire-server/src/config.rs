//! Server configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid:
//!
//! ```toml
//! database = "/var/lib/quire/quire.db"
//! sweep_interval_secs = 3600
//!
//! [engine]
//! retention_days = 30
//! rebalance_threshold = 16
//!
//! [engine.chronicle]
//! max_attempts = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use quire_kernel::EngineConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// SQLite file holding blocks, history and books.
    pub database: PathBuf,
    /// Seconds between retention sweeps.
    pub sweep_interval_secs: u64,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database: default_db_path(),
            sweep_interval_secs: 3600,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `~/.config/quire/server.toml` (platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("quire").join("server.toml"))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context("parsing server config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Load `path` if given (it must exist), else the default file if it
    /// exists, else the built-in defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(default) if default.exists() => Self::load(&default),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be positive");
        }
        self.engine.validate()?;
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Default database location under the user's local data directory.
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quire")
        .join("quire.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.sweep_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_nested_engine_section() {
        let config = ServerConfig::from_toml_str(
            r#"
            database = "/tmp/q.db"
            sweep_interval_secs = 60

            [engine]
            retention_days = 7

            [engine.chronicle]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.database, PathBuf::from("/tmp/q.db"));
        assert_eq!(config.engine.retention_days, 7);
        assert_eq!(config.engine.rebalance_threshold, 16);
        assert_eq!(config.engine.chronicle.max_attempts, 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ServerConfig::from_toml_str("sweep_interval_secs = 0").is_err());
        assert!(ServerConfig::from_toml_str("[engine]\nrebalance_threshold = 1").is_err());
        assert!(ServerConfig::from_toml_str("database = 3").is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "sweep_interval_secs = \"often\"").unwrap();
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("server.toml"));

        let missing = ServerConfig::resolve(Some(&dir.path().join("nope.toml")));
        assert!(missing.is_err());
    }
}
