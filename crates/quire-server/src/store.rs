//! The on-disk store: one SQLite file holding blocks, history and books.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use quire_kernel::{BlockEngine, EngineConfig, SqliteBookDirectory, SqliteRepository};

pub struct Store {
    pub repo: Arc<SqliteRepository>,
    pub books: Arc<SqliteBookDirectory>,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let repo = SqliteRepository::open(path)
            .with_context(|| format!("opening block store {}", path.display()))?;
        let books = SqliteBookDirectory::open(path)
            .with_context(|| format!("opening book table {}", path.display()))?;
        tracing::debug!(path = %path.display(), "store opened");
        Ok(Self {
            repo: Arc::new(repo),
            books: Arc::new(books),
        })
    }

    /// Build an engine over this store. Needs a tokio runtime.
    pub fn engine(&self, config: &EngineConfig) -> Result<BlockEngine> {
        let engine = BlockEngine::builder(self.repo.clone(), self.books.clone())
            .config(config.clone())
            .build()?;
        Ok(engine)
    }
}
