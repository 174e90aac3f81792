//! Book existence checks.
//!
//! Books are owned by another subsystem; the engine only asks whether one
//! exists and whether it is deleted before creating blocks in it or changing
//! its structure.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use quire_types::BookId;

use crate::error::{Error, Result};

/// Read-only view of the Book catalogue.
#[async_trait]
pub trait BookDirectory: Send + Sync {
    async fn book_exists(&self, book_id: BookId) -> Result<bool>;
    async fn book_is_deleted(&self, book_id: BookId) -> Result<bool>;
}

/// Fail with `BookNotFound`/`BookDeleted` unless the book is usable.
pub async fn ensure_writable(books: &dyn BookDirectory, book_id: BookId) -> Result<()> {
    if !books.book_exists(book_id).await? {
        return Err(Error::BookNotFound(book_id));
    }
    if books.book_is_deleted(book_id).await? {
        return Err(Error::BookDeleted(book_id));
    }
    Ok(())
}

/// Book directory held in memory. Value is the deleted flag.
#[derive(Debug, Default)]
pub struct MemoryBookDirectory {
    books: DashMap<BookId, bool>,
}

impl MemoryBookDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a book, returning its id.
    pub fn add(&self, book_id: BookId) -> BookId {
        self.books.insert(book_id, false);
        book_id
    }

    pub fn mark_deleted(&self, book_id: BookId) {
        if let Some(mut deleted) = self.books.get_mut(&book_id) {
            *deleted = true;
        }
    }
}

#[async_trait]
impl BookDirectory for MemoryBookDirectory {
    async fn book_exists(&self, book_id: BookId) -> Result<bool> {
        Ok(self.books.contains_key(&book_id))
    }

    async fn book_is_deleted(&self, book_id: BookId) -> Result<bool> {
        Ok(self.books.get(&book_id).is_some_and(|d| *d))
    }
}

const BOOKS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS books (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
);
"#;

/// A row of the `books` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookRecord {
    pub id: BookId,
    pub title: String,
    pub created_at: u64,
    pub deleted_at: Option<u64>,
}

/// Book directory reading a `books` table, usually in the same database
/// file as the blocks.
pub struct SqliteBookDirectory {
    conn: Mutex<Connection>,
}

impl SqliteBookDirectory {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(BOOKS_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(BOOKS_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn add(&self, title: &str, now: u64) -> Result<BookId> {
        let id = BookId::new();
        self.conn.lock().execute(
            "INSERT INTO books (id, title, created_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), title, now as i64],
        )?;
        Ok(id)
    }

    /// Returns false if the book is unknown or already deleted.
    pub fn mark_deleted(&self, book_id: BookId, now: u64) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE books SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![book_id.to_string(), now as i64],
        )?;
        Ok(changed > 0)
    }

    pub fn list(&self) -> Result<Vec<BookRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, title, created_at, deleted_at FROM books ORDER BY created_at, id")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            Ok((id, row.get::<_, String>(1)?, row.get::<_, i64>(2)?, row.get::<_, Option<i64>>(3)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, title, created_at, deleted_at) = row?;
            let id = BookId::parse(&id).map_err(|e| Error::Storage(format!("book id {id:?}: {e}")))?;
            out.push(BookRecord {
                id,
                title,
                created_at: created_at as u64,
                deleted_at: deleted_at.map(|t| t as u64),
            });
        }
        Ok(out)
    }

    fn deleted_at(&self, book_id: BookId) -> Result<Option<Option<i64>>> {
        Ok(self
            .conn
            .lock()
            .query_row(
                "SELECT deleted_at FROM books WHERE id = ?1",
                params![book_id.to_string()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?)
    }
}

#[async_trait]
impl BookDirectory for SqliteBookDirectory {
    async fn book_exists(&self, book_id: BookId) -> Result<bool> {
        Ok(self.deleted_at(book_id)?.is_some())
    }

    async fn book_is_deleted(&self, book_id: BookId) -> Result<bool> {
        Ok(matches!(self.deleted_at(book_id)?, Some(Some(_))))
    }
}
