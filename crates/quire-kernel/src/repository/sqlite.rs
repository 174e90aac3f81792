//! SQLite repository.
//!
//! Two tables: `blocks` (current state) and `block_versions` (append-only
//! history). Every write runs in one transaction covering both, so a block
//! row never advances without its history entry. Content and snapshots are
//! stored as JSON.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use quire_types::{
    Block, BlockContent, BlockId, BlockStatus, BlockType, BlockVersion, BookId, ChangeType,
    VersionSnapshot,
};

use super::{apply_update, plan_rekey, BlockRepository, Mutator};
use crate::error::{Error, Result};
use crate::history::{self, Change};

const SCHEMA: &str = r#"
-- Current block state
CREATE TABLE IF NOT EXISTS blocks (
    id TEXT PRIMARY KEY,
    book_id TEXT NOT NULL,
    block_type TEXT NOT NULL,
    content TEXT,                -- JSON BlockContent, NULL once purged
    order_key TEXT NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_blocks_book_key ON blocks(book_id, order_key);
CREATE INDEX IF NOT EXISTS idx_blocks_status_deleted ON blocks(status, deleted_at);

-- History (append-only, immutable)
CREATE TABLE IF NOT EXISTS block_versions (
    block_id TEXT NOT NULL,
    book_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    change_type TEXT NOT NULL,
    snapshot TEXT NOT NULL,      -- JSON VersionSnapshot
    block_version INTEGER NOT NULL,
    occurred_at INTEGER NOT NULL,
    PRIMARY KEY (block_id, sequence)
);
CREATE INDEX IF NOT EXISTS idx_versions_book ON block_versions(book_id, occurred_at);
"#;

const BLOCK_COLUMNS: &str =
    "id, book_id, block_type, content, order_key, status, version, created_at, updated_at, deleted_at";

/// Block repository backed by a SQLite database.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl BlockRepository for SqliteRepository {
    fn get(&self, id: BlockId) -> Result<Option<Block>> {
        let conn = self.conn.lock();
        load_block(&conn, id)
    }

    fn list_active(&self, book_id: BookId) -> Result<Vec<Block>> {
        self.list_all(book_id, false)
    }

    fn list_all(&self, book_id: BookId, include_deleted: bool) -> Result<Vec<Block>> {
        let conn = self.conn.lock();
        let statuses = if include_deleted {
            "('active', 'soft_deleted')"
        } else {
            "('active')"
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks
             WHERE book_id = ?1 AND status IN {statuses}
             ORDER BY order_key"
        ))?;
        let rows = stmt.query_map(params![book_id.to_string()], block_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn insert(&self, block: Block, change: Change) -> Result<Block> {
        quire_keys::validate_key(&block.order_key)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if load_block(&tx, block.id)?.is_some() {
            return Err(Error::validation(format!("block {} already exists", block.id)));
        }
        if key_taken(&tx, block.book_id, &block.order_key, None)? {
            return Err(Error::validation(format!(
                "order key {} already used in book {}",
                block.order_key, block.book_id
            )));
        }
        tx.execute(
            &format!("INSERT INTO blocks ({BLOCK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                block.id.to_string(),
                block.book_id.to_string(),
                block.block_type.as_str(),
                content_json(block.content.as_ref())?,
                block.order_key,
                block.status.as_str(),
                block.version as i64,
                block.created_at as i64,
                block.updated_at as i64,
                block.deleted_at.map(|t| t as i64),
            ],
        )?;
        append_version(&tx, &block, change)?;
        tx.commit()?;
        Ok(block)
    }

    fn update(
        &self,
        id: BlockId,
        expected_version: u64,
        change: Change,
        mutator: Mutator<'_>,
    ) -> Result<Block> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut next = load_block(&tx, id)?.ok_or(Error::BlockNotFound(id))?;
        let old_key = next.order_key.clone();

        apply_update(&mut next, expected_version, change, mutator)?;
        if next.order_key != old_key && key_taken(&tx, next.book_id, &next.order_key, Some(id))? {
            return Err(Error::validation(format!(
                "order key {} already used in book {}",
                next.order_key, next.book_id
            )));
        }

        write_block(&tx, &next)?;
        append_version(&tx, &next, change)?;
        tx.commit()?;
        Ok(next)
    }

    fn rekey(
        &self,
        book_id: BookId,
        assignments: &[(BlockId, String)],
        at: u64,
    ) -> Result<Vec<Block>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let current = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {BLOCK_COLUMNS} FROM blocks WHERE book_id = ?1"
            ))?;
            let rows = stmt.query_map(params![book_id.to_string()], block_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let updated = plan_rekey(book_id, &current, assignments, at)?;

        let change = Change::new(ChangeType::Reordered, at);
        for block in &updated {
            write_block(&tx, block)?;
            append_version(&tx, block, change)?;
        }
        tx.commit()?;
        Ok(updated)
    }

    fn versions(&self, id: BlockId) -> Result<Vec<BlockVersion>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT block_id, book_id, sequence, change_type, snapshot, block_version, occurred_at
             FROM block_versions WHERE block_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt.query_map(params![id.to_string()], version_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn keys(&self, book_id: BookId) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT order_key FROM blocks WHERE book_id = ?1 ORDER BY order_key")?;
        let rows = stmt.query_map(params![book_id.to_string()], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    fn expired(&self, cutoff: u64) -> Result<Vec<Block>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks
             WHERE status = 'soft_deleted' AND deleted_at < ?1
             ORDER BY deleted_at, id"
        ))?;
        let rows = stmt.query_map(params![cutoff as i64], block_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// ============================================================================
// Row helpers
// ============================================================================

fn load_block(conn: &Connection, id: BlockId) -> Result<Option<Block>> {
    Ok(conn
        .query_row(
            &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE id = ?1"),
            params![id.to_string()],
            block_from_row,
        )
        .optional()?)
}

fn key_taken(conn: &Connection, book_id: BookId, key: &str, except: Option<BlockId>) -> Result<bool> {
    let except = except.map(|id| id.to_string()).unwrap_or_default();
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blocks WHERE book_id = ?1 AND order_key = ?2 AND id != ?3",
        params![book_id.to_string(), key, except],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn write_block(conn: &Connection, block: &Block) -> Result<()> {
    conn.execute(
        "UPDATE blocks SET block_type = ?2, content = ?3, order_key = ?4, status = ?5,
                version = ?6, updated_at = ?7, deleted_at = ?8
         WHERE id = ?1",
        params![
            block.id.to_string(),
            block.block_type.as_str(),
            content_json(block.content.as_ref())?,
            block.order_key,
            block.status.as_str(),
            block.version as i64,
            block.updated_at as i64,
            block.deleted_at.map(|t| t as i64),
        ],
    )?;
    Ok(())
}

fn append_version(conn: &Connection, block: &Block, change: Change) -> Result<()> {
    let last: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) FROM block_versions WHERE block_id = ?1",
        params![block.id.to_string()],
        |row| row.get(0),
    )?;
    let entry = history::entry(block, change, last as u64 + 1);
    conn.execute(
        "INSERT INTO block_versions
            (block_id, book_id, sequence, change_type, snapshot, block_version, occurred_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.block_id.to_string(),
            entry.book_id.to_string(),
            entry.sequence as i64,
            entry.change_type.as_str(),
            serde_json::to_string(&entry.snapshot)?,
            entry.block_version as i64,
            entry.occurred_at as i64,
        ],
    )?;
    Ok(())
}

fn content_json(content: Option<&BlockContent>) -> Result<Option<String>> {
    Ok(content.map(serde_json::to_string).transpose()?)
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_column<T, E>(
    row: &Row<'_>,
    idx: usize,
    parse: impl Fn(&str) -> std::result::Result<T, E>,
) -> rusqlite::Result<T>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| conversion_error(idx, e))
}

fn parse_enum<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse_column(row, idx, |s| parse(s).ok_or_else(|| format!("unknown value {s:?}")))
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<Block> {
    let content: Option<String> = row.get(3)?;
    let content = content
        .map(|c| serde_json::from_str::<BlockContent>(&c))
        .transpose()
        .map_err(|e| conversion_error(3, e))?;
    Ok(Block {
        id: parse_column(row, 0, BlockId::parse)?,
        book_id: parse_column(row, 1, BookId::parse)?,
        block_type: parse_enum(row, 2, BlockType::from_str)?,
        content,
        order_key: row.get(4)?,
        status: parse_enum(row, 5, BlockStatus::from_str)?,
        version: row.get::<_, i64>(6)? as u64,
        created_at: row.get::<_, i64>(7)? as u64,
        updated_at: row.get::<_, i64>(8)? as u64,
        deleted_at: row.get::<_, Option<i64>>(9)?.map(|t| t as u64),
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<BlockVersion> {
    Ok(BlockVersion {
        block_id: parse_column(row, 0, BlockId::parse)?,
        book_id: parse_column(row, 1, BookId::parse)?,
        sequence: row.get::<_, i64>(2)? as u64,
        change_type: parse_enum(row, 3, ChangeType::from_str)?,
        snapshot: parse_column(row, 4, |s| serde_json::from_str::<VersionSnapshot>(s))?,
        block_version: row.get::<_, i64>(5)? as u64,
        occurred_at: row.get::<_, i64>(6)? as u64,
    })
}
