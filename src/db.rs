//! SQLite adapter: connection lifecycle, schema, typed execution, and the
//! named statement set issued by the cache engine.
//!
//! Execution follows a fixed return-shape rule. A void write maps `DONE`
//! to the affected row count and a constraint violation to
//! [`DbError::DuplicateKey`]; a row query maps `ROW` to `Some(value)` and
//! `DONE` to `None`; a sequence query consumes every remaining row. Text
//! and blob arguments are copied at bind time, so no caller buffer has to
//! outlive the statement step.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{CachedStatement, Connection, OpenFlags, OptionalExtension, Params, Row};
use thiserror::Error;

use crate::time::{epoch_to_instant, instant_to_epoch};

/// How long a statement waits on a contended database lock before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(600);

/// Upper bound on compiled statements kept alive between calls. Sized
/// above the full [`Stmt`] set so no named statement is ever evicted.
const STATEMENT_CACHE_CAPACITY: usize = 24;

const INIT_PRAGMAS: &str = "\
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA cache_size=10000;
    PRAGMA temp_store=MEMORY;
    PRAGMA mmap_size=268435456;
    PRAGMA analysis_limit=1000;
    PRAGMA busy_timeout=600000;";

const INIT_SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS cache (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT UNIQUE NOT NULL,
        path TEXT DEFAULT NULL,
        value BLOB DEFAULT NULL,
        expire REAL DEFAULT NULL,
        last_update REAL NOT NULL DEFAULT (strftime('%s', 'now')),
        last_use REAL NOT NULL DEFAULT (strftime('%s', 'now')),
        access_count_since_last_update INT NOT NULL DEFAULT 0,
        size INT NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_key ON cache (key);

    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value
    );

    INSERT OR IGNORE INTO meta (key, value) VALUES ('size', '0');

    CREATE TRIGGER IF NOT EXISTS cache_size_insert
    AFTER INSERT ON cache
    BEGIN
        UPDATE meta SET value = COALESCE((SELECT SUM(size) FROM cache), 0) WHERE key = 'size';
    END;

    CREATE TRIGGER IF NOT EXISTS cache_size_delete
    AFTER DELETE ON cache
    BEGIN
        UPDATE meta SET value = COALESCE((SELECT SUM(size) FROM cache), 0) WHERE key = 'size';
    END;

    CREATE TRIGGER IF NOT EXISTS cache_size_update
    AFTER UPDATE OF size ON cache
    BEGIN
        UPDATE meta SET value = COALESCE((SELECT SUM(size) FROM cache), 0) WHERE key = 'size';
    END;";

/// Errors surfaced by the adapter.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to create database directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to open database: {0}")]
    Open(#[source] rusqlite::Error),

    #[error("failed to apply schema: {0}")]
    Schema(#[source] rusqlite::Error),

    #[error("duplicate key")]
    DuplicateKey,

    #[error("sql execution failed: {0}")]
    Sql(#[source] rusqlite::Error),

    #[error("failed to close database: {0}")]
    Close(#[source] rusqlite::Error),
}

impl DbError {
    fn from_step(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                DbError::DuplicateKey
            }
            other => DbError::Sql(other),
        }
    }
}

/// Binds an absolute instant as an epoch double (REAL column), and
/// extracts one back with nanosecond lifting.
#[derive(Debug, Clone, Copy)]
pub struct Epoch(pub SystemTime);

impl ToSql for Epoch {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(instant_to_epoch(self.0)))
    }
}

impl FromSql for Epoch {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        f64::column_result(value).map(|epoch| Epoch(epoch_to_instant(epoch)))
    }
}

/// The named statement set. Each member compiles lazily on first use and
/// stays cached until the connection closes.
///
/// Read-path members filter on `(expire IS NULL OR expire > now)` so an
/// expired row is never observed; write-path members compute `expire`
/// from a TTL bound in seconds. The expire pass binds a full-precision
/// epoch double instead of the second-granular SQL `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stmt {
    Count,
    Keys,
    Exists,
    GetByKey,
    GetPathByKey,
    ReplaceInline,
    ReplaceExternal,
    InsertInline,
    InsertExternal,
    DeleteByKey,
    DeleteAll,
    TouchByKey,
    SelectExpiredPaths,
    DeleteExpired,
    MetaSize,
    CheckCount,
}

impl Stmt {
    pub fn sql(self) -> &'static str {
        match self {
            Stmt::Count => {
                "SELECT COUNT(*) FROM cache \
                 WHERE expire IS NULL OR expire > strftime('%s', 'now');"
            }
            Stmt::Keys => {
                "SELECT key FROM cache \
                 WHERE expire IS NULL OR expire > strftime('%s', 'now');"
            }
            Stmt::Exists => {
                "SELECT 1 FROM cache WHERE key = ?1 \
                 AND (expire IS NULL OR expire > strftime('%s', 'now')) LIMIT 1;"
            }
            Stmt::GetByKey => {
                "SELECT value, path FROM cache WHERE key = ?1 \
                 AND (expire IS NULL OR expire > strftime('%s', 'now'));"
            }
            Stmt::GetPathByKey => "SELECT path FROM cache WHERE key = ?1;",
            Stmt::ReplaceInline => {
                "REPLACE INTO cache (key, value, expire, size) \
                 VALUES (?1, ?2, strftime('%s', 'now') + ?3, ?4);"
            }
            Stmt::ReplaceExternal => {
                "REPLACE INTO cache (key, path, expire, size) \
                 VALUES (?1, ?2, strftime('%s', 'now') + ?3, ?4);"
            }
            Stmt::InsertInline => {
                "INSERT INTO cache (key, value, expire, size) \
                 VALUES (?1, ?2, strftime('%s', 'now') + ?3, ?4);"
            }
            Stmt::InsertExternal => {
                "INSERT INTO cache (key, path, expire, size) \
                 VALUES (?1, ?2, strftime('%s', 'now') + ?3, ?4);"
            }
            Stmt::DeleteByKey => "DELETE FROM cache WHERE key = ?1;",
            Stmt::DeleteAll => "DELETE FROM cache;",
            Stmt::TouchByKey => {
                "UPDATE cache SET last_update = strftime('%s', 'now'), \
                 last_use = strftime('%s', 'now'), \
                 expire = strftime('%s', 'now') + ?1 WHERE key = ?2;"
            }
            Stmt::SelectExpiredPaths => {
                "SELECT path FROM cache \
                 WHERE expire IS NOT NULL AND expire <= ?1 AND path IS NOT NULL;"
            }
            Stmt::DeleteExpired => {
                "DELETE FROM cache WHERE expire IS NOT NULL AND expire <= ?1;"
            }
            Stmt::MetaSize => "SELECT CAST(value AS INTEGER) FROM meta WHERE key = 'size';",
            Stmt::CheckCount => "SELECT COUNT(*) FROM cache;",
        }
    }
}

/// A file-backed SQLite connection with the cache schema applied.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (creating if absent) the database file at `path`, together
    /// with any missing parent directory.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| DbError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(DbError::Open)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(DbError::Open)?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);

        Ok(Database { conn })
    }

    /// Applies the PRAGMA batch and the schema batch. Idempotent; fails
    /// on a corrupt or non-SQLite file.
    pub fn initialize(&self) -> Result<(), DbError> {
        self.conn.execute_batch(INIT_PRAGMAS).map_err(DbError::Schema)?;
        self.conn.execute_batch(INIT_SCHEMA).map_err(DbError::Schema)?;
        Ok(())
    }

    fn prepared(&self, stmt: Stmt) -> Result<CachedStatement<'_>, DbError> {
        self.conn.prepare_cached(stmt.sql()).map_err(DbError::Sql)
    }

    /// One-shot execution of a void write. Returns the affected row
    /// count; a unique-key violation becomes [`DbError::DuplicateKey`].
    pub fn run<P: Params>(&self, stmt: Stmt, params: P) -> Result<usize, DbError> {
        self.prepared(stmt)?.execute(params).map_err(DbError::from_step)
    }

    /// Single-row query: `ROW` yields `Some(extract(row))`, `DONE` yields
    /// `None`.
    pub fn one<T, P, F>(&self, stmt: Stmt, params: P, extract: F) -> Result<Option<T>, DbError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.prepared(stmt)?
            .query_row(params, extract)
            .optional()
            .map_err(DbError::from_step)
    }

    /// Sequence query: consumes every remaining row into a vector.
    pub fn all<T, P, F>(&self, stmt: Stmt, params: P, mut extract: F) -> Result<Vec<T>, DbError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut prepared = self.prepared(stmt)?;
        let rows = prepared
            .query_map(params, |row| extract(row))
            .map_err(DbError::from_step)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(DbError::from_step)?);
        }
        Ok(out)
    }

    /// Runs `body` inside a deferred transaction: commits when it returns
    /// `Ok`, rolls back when it returns `Err`. Statements issued through
    /// `body`'s borrow of this database join the transaction.
    pub fn with_transaction<T>(
        &self,
        body: impl FnOnce(&Self) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let tx = self.conn.unchecked_transaction().map_err(DbError::Sql)?;
        let out = body(self)?;
        tx.commit().map_err(DbError::Sql)?;
        Ok(out)
    }

    /// Finalizes every cached statement, then closes the connection.
    /// Statement finalization precedes the close so the connection never
    /// shuts down with live compiled handles.
    pub fn close(self) -> Result<(), DbError> {
        self.conn.close().map_err(|(_conn, err)| DbError::Close(err))
    }
}
