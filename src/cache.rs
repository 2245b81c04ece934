//! The cache engine: public API, hybrid placement policy, TTL model, and
//! size accounting.
//!
//! Values at or below [`Cache::file_size_threshold`] live inline as row
//! blobs; larger values are written to the content store and the row
//! keeps only the file path. Exactly one of the two representations is
//! populated per entry. Writes order the file mutation against the row
//! mutation (write file, then insert the row, removing the file if the
//! row write fails; delete the row, then its file) so a crash can leave
//! at worst an orphaned file, which the next lookup recovers lazily.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use log::{error, warn};
use rusqlite::params;
use thiserror::Error;

use crate::content_store::ContentStore;
use crate::db::{Database, DbError, Epoch, Stmt};
use crate::memory_view::MemoryView;
use crate::metrics::{CacheMetrics, MetricsSnapshot};

/// Fixed name of the SQLite file under the cache root. `clear` preserves
/// this file and its WAL/SHM siblings.
pub const DB_FILENAME: &str = "sciqlop-cache.db";

/// Placement threshold in bytes: values at or below stay inline, values
/// strictly above go to the content store.
pub const DEFAULT_FILE_SIZE_THRESHOLD: usize = 8192;

/// Expiration applied when a write does not name a TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Errors that make a cache unusable at construction time. This is the
/// only fatal surface; every operation on a constructed cache reports
/// failure through its return value instead.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to create cache root {path:?}: {source}")]
    Root {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to initialize cache database: {0}")]
    Initialization(#[from] DbError),
}

/// A persistent key/value cache with TTL expiration and hybrid
/// inline/file storage.
///
/// Safe to share across threads (`Arc<Cache>`): every public operation
/// may be called concurrently. Two `Cache` instances over the same root
/// directory in one process are not supported; SQLite's own locking
/// bounds the damage across processes.
pub struct Cache {
    root: PathBuf,
    max_size: u64,
    file_size_threshold: usize,
    db: Mutex<Database>,
    store: ContentStore,
    metrics: CacheMetrics,
}

impl Cache {
    /// Opens (creating if needed) a cache rooted at `root`.
    ///
    /// `max_size` is an advisory bound reserved for a future size-driven
    /// eviction policy; it is stored but not enforced.
    pub fn new(root: impl AsRef<Path>, max_size: u64) -> Result<Self, CacheError> {
        Self::with_file_size_threshold(root, max_size, DEFAULT_FILE_SIZE_THRESHOLD)
    }

    /// As [`Cache::new`], with an explicit inline/external placement
    /// threshold in bytes.
    pub fn with_file_size_threshold(
        root: impl AsRef<Path>,
        max_size: u64,
        file_size_threshold: usize,
    ) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        let store = ContentStore::new(&root).map_err(|source| CacheError::Root {
            path: root.clone(),
            source,
        })?;

        let db = Database::open(&root.join(DB_FILENAME))?;
        db.initialize()?;

        Ok(Cache {
            root,
            max_size,
            file_size_threshold,
            db: Mutex::new(db),
            store,
            metrics: CacheMetrics::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn file_size_threshold(&self) -> usize {
        self.file_size_threshold
    }

    // A poisoned lock is re-entered rather than propagated; no public
    // operation panics.
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of non-expired entries.
    pub fn count(&self) -> u64 {
        match self.db().one(Stmt::Count, [], |row| row.get::<_, i64>(0)) {
            Ok(Some(n)) => n.max(0) as u64,
            Ok(None) => 0,
            Err(e) => {
                warn!("count failed: {e}");
                0
            }
        }
    }

    /// Total byte size of all stored values, from the `meta` running
    /// total maintained by the schema triggers.
    pub fn size(&self) -> u64 {
        match self.db().one(Stmt::MetaSize, [], |row| row.get::<_, i64>(0)) {
            Ok(Some(n)) => n.max(0) as u64,
            Ok(None) => 0,
            Err(e) => {
                warn!("size failed: {e}");
                0
            }
        }
    }

    /// Keys of all non-expired entries, in unspecified order.
    pub fn keys(&self) -> Vec<String> {
        match self.db().all(Stmt::Keys, [], |row| row.get(0)) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("keys failed: {e}");
                Vec::new()
            }
        }
    }

    /// True when a non-expired entry with `key` exists.
    pub fn exists(&self, key: &str) -> bool {
        match self.db().one(Stmt::Exists, [key], |row| row.get::<_, i64>(0)) {
            Ok(row) => row.is_some(),
            Err(e) => {
                warn!("exists({key}) failed: {e}");
                false
            }
        }
    }

    /// Inserts or replaces `key` with `value`, expiring after `ttl`
    /// (default one hour). A replaced entry's external blob is removed
    /// after the row write succeeds.
    pub fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> bool {
        let ttl_secs = ttl.unwrap_or(DEFAULT_TTL).as_secs_f64();
        let size = value.len() as i64;

        if value.len() <= self.file_size_threshold {
            let db = self.db();
            let previous = self.path_for(&db, key);
            match db.run(Stmt::ReplaceInline, params![key, value, ttl_secs, size]) {
                Ok(_) => {
                    if let Some(prev) = previous {
                        self.store.remove(Path::new(&prev), false);
                    }
                    self.metrics.record_write();
                    true
                }
                Err(e) => {
                    error!("set({key}) failed: {e}");
                    false
                }
            }
        } else {
            // The fresh blob targets a path no reader can know yet, so it
            // is written before the engine lock is taken.
            let path = match self.store.store(value) {
                Ok(path) => path,
                Err(e) => {
                    error!("set({key}) failed to write blob: {e}");
                    return false;
                }
            };
            let path_text = path.to_string_lossy().into_owned();

            let db = self.db();
            let previous = self.path_for(&db, key);
            match db.run(
                Stmt::ReplaceExternal,
                params![key, path_text, ttl_secs, size],
            ) {
                Ok(_) => {
                    if let Some(prev) = previous {
                        self.store.remove(Path::new(&prev), false);
                    }
                    self.metrics.record_write();
                    true
                }
                Err(e) => {
                    error!("set({key}) failed: {e}");
                    self.store.remove(&path, false);
                    false
                }
            }
        }
    }

    /// Inserts `key` only if absent; returns false when the key already
    /// exists (the stored value is left untouched) or on failure.
    pub fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> bool {
        let ttl_secs = ttl.unwrap_or(DEFAULT_TTL).as_secs_f64();
        let size = value.len() as i64;

        if value.len() <= self.file_size_threshold {
            match self
                .db()
                .run(Stmt::InsertInline, params![key, value, ttl_secs, size])
            {
                Ok(_) => {
                    self.metrics.record_write();
                    true
                }
                Err(DbError::DuplicateKey) => false,
                Err(e) => {
                    error!("add({key}) failed: {e}");
                    false
                }
            }
        } else {
            let path = match self.store.store(value) {
                Ok(path) => path,
                Err(e) => {
                    error!("add({key}) failed to write blob: {e}");
                    return false;
                }
            };
            let path_text = path.to_string_lossy().into_owned();

            let result = self.db().run(
                Stmt::InsertExternal,
                params![key, path_text, ttl_secs, size],
            );
            match result {
                Ok(_) => {
                    self.metrics.record_write();
                    true
                }
                Err(e) => {
                    if !matches!(e, DbError::DuplicateKey) {
                        error!("add({key}) failed: {e}");
                    }
                    self.store.remove(&path, false);
                    false
                }
            }
        }
    }

    /// Looks up `key`, returning a view over its bytes.
    ///
    /// Missing or expired entries return `None`. An entry whose external
    /// blob can no longer be opened is corrupt: its row is deleted and
    /// the lookup reports a miss.
    pub fn get(&self, key: &str) -> Option<MemoryView> {
        let db = self.db();
        let row = match db.one(Stmt::GetByKey, [key], |row| {
            Ok((
                row.get::<_, Option<Vec<u8>>>(0)?,
                row.get::<_, Option<String>>(1)?,
            ))
        }) {
            Ok(row) => row,
            Err(e) => {
                warn!("get({key}) failed: {e}");
                None
            }
        };

        let Some((value, path)) = row else {
            self.metrics.record_miss();
            return None;
        };

        let path = path.unwrap_or_default();
        if !path.is_empty() {
            match self.store.load(Path::new(&path)) {
                Ok(Some(view)) => {
                    self.metrics.record_hit();
                    return Some(view);
                }
                Ok(None) => warn!("get({key}): blob {path} is gone"),
                Err(e) => warn!("get({key}): {e}"),
            }

            if let Err(e) = db.run(Stmt::DeleteByKey, [key]) {
                error!("get({key}): failed to drop corrupt entry: {e}");
            }
            self.metrics.record_miss();
            return None;
        }

        self.metrics.record_hit();
        Some(MemoryView::owned(value.unwrap_or_default()))
    }

    /// Looks up `key` and then deletes it. The delete is best-effort and
    /// does not change the returned value.
    pub fn pop(&self, key: &str) -> Option<MemoryView> {
        let view = self.get(key);
        if !self.del(key) && view.is_some() {
            warn!("pop({key}): delete failed");
        }
        view
    }

    /// Deletes the entry for `key` and, if it referenced an external
    /// blob, removes that file. Returns false when no row was removed.
    pub fn del(&self, key: &str) -> bool {
        let db = self.db();
        let previous = self.path_for(&db, key);
        match db.run(Stmt::DeleteByKey, [key]) {
            Ok(0) => false,
            Ok(_) => {
                if let Some(prev) = previous {
                    self.store.remove(Path::new(&prev), false);
                }
                self.metrics.record_delete();
                true
            }
            Err(e) => {
                error!("del({key}) failed: {e}");
                false
            }
        }
    }

    /// Refreshes `key`'s expiration to now + `ttl`, together with its
    /// `last_update` and `last_use` stamps. Reports whether the update
    /// statement ran; a missing key is not a failure.
    pub fn touch(&self, key: &str, ttl: Duration) -> bool {
        match self
            .db()
            .run(Stmt::TouchByKey, params![ttl.as_secs_f64(), key])
        {
            Ok(_) => true,
            Err(e) => {
                error!("touch({key}) failed: {e}");
                false
            }
        }
    }

    /// Removes every entry whose expiration has elapsed, together with
    /// its external blob. The scan and the bulk delete run under the
    /// engine lock against the same observed instant, so the pass sees a
    /// consistent snapshot.
    pub fn expire(&self) {
        let now = Epoch(SystemTime::now());
        let db = self.db();

        let removed = db.with_transaction(|db| {
            let paths = db.all(Stmt::SelectExpiredPaths, [now], |row| {
                row.get::<_, Option<String>>(0)
            })?;

            for path in paths.into_iter().flatten() {
                if !path.is_empty() {
                    self.store.remove(Path::new(&path), false);
                }
            }

            db.run(Stmt::DeleteExpired, [now])
        });

        match removed {
            Ok(n) => self.metrics.record_expired(n as u64),
            Err(e) => error!("expire pass failed: {e}"),
        }
    }

    /// Reserved hook for a size-driven eviction policy. Currently removes
    /// nothing and reports success.
    pub fn evict(&self) -> bool {
        true
    }

    /// Deletes every entry, then removes everything under the cache root
    /// except the database file and its WAL/SHM siblings.
    pub fn clear(&self) {
        let db = self.db();
        if let Err(e) = db.run(Stmt::DeleteAll, []) {
            error!("clear failed: {e}");
            return;
        }

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("clear: failed to read {}: {e}", self.root.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(DB_FILENAME) {
                continue;
            }
            self.store.remove(&entry.path(), true);
        }
    }

    /// Probes that the store is readable.
    pub fn check(&self) -> bool {
        match self
            .db()
            .one(Stmt::CheckCount, [], |row| row.get::<_, i64>(0))
        {
            Ok(Some(n)) => n >= 0,
            Ok(None) => false,
            Err(e) => {
                warn!("check failed: {e}");
                false
            }
        }
    }

    /// Snapshot of the operation counters accumulated by this instance.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Finalizes the compiled statement set and closes the database
    /// connection, reporting failure. Dropping the cache performs the
    /// same sequence without the report.
    pub fn close(self) -> bool {
        let db = self.db.into_inner().unwrap_or_else(PoisonError::into_inner);
        match db.close() {
            Ok(()) => true,
            Err(e) => {
                error!("close failed: {e}");
                false
            }
        }
    }

    // Non-empty external path currently referenced by `key`, expired rows
    // included (a replace or delete must free the old blob either way).
    fn path_for(&self, db: &Database, key: &str) -> Option<String> {
        match db.one(Stmt::GetPathByKey, [key], |row| {
            row.get::<_, Option<String>>(0)
        }) {
            Ok(Some(path)) => path.filter(|p| !p.is_empty()),
            Ok(None) => None,
            Err(e) => {
                warn!("path lookup for {key} failed: {e}");
                None
            }
        }
    }
}
