//! # sciqlop-cache
//!
//! Persistent, embeddable key/value cache with TTL expiration and hybrid
//! inline/file storage.
//!
//! Entries are identified by arbitrary text keys and hold opaque byte
//! blobs. Small values live inline as SQLite rows; values above a size
//! threshold land in randomly named blob files under a sharded directory
//! tree and are memory-mapped on read. The cache persists across process
//! restarts and is safe to share across threads.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sciqlop_cache::Cache;
//!
//! let cache = Cache::new("./.cache", 0).unwrap();
//!
//! cache.set("telemetry/last-frame", b"payload", None);
//! if let Some(view) = cache.get("telemetry/last-frame") {
//!     assert_eq!(&view[..], b"payload");
//! }
//! ```
//!
//! ## Storage layout
//!
//! ```text
//! <root>/
//! ├── sciqlop-cache.db     # SQLite store (plus WAL/SHM siblings)
//! └── <aa>/<bb>/<name>     # external blobs, sharded by name prefix
//! ```
//!
//! ## Guarantees
//!
//! - Every entry is stored exactly one way: inline blob or external file.
//! - Readers never observe an expired entry; `expire()` reclaims rows and
//!   their blob files.
//! - A blob file that disappears out from under its row is recovered
//!   lazily: the next lookup drops the row and reports a miss.
//! - All operations on a constructed cache are total; failures surface as
//!   return values, never as panics.

// Cache engine and public API
pub mod cache;
pub use cache::{Cache, CacheError, DB_FILENAME, DEFAULT_FILE_SIZE_THRESHOLD, DEFAULT_TTL};

// SQLite adapter
pub mod db;
pub use db::{Database, DbError};

// External blob files
pub mod content_store;
pub use content_store::{ContentStore, ContentStoreError};

// Read-only payload views
pub mod memory_view;
pub use memory_view::MemoryView;

// Observability counters
pub mod metrics;
pub use metrics::MetricsSnapshot;

// Instant / epoch conversions
pub mod time;
