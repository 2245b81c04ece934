//! External blob files under a sharded directory tree.
//!
//! Each stored value gets a fresh random 128-bit identifier rendered as
//! 32 hex characters, and lands at `root/<aa>/<bb>/<name>` where `<aa>`
//! and `<bb>` are the first two character pairs of the name. Fresh
//! identifiers mean a blob is never rewritten in place and no two writers
//! ever target the same path.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::warn;
use memmap2::Mmap;
use thiserror::Error;
use uuid::Uuid;

use crate::memory_view::MemoryView;

/// Errors surfaced by the content store.
#[derive(Debug, Error)]
pub enum ContentStoreError {
    #[error("failed to write blob {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to map blob {path:?}: {source}")]
    Map { path: PathBuf, source: io::Error },
}

/// Allocates, reads, and frees blob files under a root directory.
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Creates the store over `root`, creating the directory if absent.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(ContentStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn fresh_name() -> String {
        Uuid::new_v4().simple().to_string()
    }

    fn sharded_path(&self, name: &str) -> PathBuf {
        self.root.join(&name[0..2]).join(&name[2..4]).join(name)
    }

    /// Writes `bytes` to a freshly named file and returns its full path.
    ///
    /// Never overwrites an existing file. A partial file left behind by a
    /// failed write is removed before the error is returned.
    pub fn store(&self, bytes: &[u8]) -> Result<PathBuf, ContentStoreError> {
        let name = Self::fresh_name();
        let path = self.sharded_path(&name);

        if let Err(source) = write_new(&path, bytes) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove partial blob {}: {e}", path.display());
                }
            }
            return Err(ContentStoreError::Write { path, source });
        }
        Ok(path)
    }

    /// Maps the file at `path` read-only, without copying.
    ///
    /// Returns `None` when the file does not exist; an existing but
    /// unreadable file is an error.
    pub fn load(&self, path: &Path) -> Result<Option<MemoryView>, ContentStoreError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ContentStoreError::Map {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        // Safety: blobs are written once under a fresh name and only ever
        // unlinked, never truncated or rewritten, so the mapping stays
        // stable for its lifetime.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| ContentStoreError::Map {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(MemoryView::mapped(mmap)))
    }

    /// Removes the file at `path`, or the whole subtree when `recursive`
    /// is set and the path is a directory. Returns false when nothing was
    /// removed.
    pub fn remove(&self, path: &Path, recursive: bool) -> bool {
        let result = if recursive && path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };

        match result {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!("failed to remove {}: {e}", path.display());
                false
            }
        }
    }
}

fn write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_uses_sharded_layout() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();

        let path = store.store(b"payload").unwrap();
        assert!(path.starts_with(dir.path()));

        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 32);

        let relative = path.strip_prefix(dir.path()).unwrap();
        let components: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(components, vec![name[0..2].to_owned(), name[2..4].to_owned(), name.to_owned()]);
    }

    #[test]
    fn test_store_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();

        let path = store.store(b"some larger external payload").unwrap();
        let view = store.load(&path).unwrap().unwrap();
        assert_eq!(view.data(), b"some larger external payload");
        assert!(view.is_mapped());
    }

    #[test]
    fn test_fresh_names_never_collide_in_practice() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();

        let a = store.store(b"a").unwrap();
        let b = store.store(b"a").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();

        let missing = dir.path().join("aa").join("bb").join("nope");
        assert!(store.load(&missing).unwrap().is_none());
    }

    #[test]
    fn test_remove_file_and_missing() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();

        let path = store.store(b"x").unwrap();
        assert!(store.remove(&path, false));
        assert!(!store.remove(&path, false));
    }

    #[test]
    fn test_remove_recursive_deletes_subtree() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();

        let path = store.store(b"x").unwrap();
        let shard = path.parent().unwrap().parent().unwrap().to_path_buf();
        assert!(store.remove(&shard, true));
        assert!(!path.exists());
        assert!(!shard.exists());
    }
}
