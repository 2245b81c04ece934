//! Read-only byte views over cache payloads.
//!
//! A lookup returns its payload either straight from a row (owned bytes)
//! or from an external blob file (memory-mapped, no copy). Both shapes
//! share ownership of the underlying storage, so a view stays usable
//! after the cache call that produced it returns, and cloning is cheap.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use memmap2::Mmap;

/// A read-only byte view over either a memory-mapped external blob or an
/// owned inline buffer.
#[derive(Clone)]
pub struct MemoryView {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    Mapped(Arc<Mmap>),
    Owned(Arc<Vec<u8>>),
}

impl MemoryView {
    pub(crate) fn mapped(mmap: Mmap) -> Self {
        MemoryView {
            repr: Repr::Mapped(Arc::new(mmap)),
        }
    }

    pub(crate) fn owned(bytes: Vec<u8>) -> Self {
        MemoryView {
            repr: Repr::Owned(Arc::new(bytes)),
        }
    }

    /// The viewed bytes.
    pub fn data(&self) -> &[u8] {
        match &self.repr {
            Repr::Mapped(mmap) => mmap,
            Repr::Owned(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// True when the view reads from a memory-mapped file rather than an
    /// owned buffer.
    pub fn is_mapped(&self) -> bool {
        matches!(self.repr, Repr::Mapped(_))
    }

    /// Copies the viewed bytes into an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data().to_vec()
    }
}

impl Deref for MemoryView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl AsRef<[u8]> for MemoryView {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl fmt::Debug for MemoryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryView")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
