//! Policy-free chunk store backends.
//!
//! A backend is a durable map from [`ChunkName`] to opaque bytes with size
//! and capacity accounting. It enforces only structural rules: `store` never
//! overwrites an existing chunk and `modify` only touches existing ones.
//! Content validation belongs to the authority, never here.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::Bytes;
use data_encoding::BASE32_NOPAD;
use tracing::warn;

use crate::chunk::ChunkName;

/// A durable map from chunk name to opaque bytes.
///
/// `capacity` of zero means unbounded. All methods are infallible at the
/// interface; backends report failure by returning `false`/`None` and log
/// the cause themselves.
pub trait ChunkStore: Send + Sync {
    fn get(&self, name: &ChunkName) -> Option<Bytes>;
    fn has(&self, name: &ChunkName) -> bool;
    /// Writes a new chunk. Fails if the name exists or capacity would be
    /// exceeded.
    fn store(&self, name: &ChunkName, content: Bytes) -> bool;
    /// Removes a chunk; absent names count as removed.
    fn delete(&self, name: &ChunkName) -> bool;
    /// Replaces the bytes of an existing chunk. Fails on absent names.
    fn modify(&self, name: &ChunkName, content: Bytes) -> bool;
    /// Total bytes currently stored.
    fn size(&self) -> u64;
    /// Configured ceiling in bytes; zero means unbounded.
    fn capacity(&self) -> u64;
}

fn fits(size: u64, capacity: u64, old: u64, new: u64) -> bool {
    capacity == 0 || size - old + new <= capacity
}

/// Memory-resident backend, used by tests and the simulation manager.
#[derive(Debug)]
pub struct MemoryChunkStore {
    inner: RwLock<MemoryInner>,
    capacity: u64,
}

#[derive(Debug, Default)]
struct MemoryInner {
    chunks: HashMap<ChunkName, Bytes>,
    size: u64,
}

impl MemoryChunkStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
            capacity,
        }
    }
}

impl Default for MemoryChunkStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ChunkStore for MemoryChunkStore {
    fn get(&self, name: &ChunkName) -> Option<Bytes> {
        self.inner.read().unwrap().chunks.get(name).cloned()
    }

    fn has(&self, name: &ChunkName) -> bool {
        self.inner.read().unwrap().chunks.contains_key(name)
    }

    fn store(&self, name: &ChunkName, content: Bytes) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.chunks.contains_key(name) {
            return false;
        }
        if !fits(inner.size, self.capacity, 0, content.len() as u64) {
            warn!(%name, "store refused: over capacity");
            return false;
        }
        inner.size += content.len() as u64;
        inner.chunks.insert(name.clone(), content);
        true
    }

    fn delete(&self, name: &ChunkName) -> bool {
        let mut inner = self.inner.write().unwrap();
        if let Some(removed) = inner.chunks.remove(name) {
            inner.size -= removed.len() as u64;
        }
        true
    }

    fn modify(&self, name: &ChunkName, content: Bytes) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(existing) = inner.chunks.get(name) else {
            return false;
        };
        let old = existing.len() as u64;
        if !fits(inner.size, self.capacity, old, content.len() as u64) {
            warn!(%name, "modify refused: over capacity");
            return false;
        }
        inner.size = inner.size - old + content.len() as u64;
        inner.chunks.insert(name.clone(), content);
        true
    }

    fn size(&self) -> u64 {
        self.inner.read().unwrap().size
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// File-backed backend: one file per chunk under a root directory, named by
/// the base-32 encoding of the chunk name.
#[derive(Debug)]
pub struct FileChunkStore {
    root: PathBuf,
    size: RwLock<u64>,
    capacity: u64,
}

impl FileChunkStore {
    /// Opens (creating if needed) a store rooted at `root`, scanning existing
    /// chunk files to rebuild the size accounting.
    pub fn open(root: impl Into<PathBuf>, capacity: u64) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let mut size = 0u64;
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                size += entry.metadata()?.len();
            }
        }
        Ok(Self {
            root,
            size: RwLock::new(size),
            capacity,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_path(&self, name: &ChunkName) -> PathBuf {
        self.root.join(BASE32_NOPAD.encode(name.as_bytes()))
    }
}

impl ChunkStore for FileChunkStore {
    fn get(&self, name: &ChunkName) -> Option<Bytes> {
        // Hold the lock across the read so a concurrent modify can't be
        // observed half-written via its rename.
        let _size = self.size.read().unwrap();
        std::fs::read(self.chunk_path(name)).ok().map(Bytes::from)
    }

    fn has(&self, name: &ChunkName) -> bool {
        let _size = self.size.read().unwrap();
        self.chunk_path(name).exists()
    }

    fn store(&self, name: &ChunkName, content: Bytes) -> bool {
        let mut size = self.size.write().unwrap();
        let path = self.chunk_path(name);
        if path.exists() {
            return false;
        }
        if !fits(*size, self.capacity, 0, content.len() as u64) {
            warn!(%name, "store refused: over capacity");
            return false;
        }
        match std::fs::write(&path, &content) {
            Ok(()) => {
                *size += content.len() as u64;
                true
            }
            Err(err) => {
                warn!(%name, "failed to write chunk: {err}");
                false
            }
        }
    }

    fn delete(&self, name: &ChunkName) -> bool {
        let mut size = self.size.write().unwrap();
        let path = self.chunk_path(name);
        let old = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => return true,
        };
        match std::fs::remove_file(&path) {
            Ok(()) => {
                *size -= old;
                true
            }
            Err(err) => {
                warn!(%name, "failed to delete chunk: {err}");
                false
            }
        }
    }

    fn modify(&self, name: &ChunkName, content: Bytes) -> bool {
        let mut size = self.size.write().unwrap();
        let path = self.chunk_path(name);
        let old = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => return false,
        };
        if !fits(*size, self.capacity, old, content.len() as u64) {
            warn!(%name, "modify refused: over capacity");
            return false;
        }
        let tmp = path.with_extension("tmp");
        let written = std::fs::write(&tmp, &content)
            .and_then(|()| std::fs::rename(&tmp, &path));
        match written {
            Ok(()) => {
                *size = *size - old + content.len() as u64;
                true
            }
            Err(err) => {
                warn!(%name, "failed to modify chunk: {err}");
                false
            }
        }
    }

    fn size(&self) -> u64 {
        *self.size.read().unwrap()
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkType;

    fn name(content: &[u8]) -> ChunkName {
        ChunkName::for_content(content, ChunkType::Default)
    }

    fn exercise(store: &dyn ChunkStore) {
        let a = name(b"aaa");
        assert!(!store.has(&a));
        assert!(store.get(&a).is_none());

        assert!(store.store(&a, Bytes::from_static(b"aaa")));
        assert!(store.has(&a));
        assert_eq!(store.get(&a).unwrap(), Bytes::from_static(b"aaa"));
        assert_eq!(store.size(), 3);

        // No silent overwrite.
        assert!(!store.store(&a, Bytes::from_static(b"other")));
        assert_eq!(store.get(&a).unwrap(), Bytes::from_static(b"aaa"));

        assert!(store.modify(&a, Bytes::from_static(b"aaaaaa")));
        assert_eq!(store.size(), 6);

        // Modify on an absent name fails; delete on one succeeds.
        let b = name(b"bbb");
        assert!(!store.modify(&b, Bytes::from_static(b"x")));
        assert!(store.delete(&b));

        assert!(store.delete(&a));
        assert!(!store.has(&a));
        assert_eq!(store.size(), 0);
        assert!(store.delete(&a));
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryChunkStore::default());
    }

    #[test]
    fn file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileChunkStore::open(dir.path(), 0).unwrap());
    }

    #[test]
    fn capacity_is_enforced() {
        let store = MemoryChunkStore::new(4);
        assert!(!store.store(&name(b"big"), Bytes::from_static(b"12345")));
        assert!(store.store(&name(b"ok"), Bytes::from_static(b"1234")));
        assert!(!store.modify(&name(b"ok"), Bytes::from_static(b"12345")));
        assert!(store.modify(&name(b"ok"), Bytes::from_static(b"12")));
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn file_store_recovers_size_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileChunkStore::open(dir.path(), 0).unwrap();
            assert!(store.store(&name(b"aaa"), Bytes::from_static(b"aaa")));
            assert!(store.store(&name(b"bbbb"), Bytes::from_static(b"bbbb")));
        }
        let reopened = FileChunkStore::open(dir.path(), 0).unwrap();
        assert_eq!(reopened.size(), 7);
        assert!(reopened.has(&name(b"aaa")));
    }
}
