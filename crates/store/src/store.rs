//! The digest store: append-only, content-addressed, shared everywhere.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use forge_core::Digest;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::tree::{relative_path_string, DirectoryTree, FileEntry};

/// Backing storage for blobs keyed by digest.
///
/// The contract a remote CAS must honor to slot in behind [`Store`]:
/// same digest → same bytes, and both operations are idempotent — storing
/// content that already exists is a no-op, loading never mutates.
pub trait StoreProvider: Send + Sync {
    fn store(&self, digest: Digest, bytes: Bytes) -> Result<(), StoreError>;
    fn load(&self, digest: Digest) -> Result<Option<Bytes>, StoreError>;
    fn contains(&self, digest: Digest) -> Result<bool, StoreError>;
}

/// In-memory provider; the default and the layer in front of any disk dir.
#[derive(Default)]
struct MemoryProvider {
    blobs: RwLock<HashMap<Digest, Bytes>>,
}

impl StoreProvider for MemoryProvider {
    fn store(&self, digest: Digest, bytes: Bytes) -> Result<(), StoreError> {
        self.blobs
            .write()
            .expect("blob map lock poisoned")
            .entry(digest)
            .or_insert(bytes);
        Ok(())
    }

    fn load(&self, digest: Digest) -> Result<Option<Bytes>, StoreError> {
        Ok(self
            .blobs
            .read()
            .expect("blob map lock poisoned")
            .get(&digest)
            .cloned())
    }

    fn contains(&self, digest: Digest) -> Result<bool, StoreError> {
        Ok(self
            .blobs
            .read()
            .expect("blob map lock poisoned")
            .contains_key(&digest))
    }
}

/// On-disk provider: write-once files sharded by the first two hex chars of
/// the fingerprint, so no single directory grows unboundedly.
struct DiskProvider {
    root: PathBuf,
}

impl DiskProvider {
    fn new(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root)?;
        Ok(DiskProvider {
            root: root.to_path_buf(),
        })
    }

    fn blob_path(&self, digest: Digest) -> PathBuf {
        let hex = digest.hash.to_hex();
        self.root.join(&hex[..2]).join(&hex)
    }
}

impl StoreProvider for DiskProvider {
    fn store(&self, digest: Digest, bytes: Bytes) -> Result<(), StoreError> {
        let path = self.blob_path(digest);
        if path.exists() {
            // Append-only: identical content is already present.
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write via a temp name then rename, so readers never observe a
        // partially written blob.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        match fs::rename(&tmp, &path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                fs::remove_file(&tmp).ok();
                Ok(())
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn load(&self, digest: Digest) -> Result<Option<Bytes>, StoreError> {
        match fs::read(self.blob_path(digest)) {
            Ok(bytes) => {
                let actual = Digest::of_bytes(&bytes);
                if actual != digest {
                    return Err(StoreError::Corrupt {
                        expected: digest,
                        actual,
                    });
                }
                Ok(Some(Bytes::from(bytes)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn contains(&self, digest: Digest) -> Result<bool, StoreError> {
        Ok(self.blob_path(digest).exists())
    }
}

/// The digest store used by the scheduler, the sandbox executor and the
/// process cache. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Store {
    memory: Arc<MemoryProvider>,
    disk: Option<Arc<DiskProvider>>,
}

impl Store {
    /// A memory-only store.
    pub fn new_in_memory() -> Self {
        Store {
            memory: Arc::new(MemoryProvider::default()),
            disk: None,
        }
    }

    /// A store backed by an on-disk shard directory, with the in-memory map
    /// acting as a read-through layer.
    pub fn new_on_disk(root: &Path) -> Result<Self, StoreError> {
        Ok(Store {
            memory: Arc::new(MemoryProvider::default()),
            disk: Some(Arc::new(DiskProvider::new(root)?)),
        })
    }

    // ── Blobs ─────────────────────────────────────────────────────────

    /// Store a blob, returning its digest. Idempotent.
    pub fn store_bytes(&self, bytes: &[u8]) -> Result<Digest, StoreError> {
        let digest = Digest::of_bytes(bytes);
        let bytes = Bytes::copy_from_slice(bytes);
        self.memory.store(digest, bytes.clone())?;
        if let Some(disk) = &self.disk {
            disk.store(digest, bytes)?;
        }
        Ok(digest)
    }

    /// Load a blob by digest.
    pub fn load_bytes(&self, digest: Digest) -> Result<Option<Bytes>, StoreError> {
        if let Some(bytes) = self.memory.load(digest)? {
            return Ok(Some(bytes));
        }
        if let Some(disk) = &self.disk {
            if let Some(bytes) = disk.load(digest)? {
                // Warm the memory layer for the next reader.
                self.memory.store(digest, bytes.clone())?;
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    pub fn contains(&self, digest: Digest) -> Result<bool, StoreError> {
        if self.memory.contains(digest)? {
            return Ok(true);
        }
        match &self.disk {
            Some(disk) => disk.contains(digest),
            None => Ok(false),
        }
    }

    /// Store the contents of a file on disk.
    pub fn store_file(&self, path: &Path) -> Result<Digest, StoreError> {
        let bytes = fs::read(path)?;
        self.store_bytes(&bytes)
    }

    // ── Trees ─────────────────────────────────────────────────────────

    /// Store a tree manifest, returning the tree digest.
    pub fn store_tree(&self, tree: &DirectoryTree) -> Result<Digest, StoreError> {
        self.store_bytes(&tree.to_canonical_bytes()?)
    }

    /// Load a tree manifest by digest.
    pub fn load_tree(&self, digest: Digest) -> Result<Option<DirectoryTree>, StoreError> {
        match self.load_bytes(digest)? {
            Some(bytes) => Ok(Some(DirectoryTree::from_canonical_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Digest of the empty tree; the input tree of processes with no inputs.
    pub fn empty_tree_digest(&self) -> Result<Digest, StoreError> {
        self.store_tree(&DirectoryTree::empty())
    }

    /// Capture a directory from the local filesystem into the store.
    ///
    /// Walks `root`, stores each regular file's content, and returns the
    /// digest of the resulting sorted manifest. Symlinks are followed;
    /// anything that is neither file nor directory is skipped.
    pub fn snapshot(&self, root: &Path) -> Result<Digest, StoreError> {
        let mut entries = Vec::new();
        for walk_entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let walk_entry = walk_entry.map_err(|e| {
                StoreError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(ErrorKind::Other, "walkdir loop detected")
                }))
            })?;
            if !walk_entry.file_type().is_file() {
                continue;
            }
            let full = walk_entry.path();
            let digest = self.store_file(full)?;
            entries.push(FileEntry {
                path: relative_path_string(root, full)?,
                digest,
                is_executable: is_executable(walk_entry.metadata().map_err(|e| {
                    StoreError::Io(e.into_io_error().unwrap_or_else(|| {
                        std::io::Error::new(ErrorKind::Other, "metadata unavailable")
                    }))
                })?),
            });
        }
        let tree = DirectoryTree::new(entries)?;
        let digest = self.store_tree(&tree)?;
        debug!(root = %root.display(), files = tree.len(), tree = %digest, "captured snapshot");
        Ok(digest)
    }

    /// Write a stored tree out to `dest`, creating parent directories and
    /// restoring executable bits. `dest` must already exist.
    pub fn materialize(&self, tree_digest: Digest, dest: &Path) -> Result<(), StoreError> {
        let tree = self
            .load_tree(tree_digest)?
            .ok_or(StoreError::MissingTree(tree_digest))?;
        for entry in tree.files() {
            let bytes = self
                .load_bytes(entry.digest)?
                .ok_or(StoreError::MissingBlob(entry.digest))?;
            let path = dest.join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &bytes)?;
            if entry.is_executable {
                set_executable(&path)?;
            }
        }
        debug!(tree = %tree_digest, dest = %dest.display(), "materialized tree");
        Ok(())
    }

    /// Load the full contents of a tree as `(path, bytes)` pairs, sorted by
    /// path.
    pub fn contents(&self, tree_digest: Digest) -> Result<Vec<(String, Bytes)>, StoreError> {
        let tree = self
            .load_tree(tree_digest)?
            .ok_or(StoreError::MissingTree(tree_digest))?;
        let mut out = Vec::with_capacity(tree.len());
        for entry in tree.files() {
            let bytes = self
                .load_bytes(entry.digest)?
                .ok_or(StoreError::MissingBlob(entry.digest))?;
            out.push((entry.path.clone(), bytes));
        }
        Ok(out)
    }
}

#[cfg(unix)]
fn is_executable(metadata: fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_load_bytes() {
        let store = Store::new_in_memory();
        let digest = store.store_bytes(b"hello").unwrap();
        assert_eq!(store.load_bytes(digest).unwrap().unwrap().as_ref(), b"hello");
        assert!(store.contains(digest).unwrap());
        assert!(store
            .load_bytes(Digest::of_bytes(b"absent"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn storing_twice_is_idempotent() {
        let store = Store::new_in_memory();
        let a = store.store_bytes(b"same").unwrap();
        let b = store.store_bytes(b"same").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn disk_store_round_trips_and_survives_memory_loss() {
        let dir = tempfile::tempdir().unwrap();
        let digest = {
            let store = Store::new_on_disk(dir.path()).unwrap();
            store.store_bytes(b"persistent").unwrap()
        };
        // A fresh store over the same directory sees the blob.
        let store = Store::new_on_disk(dir.path()).unwrap();
        assert_eq!(
            store.load_bytes(digest).unwrap().unwrap().as_ref(),
            b"persistent"
        );
    }

    #[test]
    fn snapshot_then_materialize_round_trips() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("sub")).unwrap();
        fs::write(src.path().join("top.txt"), b"top").unwrap();
        fs::write(src.path().join("sub/nested.txt"), b"nested").unwrap();

        let store = Store::new_in_memory();
        let tree = store.snapshot(src.path()).unwrap();

        let dest = tempfile::tempdir().unwrap();
        store.materialize(tree, dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("top.txt")).unwrap(), b"top");
        assert_eq!(
            fs::read(dest.path().join("sub/nested.txt")).unwrap(),
            b"nested"
        );
    }

    #[test]
    fn identical_directories_snapshot_to_identical_digests() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for dir in [&a, &b] {
            fs::write(dir.path().join("f.txt"), b"content").unwrap();
        }
        let store = Store::new_in_memory();
        assert_eq!(
            store.snapshot(a.path()).unwrap(),
            store.snapshot(b.path()).unwrap()
        );
    }

    #[test]
    fn contents_lists_sorted_paths() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("b.txt"), b"2").unwrap();
        fs::write(src.path().join("a.txt"), b"1").unwrap();

        let store = Store::new_in_memory();
        let tree = store.snapshot(src.path()).unwrap();
        let contents = store.contents(tree).unwrap();
        let paths: Vec<&str> = contents.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn empty_tree_is_stable() {
        let store = Store::new_in_memory();
        let a = store.empty_tree_digest().unwrap();
        let b = store.empty_tree_digest().unwrap();
        assert_eq!(a, b);
        assert!(store.load_tree(a).unwrap().unwrap().is_empty());
    }
}
