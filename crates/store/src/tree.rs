//! The canonical file-tree manifest.
//!
//! A [`DirectoryTree`] lists files with their relative paths, blob digests
//! and executable bits, sorted by path. Its identity is the digest of the
//! canonical JSON encoding, so two captures of identical content always
//! produce identical tree digests regardless of walk order or platform.

use std::path::{Component, Path, PathBuf};

use forge_core::Digest;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// One file within a tree. Paths are relative, `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub digest: Digest,
    pub is_executable: bool,
}

/// A sorted manifest of files; the unit the store addresses trees by.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirectoryTree {
    files: Vec<FileEntry>,
}

impl DirectoryTree {
    /// Build a tree from entries, sorting by path and rejecting duplicates
    /// and non-relative paths.
    pub fn new(mut files: Vec<FileEntry>) -> Result<Self, StoreError> {
        for entry in &files {
            validate_relative(&entry.path)?;
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        for pair in files.windows(2) {
            if pair[0].path == pair[1].path {
                return Err(StoreError::InvalidPath(format!(
                    "duplicate path in tree: {}",
                    pair[0].path
                )));
            }
        }
        Ok(DirectoryTree { files })
    }

    /// The empty tree.
    pub fn empty() -> Self {
        DirectoryTree::default()
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Canonical encoding; input to the tree digest.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialize(e.to_string()))
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialize(e.to_string()))
    }

    /// Digest identifying this tree.
    pub fn digest(&self) -> Result<Digest, StoreError> {
        Ok(Digest::of_bytes(&self.to_canonical_bytes()?))
    }

    /// Merge trees; identical paths must carry identical digests.
    pub fn merge(trees: impl IntoIterator<Item = DirectoryTree>) -> Result<Self, StoreError> {
        let mut files: Vec<FileEntry> = Vec::new();
        for tree in trees {
            files.extend(tree.files);
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup();
        // Anything still adjacent with an equal path is a genuine conflict.
        for pair in files.windows(2) {
            if pair[0].path == pair[1].path {
                return Err(StoreError::InvalidPath(format!(
                    "conflicting contents for path: {}",
                    pair[0].path
                )));
            }
        }
        Ok(DirectoryTree { files })
    }
}

/// Reject absolute paths and `..` traversal; trees only describe content
/// beneath their own root.
fn validate_relative(path: &str) -> Result<(), StoreError> {
    if path.is_empty() {
        return Err(StoreError::InvalidPath("empty path".to_string()));
    }
    let p = Path::new(path);
    for component in p.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(StoreError::InvalidPath(path.to_string())),
        }
    }
    Ok(())
}

/// Convert a walked filesystem path into a tree-relative `/`-separated path.
pub(crate) fn relative_path_string(root: &Path, full: &Path) -> Result<String, StoreError> {
    let rel: PathBuf = full
        .strip_prefix(root)
        .map_err(|_| StoreError::InvalidPath(full.display().to_string()))?
        .to_path_buf();
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| StoreError::InvalidPath(full.display().to_string()))?
                    .to_string(),
            ),
            _ => return Err(StoreError::InvalidPath(full.display().to_string())),
        }
    }
    Ok(parts.join("/"))
}
