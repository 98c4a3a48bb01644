//! Content-addressed storage for blobs and file trees.
//!
//! Everything in the store is keyed by the SHA-256 digest of its content:
//! byte blobs directly, directory trees via the digest of their canonical
//! manifest (see [`DirectoryTree`]). The store is append-only — a digest,
//! once written, always resolves to the same bytes — which is what lets it
//! be shared across all workers without coordination beyond the inner locks.

pub mod error;
pub mod store;
pub mod tree;

pub use error::StoreError;
pub use store::{Store, StoreProvider};
pub use tree::{DirectoryTree, FileEntry};
