use forge_core::Digest;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Blob not found in store: {0}")]
    MissingBlob(Digest),

    #[error("Tree not found in store: {0}")]
    MissingTree(Digest),

    #[error("Stored bytes for {expected} hashed to {actual}")]
    Corrupt { expected: Digest, actual: Digest },

    #[error("Path is not valid inside a tree: {0}")]
    InvalidPath(String),
}
