use thiserror::Error;

/// Host-level execution trouble. Logical process failure (non-zero exit,
/// timeout) is not an error — it lives in `ExecutionResult`.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] forge_store::StoreError),

    #[error("Empty argv in execution request")]
    EmptyArgv,

    #[error("Failed to spawn {argv0}: {reason}")]
    Spawn { argv0: String, reason: String },
}
