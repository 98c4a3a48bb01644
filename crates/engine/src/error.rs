use forge_core::Failure;
use forge_rulegraph::CompileError;
use forge_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Rule graph compilation failed; nothing was installed.
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A request failed: logically (cached for the generation), fatally
    /// (infrastructure, retryable), or via mid-run invalidation.
    #[error("{0}")]
    Failed(#[from] Failure),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watch error: {0}")]
    Watch(String),
}
