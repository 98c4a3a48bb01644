//! Sandboxed external process execution with caching and bounded concurrency.
//!
//! The pieces compose as nested [`ProcessRunner`]s, cache on the outside:
//!
//! ```text
//! CachingRunner ── fingerprint hit? ──> stored ExecutionResult
//!       │ miss
//! BoundedRunner ── semaphore permit
//!       │
//! LocalRunner  ── materialize inputs → spawn → capture outputs
//! ```
//!
//! A non-zero exit or a timeout is a *successful* run with an unhappy
//! [`ExecutionResult`] — the requesting rule decides what it means. Only
//! host-level trouble (sandbox I/O, spawn failure) surfaces as
//! [`ProcessError`].

pub mod bounded;
pub mod cache;
pub mod error;
pub mod local;
pub mod request;

use async_trait::async_trait;

pub use bounded::BoundedRunner;
pub use cache::{CacheStats, CachingRunner, ProcessCache};
pub use error::ProcessError;
pub use local::LocalRunner;
pub use request::{ExecutionRequest, ExecutionResult};

/// Runs an [`ExecutionRequest`] to an [`ExecutionResult`].
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, req: ExecutionRequest) -> Result<ExecutionResult, ProcessError>;
}
