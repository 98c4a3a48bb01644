//! The engine: compiled rules wired onto the memoizing node graph.
//!
//! A [`Scheduler`] compiles the registered rule set (atomically — a compile
//! failure installs nothing), owns the digest store and the sandboxed
//! process stack, and hands out [`Session`]s. A session resolves a
//! `(Product, Params)` request to a compiled entry, expands it into memoized
//! nodes, and returns the computed value; rule bodies observe the engine
//! through a [`TaskContext`].

pub mod context;
pub mod error;
pub mod nodes;
pub mod scheduler;
pub mod watcher;

pub use context::{Context, TaskContext};
pub use error::EngineError;
pub use nodes::{NodeKey, NodeOutput, ProcessNode, TaskNode};
pub use scheduler::{body, RuleBody, Scheduler, Session};
pub use watcher::InvalidationWatcher;

// The engine's public vocabulary comes from the leaf crates.
pub use forge_core::{Config, Digest, Failure, Fingerprint, Key, Params, TypeId, Value};
pub use forge_process::{ExecutionRequest, ExecutionResult};
pub use forge_rulegraph::{CompileError, DependencyKey, Query, Rule, RuleSet};
