//! The traits a computation must implement to live in the [`Graph`].

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use forge_core::{Digest, Failure};
use petgraph::graph::NodeIndex;

use crate::Graph;

/// Index of a node's entry in the graph arena.
pub type EntryId = NodeIndex<u32>;

/// Errors a node computation can produce.
pub trait NodeError: Clone + Debug + Eq + Send + Sync + 'static {
    /// The sentinel returned to waiters when a node's inputs changed
    /// mid-run. Root requests retry on it; inner requests propagate it.
    fn invalidated() -> Self;

    fn is_invalidated(&self) -> bool {
        *self == Self::invalidated()
    }

    /// Whether this error may be memoized as the node's result for the
    /// generation. Infrastructure errors return false and are retried.
    fn is_cacheable(&self) -> bool;
}

impl NodeError for Failure {
    fn invalidated() -> Self {
        Failure::Invalidated
    }

    fn is_cacheable(&self) -> bool {
        Failure::is_cacheable(self)
    }
}

/// A memoized unit of computation, keyed by value identity.
///
/// The node value is the identity: two requests carrying equal nodes share
/// one entry, one execution per generation, and one result.
#[async_trait]
pub trait Node: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {
    type Item: Clone + Debug + Send + Sync + 'static;
    type Error: NodeError;
    type Context: NodeContext<Node = Self>;

    /// Execute the computation. Child requests go through
    /// `context.graph().get(&context, child)`, which records the dependency
    /// edge and suspends this node until the child completes.
    async fn run(self, context: Self::Context) -> Result<Self::Item, Self::Error>;

    /// Content digest of a result, compared across runs for early cutoff:
    /// an unchanged digest keeps the node's generation, and dependents
    /// clean instead of re-running.
    fn digest(item: &Self::Item) -> Digest;
}

/// The per-request state threaded through node executions.
///
/// Implementations carry whatever the application needs (stores, compiled
/// rules, session handles) plus the identity of the node being run, so that
/// nested requests record the right dependency edges.
pub trait NodeContext: Clone + Send + Sync + 'static {
    type Node: Node<Context = Self>;

    /// A copy of this context attributed to the given entry.
    fn clone_for(&self, entry_id: EntryId) -> Self;

    /// The entry this context is running, or `None` at a request root.
    fn entry_id(&self) -> Option<EntryId>;

    fn graph(&self) -> &Arc<Graph<Self::Node>>;
}

/// Execution counters, exposed for tests and introspection.
#[derive(Debug, Default)]
pub struct Stats {
    /// Node bodies actually executed.
    pub ran: AtomicUsize,
    /// Dirty nodes that proved clean via dependency generations.
    pub cleaning_succeeded: AtomicUsize,
    /// Dirty nodes whose dependencies had moved, forcing a re-run.
    pub cleaning_failed: AtomicUsize,
}

impl Stats {
    pub fn ran(&self) -> usize {
        self.ran.load(Ordering::SeqCst)
    }

    pub fn cleaning_succeeded(&self) -> usize {
        self.cleaning_succeeded.load(Ordering::SeqCst)
    }

    pub fn cleaning_failed(&self) -> usize {
        self.cleaning_failed.load(Ordering::SeqCst)
    }
}
