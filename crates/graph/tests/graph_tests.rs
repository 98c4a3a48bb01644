//! Behavioral tests for the memoizing node graph, driven by a small chain of
//! mock nodes: `TNode(n)` depends on `TNode(n - 1)`, and `TNode(0)` reads a
//! mutable "leaf value" standing in for external state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use forge_core::Digest;
use forge_graph::{EntryId, Graph, Node, NodeContext, NodeError};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TNode(usize);

impl fmt::Display for TNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TNode({})", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum TError {
    Invalidated,
    Fatal(String),
    Logical(String),
}

impl NodeError for TError {
    fn invalidated() -> Self {
        TError::Invalidated
    }

    fn is_cacheable(&self) -> bool {
        matches!(self, TError::Logical(_))
    }
}

/// Shared mutable test fixture: the leaf value, per-node behavior knobs and
/// the record of executed nodes.
#[derive(Default)]
struct TState {
    leaf_value: Mutex<String>,
    delays: Mutex<HashMap<usize, Duration>>,
    failures: Mutex<HashMap<usize, TError>>,
    /// Nodes whose output ignores their child (for early-cutoff tests).
    masked: Mutex<HashSet<usize>>,
    runs: Mutex<Vec<usize>>,
}

impl TState {
    fn run_count(&self, n: usize) -> usize {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .filter(|&&r| r == n)
            .count()
    }

    fn total_runs(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[derive(Clone)]
struct TContext {
    graph: Arc<Graph<TNode>>,
    entry_id: Option<EntryId>,
    state: Arc<TState>,
}

impl TContext {
    fn new(graph: Arc<Graph<TNode>>, state: Arc<TState>) -> Self {
        TContext {
            graph,
            entry_id: None,
            state,
        }
    }
}

impl NodeContext for TContext {
    type Node = TNode;

    fn clone_for(&self, entry_id: EntryId) -> Self {
        TContext {
            graph: self.graph.clone(),
            entry_id: Some(entry_id),
            state: self.state.clone(),
        }
    }

    fn entry_id(&self) -> Option<EntryId> {
        self.entry_id
    }

    fn graph(&self) -> &Arc<Graph<TNode>> {
        &self.graph
    }
}

#[async_trait]
impl Node for TNode {
    type Item = String;
    type Error = TError;
    type Context = TContext;

    async fn run(self, context: TContext) -> Result<String, TError> {
        context.state.runs.lock().unwrap().push(self.0);

        let delay = context.state.delays.lock().unwrap().get(&self.0).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = context.state.failures.lock().unwrap().get(&self.0).cloned();
        if let Some(failure) = failure {
            return Err(failure);
        }

        if self.0 == 0 {
            return Ok(context.state.leaf_value.lock().unwrap().clone());
        }

        let child = context
            .graph
            .get(&context, TNode(self.0 - 1))
            .await?;
        if context.state.masked.lock().unwrap().contains(&self.0) {
            Ok(format!("masked-{}", self.0))
        } else {
            Ok(format!("{}.{}", child, self.0))
        }
    }

    fn digest(item: &String) -> Digest {
        Digest::of_bytes(item.as_bytes())
    }
}

fn fixture() -> (Arc<Graph<TNode>>, TContext, Arc<TState>) {
    let graph = Arc::new(Graph::new(Duration::from_millis(10)));
    let state = Arc::new(TState::default());
    *state.leaf_value.lock().unwrap() = "leaf".to_string();
    let context = TContext::new(graph.clone(), state.clone());
    (graph, context, state)
}

#[tokio::test]
async fn request_is_memoized() {
    let (graph, context, state) = fixture();

    let first = graph.get(&context, TNode(2)).await.unwrap();
    assert_eq!(first, "leaf.1.2");
    assert_eq!(state.total_runs(), 3);

    // A second identical request re-runs nothing, including the leaf read.
    let second = graph.get(&context, TNode(2)).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(state.total_runs(), 3);
}

#[tokio::test]
async fn concurrent_requests_share_one_execution() {
    let (graph, context, state) = fixture();
    state
        .delays
        .lock()
        .unwrap()
        .insert(0, Duration::from_millis(50));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let graph = graph.clone();
        let context = context.clone();
        handles.push(tokio::spawn(
            async move { graph.get(&context, TNode(2)).await },
        ));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }
    assert!(results.iter().all(|r| r == "leaf.1.2"));
    // One execution per node, regardless of the number of callers.
    assert_eq!(state.run_count(0), 1);
    assert_eq!(state.run_count(1), 1);
    assert_eq!(state.run_count(2), 1);
}

#[tokio::test]
async fn shared_leaf_runs_once_for_many_dependents() {
    let (graph, context, state) = fixture();
    // Two independent chains both bottom out in TNode(0).
    graph.get(&context, TNode(1)).await.unwrap();
    graph.get(&context, TNode(2)).await.unwrap();
    assert_eq!(state.run_count(0), 1);
}

#[tokio::test]
async fn invalidation_recomputes_lazily() {
    let (graph, context, state) = fixture();
    graph.get(&context, TNode(2)).await.unwrap();
    assert_eq!(state.total_runs(), 3);

    *state.leaf_value.lock().unwrap() = "changed".to_string();
    let result = graph.invalidate_from_roots(|n| n.0 == 0);
    assert_eq!(result.cleared, 1);
    assert_eq!(result.dirtied, 2);

    // Nothing recomputes until requested.
    assert_eq!(state.total_runs(), 3);

    let fresh = graph.get(&context, TNode(2)).await.unwrap();
    assert_eq!(fresh, "changed.1.2");
    assert_eq!(state.run_count(0), 2);
    assert_eq!(state.run_count(2), 2);
}

#[tokio::test]
async fn early_cutoff_stops_at_unchanged_output() {
    let (graph, context, state) = fixture();
    // TNode(1)'s output ignores the leaf, so a leaf change re-runs TNode(1)
    // to the same digest and TNode(2) must clean without running.
    state.masked.lock().unwrap().insert(1);

    let first = graph.get(&context, TNode(2)).await.unwrap();
    assert_eq!(first, "masked-1.2");
    assert_eq!(state.run_count(2), 1);

    *state.leaf_value.lock().unwrap() = "different".to_string();
    graph.invalidate_from_roots(|n| n.0 == 0);

    let second = graph.get(&context, TNode(2)).await.unwrap();
    assert_eq!(second, first);
    // The leaf and the masked node re-ran; the dependent did not.
    assert_eq!(state.run_count(0), 2);
    assert_eq!(state.run_count(1), 2);
    assert_eq!(state.run_count(2), 1);
    assert!(graph.stats().cleaning_succeeded() >= 1);
}

#[tokio::test]
async fn unchanged_invalidated_leaf_cleans_the_whole_chain() {
    let (graph, context, state) = fixture();
    graph.get(&context, TNode(2)).await.unwrap();

    // Invalidate without changing the value: the leaf re-runs to the same
    // digest and everything above it cleans.
    graph.invalidate_from_roots(|n| n.0 == 0);
    graph.get(&context, TNode(2)).await.unwrap();

    assert_eq!(state.run_count(0), 2);
    assert_eq!(state.run_count(1), 1);
    assert_eq!(state.run_count(2), 1);
}

#[tokio::test]
async fn logical_failures_are_memoized_for_the_generation() {
    let (graph, context, state) = fixture();
    state
        .failures
        .lock()
        .unwrap()
        .insert(0, TError::Logical("no such file".to_string()));

    let first = graph.get(&context, TNode(1)).await;
    assert_eq!(first, Err(TError::Logical("no such file".to_string())));
    let second = graph.get(&context, TNode(1)).await;
    assert_eq!(second, first);
    // The failing leaf ran once; the failure was served from cache after.
    assert_eq!(state.run_count(0), 1);
}

#[tokio::test]
async fn failures_recompute_after_invalidation() {
    let (graph, context, state) = fixture();
    state
        .failures
        .lock()
        .unwrap()
        .insert(0, TError::Logical("transient".to_string()));
    assert!(graph.get(&context, TNode(1)).await.is_err());

    state.failures.lock().unwrap().remove(&0);
    graph.invalidate_from_roots(|n| n.0 == 0);

    let recovered = graph.get(&context, TNode(1)).await.unwrap();
    assert_eq!(recovered, "leaf.1");
}

#[tokio::test]
async fn infrastructure_failures_are_not_memoized() {
    let (graph, context, state) = fixture();
    state
        .failures
        .lock()
        .unwrap()
        .insert(0, TError::Fatal("disk on fire".to_string()));

    assert!(graph.get(&context, TNode(0)).await.is_err());
    assert!(graph.get(&context, TNode(0)).await.is_err());
    // Both requests actually ran the node.
    assert_eq!(state.run_count(0), 2);
}

#[tokio::test]
async fn canceling_one_requester_leaves_shared_work_running() {
    let (graph, context, state) = fixture();
    state
        .delays
        .lock()
        .unwrap()
        .insert(0, Duration::from_millis(200));

    let g1 = graph.clone();
    let c1 = context.clone();
    let r1 = tokio::spawn(async move { g1.get(&c1, TNode(1)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let g2 = graph.clone();
    let c2 = context.clone();
    let r2 = tokio::spawn(async move { g2.get(&c2, TNode(1)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Cancel the first requester; the second still awaits the shared node.
    r1.abort();
    let result = r2.await.unwrap().unwrap();
    assert_eq!(result, "leaf.1");
    assert_eq!(state.run_count(0), 1);
}

#[tokio::test]
async fn canceling_every_requester_resets_the_node() {
    let (graph, context, state) = fixture();
    state
        .delays
        .lock()
        .unwrap()
        .insert(0, Duration::from_millis(200));

    let g1 = graph.clone();
    let c1 = context.clone();
    let r1 = tokio::spawn(async move { g1.get(&c1, TNode(0)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    r1.abort();
    // Give the teardown a moment to observe the dropped receiver.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A fresh request starts a fresh run rather than waiting on a zombie.
    let value = graph.get(&context, TNode(0)).await.unwrap();
    assert_eq!(value, "leaf");
    assert_eq!(state.run_count(0), 2);
}

#[tokio::test]
async fn invalidation_during_a_run_retries_the_root() {
    let (graph, context, state) = fixture();
    state
        .delays
        .lock()
        .unwrap()
        .insert(0, Duration::from_millis(100));

    let g1 = graph.clone();
    let c1 = context.clone();
    let request = tokio::spawn(async move { g1.get(&c1, TNode(1)).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Change the world mid-run.
    *state.leaf_value.lock().unwrap() = "fresh".to_string();
    state.delays.lock().unwrap().remove(&0);
    graph.invalidate_from_roots(|n| n.0 == 0);

    // The root request retries internally and completes with fresh data.
    let result = request.await.unwrap().unwrap();
    assert_eq!(result, "fresh.1");
}

#[tokio::test]
async fn clear_all_forgets_everything() {
    let (graph, context, state) = fixture();
    graph.get(&context, TNode(1)).await.unwrap();
    assert_eq!(state.total_runs(), 2);

    graph.clear_all();
    graph.get(&context, TNode(1)).await.unwrap();
    assert_eq!(state.total_runs(), 4);
}

#[tokio::test]
async fn visualize_emits_dot() {
    let (graph, context, _state) = fixture();
    graph.get(&context, TNode(1)).await.unwrap();

    let mut out = Vec::new();
    graph.visualize(&mut out).unwrap();
    let dot = String::from_utf8(out).unwrap();
    assert!(dot.starts_with("digraph nodes {"));
    assert!(dot.contains("TNode(0) [completed]"));
    assert!(dot.contains("TNode(1) [completed]"));
}
