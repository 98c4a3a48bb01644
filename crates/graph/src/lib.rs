//! The memoizing node execution graph.
//!
//! A [`Graph`] lazily interns [`Node`]s into an arena, executes each at most
//! once per generation, deduplicates concurrent requests onto a single
//! in-flight execution, records dependency edges as rule bodies issue child
//! requests, and propagates invalidation lazily with early cutoff. Entry
//! state is synchronized per node; the arena lock is held only for interning,
//! edge bookkeeping and invalidation walks, never across executions.

pub mod entry;
pub mod node;

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future;
use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use tracing::{debug, info};

use entry::{Entry, Generation, NodeResult, PreviousCompletion, RunToken};
pub use node::{EntryId, Node, NodeContext, NodeError, Stats};

/// Counts reported by [`Graph::invalidate_from_roots`].
#[derive(Debug, Eq, PartialEq)]
pub struct InvalidationResult {
    /// Matching roots whose values were dropped.
    pub cleared: usize,
    /// Transitive dependents flagged for re-check.
    pub dirtied: usize,
}

struct InnerGraph<N: Node> {
    nodes: HashMap<N, EntryId>,
    pg: DiGraph<Entry<N>, (), u32>,
}

impl<N: Node> InnerGraph<N> {
    fn ensure_entry(&mut self, node: N) -> EntryId {
        if let Some(&id) = self.nodes.get(&node) {
            return id;
        }
        let id = self.pg.add_node(Entry::new(node.clone()));
        self.nodes.insert(node, id);
        id
    }

    fn entry(&self, id: EntryId) -> Entry<N> {
        self.pg[id].clone()
    }

    /// Walk from the roots in the given direction, breadth-first, without
    /// revisiting.
    fn walk(&self, roots: Vec<EntryId>, direction: Direction) -> Vec<EntryId> {
        let mut visited: HashSet<EntryId> = roots.iter().copied().collect();
        let mut deque: VecDeque<EntryId> = roots.into();
        let mut out = Vec::new();
        while let Some(id) = deque.pop_front() {
            out.push(id);
            for neighbor in self.pg.neighbors_directed(id, direction) {
                if visited.insert(neighbor) {
                    deque.push_back(neighbor);
                }
            }
        }
        out
    }
}

/// The shared node graph. Wrap in an `Arc` and hand clones to contexts.
pub struct Graph<N: Node> {
    inner: Mutex<InnerGraph<N>>,
    stats: Arc<Stats>,
    invalidation_delay: Duration,
}

impl<N: Node> Graph<N> {
    pub fn new(invalidation_delay: Duration) -> Graph<N> {
        Graph {
            inner: Mutex::new(InnerGraph {
                nodes: HashMap::new(),
                pg: DiGraph::new(),
            }),
            stats: Arc::new(Stats::default()),
            invalidation_delay,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("graph lock poisoned").nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Request a node, in the context of whatever node is currently running.
    ///
    /// A root request (no surrounding node) retries when the computation is
    /// invalidated mid-flight; an inner request propagates the interrupt so
    /// its own root can retry the whole path.
    pub async fn get(&self, context: &N::Context, node: N) -> Result<N::Item, N::Error> {
        let src_id = context.entry_id();
        loop {
            let (entry, dst_id) = {
                let mut inner = self.inner.lock().expect("graph lock poisoned");
                let dst_id = inner.ensure_entry(node.clone());
                if let Some(src_id) = src_id {
                    // Record the dependency edge for invalidation walks and
                    // generation checks. update_edge dedups.
                    inner.pg.update_edge(src_id, dst_id, ());
                }
                (inner.entry(dst_id), dst_id)
            };

            let (result, _generation) = entry.get_node_result(context, dst_id).await;
            match result {
                Err(err) if err.is_invalidated() && src_id.is_none() => {
                    info!(node = %node, "inputs changed during run: retrying");
                    tokio::time::sleep(self.invalidation_delay).await;
                    continue;
                }
                other => return other,
            }
        }
    }

    /// Re-request a dependency by entry id, for cleaning checks.
    async fn get_by_id(&self, context: &N::Context, id: EntryId) -> NodeResult<N> {
        let entry = {
            let inner = self.inner.lock().expect("graph lock poisoned");
            inner.entry(id)
        };
        entry.get_node_result(context, id).await
    }

    /// Compare the recorded dependency generations against their current
    /// values, re-requesting (and possibly recursively cleaning) each
    /// dependency. Checks run concurrently and fail fast on the first
    /// mismatch.
    pub(crate) async fn dependencies_unchanged(
        &self,
        context: &N::Context,
        dep_generations: &[(EntryId, Generation)],
    ) -> bool {
        let checks = dep_generations
            .iter()
            .map(|&(dep_id, expected)| {
                let context = context.clone();
                async move {
                    let (_, generation) = self.get_by_id(&context, dep_id).await;
                    if generation == expected {
                        Ok(())
                    } else {
                        Err(())
                    }
                }
            })
            .collect::<Vec<_>>();

        future::try_join_all(checks).await.is_ok()
    }

    /// Store a finished run's result, recording the generations of every
    /// dependency it consumed.
    pub(crate) fn complete(
        &self,
        entry_id: EntryId,
        run_token: RunToken,
        result: Result<N::Item, N::Error>,
    ) {
        let (entry, deps) = {
            let inner = self.inner.lock().expect("graph lock poisoned");
            let deps: Vec<(EntryId, Entry<N>)> = inner
                .pg
                .neighbors_directed(entry_id, Direction::Outgoing)
                .map(|dep_id| (dep_id, inner.entry(dep_id)))
                .collect();
            (inner.entry(entry_id), deps)
        };
        let dep_generations = deps
            .into_iter()
            .map(|(dep_id, dep)| (dep_id, dep.generation()))
            .collect();
        entry.complete(run_token, result, dep_generations);
    }

    pub(crate) fn complete_cleaned(
        &self,
        entry_id: EntryId,
        run_token: RunToken,
        previous: PreviousCompletion<N>,
    ) {
        let entry = {
            let inner = self.inner.lock().expect("graph lock poisoned");
            inner.entry(entry_id)
        };
        entry.complete_cleaned(run_token, previous);
    }

    pub(crate) fn cancel(&self, entry_id: EntryId, run_token: RunToken) {
        let entry = {
            let inner = self.inner.lock().expect("graph lock poisoned");
            inner.entry(entry_id)
        };
        entry.cancel(run_token);
    }

    /// A cleaning attempt failed: drop the stale dependency edges so the
    /// re-run records fresh ones.
    pub(crate) fn cleaning_failed(&self, entry_id: EntryId, run_token: RunToken) {
        let mut inner = self.inner.lock().expect("graph lock poisoned");
        if !inner.pg[entry_id].run_token_matches(run_token) {
            return;
        }
        let mut edges: Vec<_> = inner
            .pg
            .edges_directed(entry_id, Direction::Outgoing)
            .map(|e| e.id())
            .collect();
        // remove_edge swaps ids down from the end; delete in reverse order.
        edges.sort_by_key(|id| std::cmp::Reverse(id.index()));
        for edge in edges {
            inner.pg.remove_edge(edge);
        }
    }

    /// Clear every node matching the predicate and flag its transitive
    /// dependents for re-check. Nothing is recomputed eagerly; dependents
    /// re-validate (and stop at unchanged generations) when next requested.
    pub fn invalidate_from_roots<P: Fn(&N) -> bool>(&self, predicate: P) -> InvalidationResult {
        let mut inner = self.inner.lock().expect("graph lock poisoned");

        // NotStarted entries need no clearing: their dependents either never
        // observed a value or were already dirtied.
        let root_ids: Vec<EntryId> = inner
            .nodes
            .iter()
            .filter(|&(node, &id)| predicate(node) && inner.pg[id].is_started())
            .map(|(_, &id)| id)
            .collect();

        if root_ids.is_empty() {
            return InvalidationResult {
                cleared: 0,
                dirtied: 0,
            };
        }

        let root_set: HashSet<EntryId> = root_ids.iter().copied().collect();
        let transitive: Vec<EntryId> = inner
            .walk(root_ids.clone(), Direction::Incoming)
            .into_iter()
            .filter(|id| !root_set.contains(id))
            .collect();

        for &id in &root_ids {
            inner.pg[id].clear();
        }
        // The roots' own dependency edges are stale observations of the
        // outside world; drop them. Dependent edges stay for the walk-based
        // cleaning checks.
        inner
            .pg
            .retain_edges(|pg, edge| match pg.edge_endpoints(edge) {
                Some((src, _)) => !root_set.contains(&src),
                None => true,
            });

        for &id in &transitive {
            debug!(node = %inner.pg[id].node(), "dirtied");
            inner.pg[id].dirty();
        }

        let result = InvalidationResult {
            cleared: root_ids.len(),
            dirtied: transitive.len(),
        };
        info!(cleared = result.cleared, dirtied = result.dirtied, "invalidated");
        result
    }

    /// Drop the state of every node: a full graph reset.
    pub fn clear_all(&self) {
        let inner = self.inner.lock().expect("graph lock poisoned");
        for &id in inner.nodes.values() {
            inner.pg[id].clear();
        }
    }

    /// Dump the current node graph in graphviz dot format.
    pub fn visualize(&self, f: &mut dyn io::Write) -> io::Result<()> {
        let inner = self.inner.lock().expect("graph lock poisoned");
        writeln!(f, "digraph nodes {{")?;
        let mut lines = Vec::new();
        for id in inner.pg.node_indices() {
            let entry = &inner.pg[id];
            let label = format!("{} [{}]", entry.node(), entry.state_label());
            let mut deps: Vec<String> = inner
                .pg
                .neighbors_directed(id, Direction::Outgoing)
                .map(|dep| {
                    let dep = &inner.pg[dep];
                    format!("\"{} [{}]\"", dep.node(), dep.state_label())
                })
                .collect();
            if deps.is_empty() {
                lines.push(format!("  \"{label}\""));
            } else {
                deps.sort();
                lines.push(format!("  \"{label}\" -> {{{}}}", deps.join(" ")));
            }
        }
        lines.sort();
        for line in lines {
            writeln!(f, "{line}")?;
        }
        writeln!(f, "}}")
    }
}
