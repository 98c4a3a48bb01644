//! Per-node state: the heart of memoization, deduplication and invalidation.
//!
//! Every entry moves through `NotStarted → Running → Completed` once per
//! generation. Concurrent requests for a Running entry subscribe to the same
//! in-flight execution; invalidation moves a Completed entry back toward
//! NotStarted (or flags it dirty for a cheap re-check) instead of mutating
//! the stored result.

use std::sync::{Arc, Mutex};

use forge_core::Digest;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::node::{EntryId, Node, NodeContext, NodeError};

/// Identifies one run of a node. Completions and cancellations carrying a
/// stale token are legal races and are discarded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RunToken(u32);

impl RunToken {
    fn initial() -> RunToken {
        RunToken(0)
    }

    fn next(self) -> RunToken {
        RunToken(self.0 + 1)
    }
}

/// Incremented only when a node's output digest changes. Dependents record
/// the generations they consumed; unchanged generations let them skip
/// re-running entirely (early cutoff).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Generation(u32);

impl Generation {
    fn initial() -> Generation {
        Generation(0)
    }

    fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

/// What a waiter receives: the result plus the generation it was produced in.
pub(crate) type NodeResult<N> =
    (Result<<N as Node>::Item, <N as Node>::Error>, Generation);

/// The Completed payload carried into a cleaning attempt, restored verbatim
/// if every recorded dependency generation still matches.
pub(crate) struct PreviousCompletion<N: Node> {
    pub result: Result<N::Item, N::Error>,
    pub digest: Option<Digest>,
    pub dep_generations: Vec<(EntryId, Generation)>,
}

enum EntryState<N: Node> {
    /// Cleared or never requested. `previous_digest` survives clears so a
    /// re-run producing identical output keeps its generation.
    NotStarted {
        run_token: RunToken,
        generation: Generation,
        previous_digest: Option<Digest>,
    },
    /// One spawned execution (or cleaning attempt) is in flight; all
    /// requesters share it through the watch channel.
    Running {
        run_token: RunToken,
        generation: Generation,
        previous_digest: Option<Digest>,
        tx: Arc<watch::Sender<Option<NodeResult<N>>>>,
        abort: AbortHandle,
    },
    /// Terminal for the generation. `dirty` flags a needed re-check after an
    /// upstream invalidation; the stored result itself never mutates.
    Completed {
        run_token: RunToken,
        generation: Generation,
        result: Result<N::Item, N::Error>,
        digest: Option<Digest>,
        dep_generations: Vec<(EntryId, Generation)>,
        dirty: bool,
    },
}

impl<N: Node> EntryState<N> {
    fn initial() -> EntryState<N> {
        EntryState::NotStarted {
            run_token: RunToken::initial(),
            generation: Generation::initial(),
            previous_digest: None,
        }
    }
}

/// A node plus its mutable state. Clones share state; the graph arena holds
/// one clone and executions hold another.
pub(crate) struct Entry<N: Node> {
    node: Arc<N>,
    state: Arc<Mutex<EntryState<N>>>,
}

impl<N: Node> Clone for Entry<N> {
    fn clone(&self) -> Self {
        Entry {
            node: self.node.clone(),
            state: self.state.clone(),
        }
    }
}

impl<N: Node> Entry<N> {
    pub(crate) fn new(node: N) -> Entry<N> {
        Entry {
            node: Arc::new(node),
            state: Arc::new(Mutex::new(EntryState::initial())),
        }
    }

    pub(crate) fn node(&self) -> &N {
        &self.node
    }

    pub(crate) fn generation(&self) -> Generation {
        match *self.state.lock().expect("entry state lock poisoned") {
            EntryState::NotStarted { generation, .. }
            | EntryState::Running { generation, .. }
            | EntryState::Completed { generation, .. } => generation,
        }
    }

    /// Whether this entry has ever started running in its current
    /// generation. NotStarted entries need no invalidation.
    pub(crate) fn is_started(&self) -> bool {
        !matches!(
            *self.state.lock().expect("entry state lock poisoned"),
            EntryState::NotStarted { .. }
        )
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(
            *self.state.lock().expect("entry state lock poisoned"),
            EntryState::Running { .. }
        )
    }

    /// A clone of the completed result, if it is currently clean.
    pub(crate) fn peek(&self) -> Option<Result<N::Item, N::Error>> {
        match &*self.state.lock().expect("entry state lock poisoned") {
            EntryState::Completed { result, dirty, .. } if !dirty => Some(result.clone()),
            _ => None,
        }
    }

    /// Short state tag for visualization.
    pub(crate) fn state_label(&self) -> &'static str {
        match &*self.state.lock().expect("entry state lock poisoned") {
            EntryState::NotStarted { .. } => "pending",
            EntryState::Running { .. } => "running",
            EntryState::Completed { dirty: true, .. } => "completed (dirty)",
            EntryState::Completed {
                result: Ok(_), ..
            } => "completed",
            EntryState::Completed { .. } => "failed",
        }
    }

    /// Return a future for this node's result in the current generation.
    ///
    /// Completed-and-clean returns immediately; Running subscribes to the
    /// existing execution (at most one execution per node per generation);
    /// anything else spawns work — a cleaning attempt for dirty completed
    /// values, a full run otherwise.
    pub(crate) fn get_node_result(
        &self,
        context: &N::Context,
        entry_id: EntryId,
    ) -> BoxFuture<'static, NodeResult<N>> {
        let mut state = self.state.lock().expect("entry state lock poisoned");

        match &*state {
            EntryState::Completed {
                result,
                generation,
                dirty: false,
                ..
            } => {
                let ready = (result.clone(), *generation);
                return async move { ready }.boxed();
            }
            EntryState::Running {
                tx, generation, ..
            } => {
                let rx = tx.subscribe();
                return Self::subscription(rx, *generation);
            }
            _ => {}
        }

        // The entry needs work spawned: take the state by value.
        let (next_state, rx, generation) =
            match std::mem::replace(&mut *state, EntryState::initial()) {
                EntryState::NotStarted {
                    run_token,
                    generation,
                    previous_digest,
                } => self.spawn_execution(
                    context,
                    entry_id,
                    run_token,
                    generation,
                    previous_digest,
                    None,
                ),
                EntryState::Completed {
                    run_token,
                    generation,
                    result,
                    digest,
                    dep_generations,
                    ..
                } => {
                    // Dirty: attempt to clean successful results by checking
                    // dependency generations; failures simply re-run.
                    let cleaning = if result.is_ok() {
                        Some(PreviousCompletion {
                            result,
                            digest,
                            dep_generations,
                        })
                    } else {
                        None
                    };
                    self.spawn_execution(
                        context,
                        entry_id,
                        run_token,
                        generation,
                        digest,
                        cleaning,
                    )
                }
                EntryState::Running { .. } => {
                    unreachable!("running entries are handled above")
                }
            };

        *state = next_state;
        drop(state);
        Self::subscription(rx, generation)
    }

    /// Waiter side of the watch channel. A sender dropped without a value
    /// means the run was canceled or invalidated.
    fn subscription(
        mut rx: watch::Receiver<Option<NodeResult<N>>>,
        generation: Generation,
    ) -> BoxFuture<'static, NodeResult<N>> {
        async move {
            loop {
                if let Some(result) = rx.borrow_and_update().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    // One final look: the value may have been sent just
                    // before the sender dropped.
                    if let Some(result) = rx.borrow().clone() {
                        return result;
                    }
                    return (Err(N::Error::invalidated()), generation.next());
                }
            }
        }
        .boxed()
    }

    /// Spawn the execution task and build the Running state. The task runs
    /// outside all locks and reports back through the graph; if every waiter
    /// drops its receiver, the task is torn down and the entry reset.
    fn spawn_execution(
        &self,
        context: &N::Context,
        entry_id: EntryId,
        run_token: RunToken,
        generation: Generation,
        previous_digest: Option<Digest>,
        cleaning: Option<PreviousCompletion<N>>,
    ) -> (
        EntryState<N>,
        watch::Receiver<Option<NodeResult<N>>>,
        Generation,
    ) {
        let run_token = run_token.next();
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);

        let node = self.node.as_ref().clone();
        let context = context.clone_for(entry_id);
        let graph = context.graph().clone();
        let graph2 = graph.clone();
        let watch_tx = tx.clone();
        let is_cleaning = cleaning.is_some();

        trace!(node = %node, ?run_token, is_cleaning, "spawning node execution");

        let work = async move {
            if let Some(previous) = cleaning {
                if graph
                    .dependencies_unchanged(&context, &previous.dep_generations)
                    .await
                {
                    graph.stats().cleaning_succeeded.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    graph.complete_cleaned(entry_id, run_token, previous);
                    return;
                }
                graph.stats().cleaning_failed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                // Dependencies moved: drop the stale edges and re-run.
                graph.cleaning_failed(entry_id, run_token);
            }
            let result = node.run(context).await;
            graph.stats().ran.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            graph.complete(entry_id, run_token, result);
        };

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = work => {}
                _ = watch_tx.closed() => {
                    // Every waiter went away: this run is exclusively owned
                    // by canceled requests, so tear it down.
                    graph2.cancel(entry_id, run_token);
                }
            }
        });

        (
            EntryState::Running {
                run_token,
                generation,
                previous_digest,
                tx,
                abort: handle.abort_handle(),
            },
            rx,
            generation,
        )
    }

    /// Whether the given token identifies the currently running work.
    pub(crate) fn run_token_matches(&self, token: RunToken) -> bool {
        matches!(
            *self.state.lock().expect("entry state lock poisoned"),
            EntryState::Running { run_token, .. } if run_token == token
        )
    }

    /// Store the result of a finished run. Stale tokens are discarded.
    pub(crate) fn complete(
        &self,
        run_token: RunToken,
        result: Result<N::Item, N::Error>,
        dep_generations: Vec<(EntryId, Generation)>,
    ) {
        let mut state = self.state.lock().expect("entry state lock poisoned");
        match &*state {
            EntryState::Running {
                run_token: current, ..
            } if *current == run_token => {}
            _ => {
                trace!(node = %self.node, "discarding completion for a stale run");
                return;
            }
        }

        *state = match std::mem::replace(&mut *state, EntryState::initial()) {
            EntryState::Running {
                run_token,
                generation,
                previous_digest,
                tx,
                ..
            } => match result {
                Err(err) if err.is_invalidated() => {
                    tx.send((Err(err), generation.next()).into()).ok();
                    EntryState::NotStarted {
                        run_token: run_token.next(),
                        generation,
                        previous_digest,
                    }
                }
                Err(err) if !err.is_cacheable() => {
                    // Infrastructure trouble: deliver to current waiters but
                    // do not memoize; the next request retries.
                    let generation = generation.next();
                    tx.send((Err(err), generation).into()).ok();
                    EntryState::NotStarted {
                        run_token: run_token.next(),
                        generation,
                        previous_digest,
                    }
                }
                Err(err) => {
                    let generation = generation.next();
                    tx.send((Err(err.clone()), generation).into()).ok();
                    EntryState::Completed {
                        run_token,
                        generation,
                        result: Err(err),
                        digest: None,
                        dep_generations,
                        dirty: false,
                    }
                }
                Ok(item) => {
                    let digest = N::digest(&item);
                    // Early cutoff: an unchanged output keeps the old
                    // generation, so dependents clean instead of re-running.
                    let generation = if previous_digest == Some(digest) {
                        generation
                    } else {
                        generation.next()
                    };
                    tx.send((Ok(item.clone()), generation).into()).ok();
                    EntryState::Completed {
                        run_token,
                        generation,
                        result: Ok(item),
                        digest: Some(digest),
                        dep_generations,
                        dirty: false,
                    }
                }
            },
            _ => unreachable!("checked Running above"),
        };
    }

    /// Restore a Completed state whose dependencies proved unchanged. The
    /// generation deliberately does not move.
    pub(crate) fn complete_cleaned(&self, run_token: RunToken, previous: PreviousCompletion<N>) {
        let mut state = self.state.lock().expect("entry state lock poisoned");
        match &*state {
            EntryState::Running {
                run_token: current, ..
            } if *current == run_token => {}
            _ => return,
        }

        *state = match std::mem::replace(&mut *state, EntryState::initial()) {
            EntryState::Running {
                run_token,
                generation,
                tx,
                ..
            } => {
                tx.send((previous.result.clone(), generation).into()).ok();
                EntryState::Completed {
                    run_token,
                    generation,
                    result: previous.result,
                    digest: previous.digest,
                    dep_generations: previous.dep_generations,
                    dirty: false,
                }
            }
            _ => unreachable!("checked Running above"),
        };
    }

    /// Reset after a run whose waiters all went away.
    pub(crate) fn cancel(&self, run_token: RunToken) {
        let mut state = self.state.lock().expect("entry state lock poisoned");
        match &*state {
            EntryState::Running {
                run_token: current, ..
            } if *current == run_token => {}
            _ => return,
        }

        *state = match std::mem::replace(&mut *state, EntryState::initial()) {
            EntryState::Running {
                run_token,
                generation,
                previous_digest,
                ..
            } => {
                trace!(node = %self.node, "canceled");
                EntryState::NotStarted {
                    run_token: run_token.next(),
                    generation,
                    previous_digest,
                }
            }
            _ => unreachable!("checked Running above"),
        };
    }

    /// Invalidation root: drop the stored value entirely (the external world
    /// changed under it), keeping only the digest for early cutoff.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock().expect("entry state lock poisoned");
        *state = match std::mem::replace(&mut *state, EntryState::initial()) {
            EntryState::NotStarted {
                run_token,
                generation,
                previous_digest,
            } => EntryState::NotStarted {
                run_token: run_token.next(),
                generation,
                previous_digest,
            },
            EntryState::Running {
                run_token,
                generation,
                previous_digest,
                abort,
                ..
            } => {
                abort.abort();
                EntryState::NotStarted {
                    run_token: run_token.next(),
                    generation,
                    previous_digest,
                }
            }
            EntryState::Completed {
                run_token,
                generation,
                digest,
                ..
            } => EntryState::NotStarted {
                run_token: run_token.next(),
                generation,
                previous_digest: digest,
            },
        };
    }

    /// Transitive dependent of an invalidation root: flag for a re-check on
    /// the next request. No work happens eagerly.
    pub(crate) fn dirty(&self) {
        let mut state = self.state.lock().expect("entry state lock poisoned");
        match &mut *state {
            EntryState::Completed { dirty, .. } => {
                *dirty = true;
                return;
            }
            EntryState::NotStarted { .. } => return,
            EntryState::Running { .. } => {}
        }

        // A running node whose inputs changed cannot produce a trustworthy
        // value: abort it and let waiters retry from their roots.
        *state = match std::mem::replace(&mut *state, EntryState::initial()) {
            EntryState::Running {
                run_token,
                generation,
                previous_digest,
                abort,
                ..
            } => {
                abort.abort();
                EntryState::NotStarted {
                    run_token: run_token.next(),
                    generation,
                    previous_digest,
                }
            }
            _ => unreachable!("checked Running above"),
        };
    }
}
