//! Per-request state threaded through node executions, and the API rule
//! bodies program against.

use std::sync::Arc;

use forge_core::{Digest, Failure, Key, Params, TypeId, Value};
use forge_graph::{EntryId, Graph, NodeContext};
use forge_process::{
    BoundedRunner, CachingRunner, ExecutionRequest, ExecutionResult, LocalRunner,
};
use forge_rulegraph::{EntrySource, RuleGraph};
use forge_store::Store;
use futures::future;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::nodes::{NodeKey, NodeOutput, ProcessNode, TaskNode};
use crate::scheduler::RuleBody;

/// The process stack the engine executes through: cache on the outside,
/// bounded concurrency in the middle, sandboxes at the bottom.
pub(crate) type EngineRunner = CachingRunner<BoundedRunner<LocalRunner>>;

/// Shared engine state: the compiled rule graph, the node graph, the digest
/// store and the process stack. Immutable after construction; all mutation
/// lives inside the node graph and the caches.
pub(crate) struct EngineCore {
    pub(crate) rule_graph: RuleGraph<RuleBody>,
    pub(crate) graph: Arc<Graph<NodeKey>>,
    pub(crate) store: Store,
    pub(crate) runner: Arc<EngineRunner>,
    pub(crate) io_semaphore: Semaphore,
}

/// The [`NodeContext`] implementation: engine state plus the identity of the
/// node currently being run (None at a request root).
#[derive(Clone)]
pub struct Context {
    pub(crate) core: Arc<EngineCore>,
    entry_id: Option<EntryId>,
}

impl Context {
    pub(crate) fn root(core: Arc<EngineCore>) -> Context {
        Context {
            core,
            entry_id: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.core.store
    }

    pub(crate) fn runner(&self) -> &EngineRunner {
        &self.core.runner
    }

    /// Gate filesystem intrinsics: I/O has its own budget, independent of
    /// how many rule bodies are suspended.
    pub(crate) async fn io_permit(&self) -> SemaphorePermit<'_> {
        self.core
            .io_semaphore
            .acquire()
            .await
            .expect("io semaphore closed")
    }

    /// Request a compiled entry with the given (already merged) bag.
    ///
    /// Param entries come straight from the bag; rule entries become task
    /// nodes keyed on the pruned bag, so irrelevant inherited params do not
    /// split the memo space.
    pub(crate) async fn request_entry(
        &self,
        entry_id: usize,
        bag: &Params,
    ) -> Result<Key, Failure> {
        let entry = self.core.rule_graph.entry(entry_id);
        match &entry.source {
            EntrySource::Param(type_id) => bag
                .get(*type_id)
                .cloned()
                .ok_or_else(|| {
                    Failure::Fatal(format!(
                        "param {type_id} missing from bag; the compiled graph guaranteed it"
                    ))
                }),
            EntrySource::Rule(idx) => {
                let rule = self.core.rule_graph.rule(*idx);
                let node = NodeKey::Task(TaskNode {
                    entry_id,
                    name: rule.name.clone(),
                    params: bag.retain_subset(&entry.params),
                });
                match self.core.graph.get(self, node).await? {
                    NodeOutput::Value(key) => Ok(key),
                    other => Err(Failure::Fatal(format!(
                        "task entry produced a non-value output: {other:?}"
                    ))),
                }
            }
            EntrySource::Root(query) => Err(Failure::Fatal(format!(
                "root entry requested as a dependency: {query}"
            ))),
        }
    }

    /// Execute a task node: resolve the rule's declared inputs (concurrently),
    /// then hand control to the body.
    pub(crate) async fn run_task(&self, task: TaskNode) -> Result<Key, Failure> {
        let entry = self.core.rule_graph.entry(task.entry_id);
        let rule_idx = match entry.source {
            EntrySource::Rule(idx) => idx,
            _ => {
                return Err(Failure::Fatal(format!(
                    "task node {} does not name a rule entry",
                    task.name
                )))
            }
        };
        let rule = self.core.rule_graph.rule(rule_idx);

        let input_futures = rule
            .params
            .iter()
            .zip(entry.param_deps.iter())
            .map(|(_, &dep)| self.request_entry(dep, &task.params))
            .collect::<Vec<_>>();
        let inputs = future::try_join_all(input_futures).await?;

        let task_context = TaskContext {
            context: self.clone(),
            entry_id: task.entry_id,
            params: task.params.clone(),
            inputs,
        };

        let product = rule.product;
        let key = (rule.body)(task_context).await?;
        if key.type_id() != product {
            return Err(Failure::Error(format!(
                "rule {} returned a {} where its product is {}",
                rule.name,
                key.type_id(),
                product
            )));
        }
        Ok(key)
    }
}

impl NodeContext for Context {
    type Node = NodeKey;

    fn clone_for(&self, entry_id: EntryId) -> Context {
        Context {
            core: self.core.clone(),
            entry_id: Some(entry_id),
        }
    }

    fn entry_id(&self) -> Option<EntryId> {
        self.entry_id
    }

    fn graph(&self) -> &Arc<Graph<NodeKey>> {
        &self.core.graph
    }
}

/// What a rule body sees while it runs.
///
/// `get` is the suspension point: it resolves a declared Get edge to a child
/// node and parks this body until the child completes. Independent gets can
/// run concurrently via [`TaskContext::get_all`] or `futures::join!`.
#[derive(Clone)]
pub struct TaskContext {
    context: Context,
    entry_id: usize,
    params: Params,
    inputs: Vec<Key>,
}

impl TaskContext {
    /// The resolved value of the rule's n-th declared param selector.
    pub fn input(&self, index: usize) -> &Value {
        self.inputs[index].value()
    }

    /// Downcast the n-th declared input to a concrete type.
    pub fn input_as<T: 'static>(&self, index: usize) -> Result<&T, Failure> {
        self.inputs[index].downcast_ref::<T>().ok_or_else(|| {
            Failure::Fatal(format!("input {index} has an unexpected payload type"))
        })
    }

    /// The bag this node was keyed on.
    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn store(&self) -> &Store {
        self.context.store()
    }

    /// Issue a declared Get: request `product`, introducing `extra` params
    /// for the subtree. A failing child short-circuits this body.
    pub async fn get(&self, product: TypeId, extra: Vec<Key>) -> Result<Value, Failure> {
        let key = self.get_key(product, extra).await?;
        Ok(key.value().clone())
    }

    /// Failure-tolerant composition: a child's logical failure is returned
    /// as a value instead of aborting this body. Invalidation and
    /// infrastructure failures still propagate.
    pub async fn try_get(
        &self,
        product: TypeId,
        extra: Vec<Key>,
    ) -> Result<Result<Value, Failure>, Failure> {
        match self.get_key(product, extra).await {
            Ok(key) => Ok(Ok(key.value().clone())),
            Err(failure) if failure.is_cacheable() => Ok(Err(failure)),
            Err(failure) => Err(failure),
        }
    }

    /// Issue several independent gets concurrently.
    pub async fn get_all(
        &self,
        requests: Vec<(TypeId, Vec<Key>)>,
    ) -> Result<Vec<Value>, Failure> {
        let futures = requests
            .into_iter()
            .map(|(product, extra)| self.get(product, extra))
            .collect::<Vec<_>>();
        future::try_join_all(futures).await
    }

    async fn get_key(&self, product: TypeId, extra: Vec<Key>) -> Result<Key, Failure> {
        let entry = self.context.core.rule_graph.entry(self.entry_id);
        let rule = match entry.source {
            EntrySource::Rule(idx) => self.context.core.rule_graph.rule(idx),
            _ => return Err(Failure::Fatal("get outside a rule entry".to_string())),
        };

        // Match the call against the rule's declared Get edges.
        let extra_types: std::collections::BTreeSet<TypeId> =
            extra.iter().map(|k| k.type_id()).collect();
        let position = rule.gets.iter().position(|get| {
            get.product == product
                && get.provides.iter().copied().collect::<std::collections::BTreeSet<_>>()
                    == extra_types
        });
        let position = position.ok_or_else(|| {
            Failure::Error(format!(
                "rule {} issued an undeclared Get({product}) with provided [{}]",
                rule.name,
                extra_types
                    .iter()
                    .map(|t| t.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        let child_entry = entry.get_deps[position];
        // The child's bag is ours plus the provided keys; provided keys
        // shadow inherited ones.
        let merged = self.params.union(extra);
        self.context.request_entry(child_entry, &merged).await
    }

    /// Digest of a file's content: a memoized leaf that registers with the
    /// invalidation source by path.
    pub async fn digest_of(&self, path: impl Into<std::path::PathBuf>) -> Result<Digest, Failure> {
        let node = NodeKey::FileDigest(path.into());
        match self.context.core.graph.get(&self.context, node).await? {
            NodeOutput::Digest(digest) => Ok(digest),
            other => Err(Failure::Fatal(format!("unexpected output: {other:?}"))),
        }
    }

    /// Capture a directory tree into the store, as a memoized leaf.
    pub async fn snapshot(&self, path: impl Into<std::path::PathBuf>) -> Result<Digest, Failure> {
        let node = NodeKey::Snapshot(path.into());
        match self.context.core.graph.get(&self.context, node).await? {
            NodeOutput::Snapshot(digest) => Ok(digest),
            other => Err(Failure::Fatal(format!("unexpected output: {other:?}"))),
        }
    }

    /// Run an external command through the process cache, the concurrency
    /// bound and the sandbox. Non-zero exits and timeouts come back as
    /// ordinary results for this body to interpret.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, Failure> {
        let node = NodeKey::Process(ProcessNode { request });
        match self.context.core.graph.get(&self.context, node).await? {
            NodeOutput::ProcessResult(result) => Ok(result),
            other => Err(Failure::Fatal(format!("unexpected output: {other:?}"))),
        }
    }
}
