//! The scheduler: compile, install, serve sessions.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use forge_core::{Config, Failure, Key, Params, TypeId, Value};
use forge_graph::{Graph, InvalidationResult, Stats};
use forge_process::{BoundedRunner, CachingRunner, CacheStats, LocalRunner};
use forge_rulegraph::{compile, RuleSet};
use forge_store::Store;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Semaphore;
use tracing::info;

use crate::context::{Context, EngineCore, TaskContext};
use crate::error::EngineError;
use crate::nodes::NodeKey;

/// A rule body: an async callable from the authoring layer. It observes the
/// engine through its [`TaskContext`] and returns the rule's typed product.
pub type RuleBody =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<Key, Failure>> + Send + Sync>;

/// Wrap an async closure as a [`RuleBody`].
pub fn body<F, Fut>(f: F) -> RuleBody
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Key, Failure>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// The installed engine. Construction compiles the rule set first: any
/// compile error means no scheduler exists at all.
pub struct Scheduler {
    pub(crate) core: Arc<EngineCore>,
}

impl Scheduler {
    pub fn new(rule_set: RuleSet<RuleBody>, config: Config) -> Result<Scheduler, EngineError> {
        let rule_graph = compile(rule_set)?;

        let store = match &config.store.store_dir {
            Some(dir) => Store::new_on_disk(dir)?,
            None => Store::new_in_memory(),
        };

        let mut local = LocalRunner::new(store.clone())
            .with_keep_sandboxes(config.execution.keep_sandboxes);
        if let Some(root) = &config.execution.sandbox_root {
            local = local.with_sandbox_root(root.clone());
        }
        let runner = Arc::new(CachingRunner::new(
            BoundedRunner::new(local, config.execution.process_concurrency),
            config.execution.cache_capacity,
        ));

        let core = Arc::new(EngineCore {
            rule_graph,
            graph: Arc::new(Graph::new(config.scheduler.invalidation_delay)),
            store,
            runner,
            io_semaphore: Semaphore::new(config.scheduler.io_concurrency.max(1)),
        });

        info!("scheduler installed");
        Ok(Scheduler { core })
    }

    /// Open a request scope. Sessions are cheap and share the node graph.
    pub fn session(&self) -> Session {
        Session {
            core: self.core.clone(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.core.store
    }

    /// Node execution counters.
    pub fn node_stats(&self) -> &Arc<Stats> {
        self.core.graph.stats()
    }

    /// Process cache counters.
    pub fn process_stats(&self) -> &CacheStats {
        self.core.runner.stats()
    }

    /// Mark every node keyed on `path` dirty. Dependents re-check lazily on
    /// their next request.
    pub fn invalidate_path(&self, path: &Path) -> InvalidationResult {
        self.core
            .graph
            .invalidate_from_roots(|node| node.is_keyed_on(path))
    }

    /// Mark every filesystem leaf dirty.
    pub fn invalidate_all_files(&self) -> InvalidationResult {
        self.core.graph.invalidate_from_roots(NodeKey::is_fs_leaf)
    }

    /// Drop all memoized state.
    pub fn reset(&self) {
        self.core.graph.clear_all();
    }

    /// Dot dump of the compiled rule graph.
    pub fn visualize_rule_graph(&self, f: &mut dyn io::Write) -> io::Result<()> {
        self.core.rule_graph.visualize(f)
    }

    /// Dot dump of the runtime node graph.
    pub fn visualize_graph(&self, f: &mut dyn io::Write) -> io::Result<()> {
        self.core.graph.visualize(f)
    }
}

/// One caller's view of the engine.
///
/// `request` is synchronous from the caller's point of view: it resolves the
/// query, expands nodes, and returns the final value. Dropping the returned
/// future cancels whatever work no other live request is waiting on.
#[derive(Clone)]
pub struct Session {
    core: Arc<EngineCore>,
}

impl Session {
    pub async fn request(&self, product: TypeId, params: Params) -> Result<Value, EngineError> {
        let root = self
            .core
            .rule_graph
            .find_root(product, &params.type_ids())?;
        let selected = self.core.rule_graph.entry(root).get_deps[0];

        let context = Context::root(self.core.clone());
        let key = context.request_entry(selected, &params).await?;
        Ok(key.value().clone())
    }

    /// Like [`Session::request`], returning the typed key (value + digest).
    pub async fn request_key(&self, product: TypeId, params: Params) -> Result<Key, EngineError> {
        let root = self
            .core
            .rule_graph
            .find_root(product, &params.type_ids())?;
        let selected = self.core.rule_graph.entry(root).get_deps[0];

        let context = Context::root(self.core.clone());
        Ok(context.request_entry(selected, &params).await?)
    }
}
