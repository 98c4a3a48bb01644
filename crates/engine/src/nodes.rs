//! The closed world of node kinds the scheduler executes.
//!
//! Rule bodies become [`TaskNode`]s; everything bottoms out in intrinsic
//! leaves — file digests, directory snapshots and sandboxed process runs.
//! Node identity is the enum value itself: equal keys share one memoized
//! execution per generation.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use forge_core::{Digest, Failure, Params};
use forge_graph::Node;
use forge_process::{ExecutionRequest, ExecutionResult, ProcessRunner};
use tracing::trace;

use crate::context::Context;

/// A rule body applied to a pruned Params bag.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskNode {
    /// Index of the compiled rule entry.
    pub entry_id: usize,
    /// Rule name, carried for logs and visualization.
    pub name: String,
    /// The subset of the bag this entry actually consumes.
    pub params: Params,
}

/// A sandboxed process run, identified by its full request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessNode {
    pub request: ExecutionRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKey {
    /// Run a compiled rule body.
    Task(TaskNode),
    /// Digest of one file's content: an invalidation root.
    FileDigest(PathBuf),
    /// Capture a directory tree into the store: an invalidation root.
    Snapshot(PathBuf),
    /// Execute an external command through the caching/bounded/local stack.
    Process(ProcessNode),
}

impl NodeKey {
    /// Whether a filesystem change at `path` invalidates this node.
    pub fn is_keyed_on(&self, path: &std::path::Path) -> bool {
        match self {
            NodeKey::FileDigest(p) => p == path,
            NodeKey::Snapshot(root) => path.starts_with(root),
            NodeKey::Task(_) | NodeKey::Process(_) => false,
        }
    }

    /// Whether this node observes the filesystem at all.
    pub fn is_fs_leaf(&self) -> bool {
        matches!(self, NodeKey::FileDigest(_) | NodeKey::Snapshot(_))
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Task(task) => write!(f, "{}({})", task.name, task.params),
            NodeKey::FileDigest(path) => write!(f, "FileDigest({})", path.display()),
            NodeKey::Snapshot(path) => write!(f, "Snapshot({})", path.display()),
            NodeKey::Process(node) => write!(f, "Process({})", node.request.description),
        }
    }
}

/// What a node produces. The digest drives early cutoff: unchanged digests
/// stop invalidation from propagating further up.
#[derive(Clone, Debug)]
pub enum NodeOutput {
    /// A typed rule product.
    Value(forge_core::Key),
    /// A file content digest.
    Digest(Digest),
    /// A captured directory tree digest.
    Snapshot(Digest),
    /// A captured process outcome.
    ProcessResult(ExecutionResult),
}

impl NodeOutput {
    pub fn digest(&self) -> Digest {
        match self {
            NodeOutput::Value(key) => key.digest(),
            NodeOutput::Digest(digest) | NodeOutput::Snapshot(digest) => *digest,
            NodeOutput::ProcessResult(result) => {
                let bytes = serde_json::to_vec(result)
                    .expect("execution result serialization cannot fail");
                Digest::of_bytes(&bytes)
            }
        }
    }
}

#[async_trait]
impl Node for NodeKey {
    type Item = NodeOutput;
    type Error = Failure;
    type Context = Context;

    async fn run(self, context: Context) -> Result<NodeOutput, Failure> {
        trace!(node = %self, "running node");
        match self {
            NodeKey::FileDigest(path) => {
                let _permit = context.io_permit().await;
                context
                    .store()
                    .store_file(&path)
                    .map(NodeOutput::Digest)
                    // Unreadable content is a property of the inputs, not the
                    // host: memoize it and let invalidation clear it.
                    .map_err(|e| Failure::Error(format!("{}: {}", path.display(), e)))
            }
            NodeKey::Snapshot(path) => {
                let _permit = context.io_permit().await;
                context
                    .store()
                    .snapshot(&path)
                    .map(NodeOutput::Snapshot)
                    .map_err(|e| Failure::Error(format!("{}: {}", path.display(), e)))
            }
            NodeKey::Process(node) => {
                let result = context
                    .runner()
                    .run(node.request)
                    .await
                    // Host-level trouble: fatal for this request, not cached.
                    .map_err(|e| Failure::Fatal(e.to_string()))?;
                Ok(NodeOutput::ProcessResult(result))
            }
            NodeKey::Task(task) => context.run_task(task).await.map(NodeOutput::Value),
        }
    }

    fn digest(item: &NodeOutput) -> Digest {
        item.digest()
    }
}
