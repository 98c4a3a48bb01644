//! The process execution contract: request and result value types.

use std::collections::BTreeMap;
use std::time::Duration;

use forge_core::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};

/// A description of an external command to run in a sandbox.
///
/// Immutable and hashable: [`ExecutionRequest::fingerprint`] over the
/// cache-relevant fields is the Process Cache key. The environment is a
/// `BTreeMap` so the fingerprint never depends on insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Digest of the input file tree materialized into the sandbox.
    pub input_tree: Digest,
    /// Files the command is expected to produce, relative to the sandbox.
    pub output_files: Vec<String>,
    /// Directories whose full contents are captured after the run.
    pub output_dirs: Vec<String>,
    /// Bounded lifetime; `None` means no limit.
    pub timeout: Option<Duration>,
    /// `false` marks intentionally non-deterministic commands: never cached,
    /// always run.
    pub cacheable: bool,
    /// Human-readable label for logs; not part of the fingerprint.
    pub description: String,
}

impl ExecutionRequest {
    pub fn new(argv: Vec<String>, input_tree: Digest) -> Self {
        let description = argv.join(" ");
        ExecutionRequest {
            argv,
            env: BTreeMap::new(),
            input_tree,
            output_files: Vec::new(),
            output_dirs: Vec::new(),
            timeout: None,
            cacheable: true,
            description,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_output_files(mut self, files: Vec<String>) -> Self {
        self.output_files = files;
        self
    }

    pub fn with_output_dirs(mut self, dirs: Vec<String>) -> Self {
        self.output_dirs = dirs;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The Process Cache key: a deterministic hash over everything that can
    /// change what the command observes or produces.
    pub fn fingerprint(&self) -> Fingerprint {
        #[derive(Serialize)]
        struct CacheKey<'a> {
            argv: &'a [String],
            env: &'a BTreeMap<String, String>,
            input_tree: &'a Digest,
            output_files: &'a [String],
            output_dirs: &'a [String],
            timeout_millis: Option<u64>,
        }
        let key = CacheKey {
            argv: &self.argv,
            env: &self.env,
            input_tree: &self.input_tree,
            output_files: &self.output_files,
            output_dirs: &self.output_dirs,
            timeout_millis: self.timeout.map(|t| t.as_millis() as u64),
        };
        let bytes = serde_json::to_vec(&key).expect("cache key serialization cannot fail");
        Fingerprint::of_bytes(&bytes)
    }
}

/// The captured outcome of one sandboxed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    /// Digest of the captured output file tree.
    pub output_tree: Digest,
    /// The run exceeded its declared timeout and was killed.
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(argv: &[&str]) -> ExecutionRequest {
        ExecutionRequest::new(
            argv.iter().map(|s| s.to_string()).collect(),
            Digest::of_bytes(b"tree"),
        )
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(
            req(&["echo", "hi"]).fingerprint(),
            req(&["echo", "hi"]).fingerprint()
        );
    }

    #[test]
    fn fingerprint_tracks_argv_env_and_inputs() {
        let base = req(&["echo", "hi"]);
        assert_ne!(base.fingerprint(), req(&["echo", "bye"]).fingerprint());

        let with_env = base
            .clone()
            .with_env([("KEY".to_string(), "VALUE".to_string())].into());
        assert_ne!(base.fingerprint(), with_env.fingerprint());

        let mut other_tree = base.clone();
        other_tree.input_tree = Digest::of_bytes(b"other tree");
        assert_ne!(base.fingerprint(), other_tree.fingerprint());
    }

    #[test]
    fn description_does_not_affect_fingerprint() {
        let a = req(&["echo", "hi"]);
        let b = a.clone().with_description("friendly greeting");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn env_order_does_not_affect_fingerprint() {
        let a = req(&["env"]).with_env(
            [("A", "1"), ("B", "2")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let b = req(&["env"]).with_env(
            [("B", "2"), ("A", "1")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
