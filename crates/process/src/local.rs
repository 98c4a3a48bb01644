//! The local sandbox executor.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use forge_store::{DirectoryTree, Store};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::ProcessError;
use crate::request::{ExecutionRequest, ExecutionResult};
use crate::ProcessRunner;

/// Runs commands in isolated working directories.
///
/// Each run sees exactly its declared input tree and a scrubbed environment
/// containing only its declared variables — nothing from the host leaks in,
/// so the fingerprint really does cover everything the command can observe.
pub struct LocalRunner {
    store: Store,
    /// Parent directory for sandboxes; `None` uses the system temp dir.
    sandbox_root: Option<PathBuf>,
    /// Keep sandbox directories after the run, for debugging.
    keep_sandboxes: bool,
}

impl LocalRunner {
    pub fn new(store: Store) -> Self {
        LocalRunner {
            store,
            sandbox_root: None,
            keep_sandboxes: false,
        }
    }

    pub fn with_sandbox_root(mut self, root: PathBuf) -> Self {
        self.sandbox_root = Some(root);
        self
    }

    pub fn with_keep_sandboxes(mut self, keep: bool) -> Self {
        self.keep_sandboxes = keep;
        self
    }

    fn create_sandbox(&self) -> Result<TempDir, ProcessError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("forge-sandbox-");
        match &self.sandbox_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                Ok(builder.tempdir_in(root)?)
            }
            None => Ok(builder.tempdir()?),
        }
    }

    /// Capture declared outputs from the sandbox back into the store.
    fn capture_outputs(
        &self,
        sandbox: &Path,
        req: &ExecutionRequest,
    ) -> Result<forge_core::Digest, ProcessError> {
        let mut trees = Vec::new();

        for rel in &req.output_files {
            let full = sandbox.join(rel);
            if !full.is_file() {
                // A missing declared output is not an infra error: the
                // command simply did not produce it (its exit code will
                // usually explain why).
                continue;
            }
            let digest = self.store.store_file(&full)?;
            trees.push(DirectoryTree::new(vec![forge_store::FileEntry {
                path: rel.clone(),
                digest,
                is_executable: false,
            }])?);
        }

        for rel in &req.output_dirs {
            let full = sandbox.join(rel);
            if !full.is_dir() {
                continue;
            }
            let subtree_digest = self.store.snapshot(&full)?;
            let subtree = self
                .store
                .load_tree(subtree_digest)?
                .unwrap_or_else(DirectoryTree::empty);
            // Re-root the captured subtree under its declared directory.
            let rerooted = DirectoryTree::new(
                subtree
                    .files()
                    .iter()
                    .map(|f| forge_store::FileEntry {
                        path: format!("{}/{}", rel.trim_end_matches('/'), f.path),
                        digest: f.digest,
                        is_executable: f.is_executable,
                    })
                    .collect(),
            )?;
            trees.push(rerooted);
        }

        let merged = DirectoryTree::merge(trees)?;
        Ok(self.store.store_tree(&merged)?)
    }
}

#[async_trait]
impl ProcessRunner for LocalRunner {
    async fn run(&self, req: ExecutionRequest) -> Result<ExecutionResult, ProcessError> {
        let argv0 = req.argv.first().ok_or(ProcessError::EmptyArgv)?.clone();
        let sandbox = self.create_sandbox()?;
        let workdir = sandbox.path().to_path_buf();

        // Materialize only the declared input tree.
        self.store.materialize(req.input_tree, &workdir)?;

        debug!(command = %req.description, sandbox = %workdir.display(), "spawning process");

        let mut command = tokio::process::Command::new(&argv0);
        command
            .args(&req.argv[1..])
            .env_clear()
            .envs(&req.env)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| ProcessError::Spawn {
            argv0: argv0.clone(),
            reason: e.to_string(),
        })?;

        let (output, timed_out) = match req.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => (output?, false),
                Err(_elapsed) => {
                    // kill_on_drop reaps the child; report a normal failed
                    // result rather than an engine error.
                    warn!(command = %req.description, ?limit, "process timed out");
                    let empty = self.store.store_bytes(b"")?;
                    let output_tree = self.store.empty_tree_digest()?;
                    let result = ExecutionResult {
                        exit_code: -1,
                        stdout_digest: empty,
                        stderr_digest: empty,
                        output_tree,
                        timed_out: true,
                    };
                    if self.keep_sandboxes {
                        let kept = sandbox.keep();
                        debug!(sandbox = %kept.display(), "kept sandbox");
                    }
                    return Ok(result);
                }
            },
            None => (child.wait_with_output().await?, false),
        };

        let stdout_digest = self.store.store_bytes(&output.stdout)?;
        let stderr_digest = self.store.store_bytes(&output.stderr)?;
        let output_tree = self.capture_outputs(&workdir, &req)?;
        let exit_code = output.status.code().unwrap_or(-1);

        debug!(command = %req.description, exit_code, "process finished");

        if self.keep_sandboxes {
            let kept = sandbox.keep();
            debug!(sandbox = %kept.display(), "kept sandbox");
        }

        Ok(ExecutionResult {
            exit_code,
            stdout_digest,
            stderr_digest,
            output_tree,
            timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn runner() -> (LocalRunner, Store) {
        let store = Store::new_in_memory();
        (LocalRunner::new(store.clone()), store)
    }

    fn request(store: &Store, argv: &[&str]) -> ExecutionRequest {
        ExecutionRequest::new(
            argv.iter().map(|s| s.to_string()).collect(),
            store.empty_tree_digest().unwrap(),
        )
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let (runner, store) = runner();
        let result = runner.run(request(&store, &["echo", "hi"])).await.unwrap();
        assert!(result.succeeded());
        let stdout = store.load_bytes(result.stdout_digest).unwrap().unwrap();
        assert_eq!(stdout.as_ref(), b"hi\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_result_not_an_error() {
        let (runner, store) = runner();
        let result = runner.run(request(&store, &["false"])).await.unwrap();
        assert!(!result.succeeded());
        assert_eq!(result.exit_code, 1);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn timeout_is_a_result_not_an_error() {
        let (runner, store) = runner();
        let req = request(&store, &["sleep", "5"]).with_timeout(Duration::from_millis(100));
        let result = runner.run(req).await.unwrap();
        assert!(result.timed_out);
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn sees_only_declared_inputs() {
        let (runner, store) = runner();
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("input.txt"), b"declared").unwrap();
        let input_tree = store.snapshot(src.path()).unwrap();

        let mut req = request(&store, &["cat", "input.txt"]);
        req.input_tree = input_tree;
        let result = runner.run(req).await.unwrap();
        assert!(result.succeeded());
        let stdout = store.load_bytes(result.stdout_digest).unwrap().unwrap();
        assert_eq!(stdout.as_ref(), b"declared");
    }

    #[tokio::test]
    async fn captures_declared_output_files() {
        let (runner, store) = runner();
        let req = request(&store, &["sh", "-c", "echo payload > out.txt"])
            .with_output_files(vec!["out.txt".to_string()]);
        let result = runner.run(req).await.unwrap();
        assert!(result.succeeded());

        let contents = store.contents(result.output_tree).unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].0, "out.txt");
        assert_eq!(contents[0].1.as_ref(), b"payload\n");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let (runner, store) = runner();
        let err = runner
            .run(request(&store, &["definitely-not-a-real-binary-xyz"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
