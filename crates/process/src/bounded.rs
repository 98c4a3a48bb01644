//! Concurrency-bounded wrapper runner.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::trace;

use crate::error::ProcessError;
use crate::request::{ExecutionRequest, ExecutionResult};
use crate::ProcessRunner;

/// Limits the number of simultaneously running processes.
///
/// This bound is independent of node-level concurrency: the scheduler may
/// have thousands of suspended rule bodies in flight, but processes consume
/// real host resources and get their own, much smaller budget.
pub struct BoundedRunner<R> {
    inner: R,
    semaphore: Arc<Semaphore>,
}

impl<R: ProcessRunner> BoundedRunner<R> {
    pub fn new(inner: R, bound: usize) -> Self {
        BoundedRunner {
            inner,
            semaphore: Arc::new(Semaphore::new(bound.max(1))),
        }
    }

    /// Permits currently available (for tests and introspection).
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[async_trait]
impl<R: ProcessRunner> ProcessRunner for BoundedRunner<R> {
    async fn run(&self, req: ExecutionRequest) -> Result<ExecutionResult, ProcessError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("process semaphore closed");
        trace!(command = %req.description, "acquired process slot");
        self.inner.run(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use forge_core::Digest;

    /// Records the peak number of concurrent `run` calls.
    struct PeakRunner {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl PeakRunner {
        fn new() -> Self {
            PeakRunner {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProcessRunner for PeakRunner {
        async fn run(&self, _req: ExecutionRequest) -> Result<ExecutionResult, ProcessError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(ExecutionResult {
                exit_code: 0,
                stdout_digest: Digest::empty(),
                stderr_digest: Digest::empty(),
                output_tree: Digest::empty(),
                timed_out: false,
            })
        }
    }

    #[tokio::test]
    async fn bound_limits_concurrency() {
        let runner = Arc::new(BoundedRunner::new(PeakRunner::new(), 2));
        let mut handles = Vec::new();
        for i in 0..8 {
            let runner = runner.clone();
            handles.push(tokio::spawn(async move {
                let req = ExecutionRequest::new(vec![format!("cmd-{i}")], Digest::empty());
                runner.run(req).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(runner.inner.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(runner.available_permits(), 2);
    }
}
