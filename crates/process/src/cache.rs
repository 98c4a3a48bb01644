//! The process cache: fingerprint → previously captured result.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use forge_core::Fingerprint;
use lru::LruCache;
use tracing::debug;

use crate::error::ProcessError;
use crate::request::{ExecutionRequest, ExecutionResult};
use crate::ProcessRunner;

/// Bounded map from request fingerprint to captured result.
///
/// Entries are immutable once written: the same fingerprint always maps to
/// the same result, so overwrites are a no-op in practice and eviction only
/// costs a re-run.
pub struct ProcessCache {
    entries: Mutex<LruCache<Fingerprint, ExecutionResult>>,
}

impl ProcessCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        ProcessCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, fingerprint: Fingerprint) -> Option<ExecutionResult> {
        self.entries
            .lock()
            .expect("process cache lock poisoned")
            .get(&fingerprint)
            .cloned()
    }

    pub fn put(&self, fingerprint: Fingerprint, result: ExecutionResult) {
        self.entries
            .lock()
            .expect("process cache lock poisoned")
            .put(fingerprint, result);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("process cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counters exposed for tests and introspection.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    /// Runs actually delegated to the inner runner.
    pub runs: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

/// Consults the [`ProcessCache`] before delegating to the inner runner.
///
/// Results are stored whether or not the command succeeded — a deterministic
/// failure is just as cacheable as a success. What is *not* stored:
/// `cacheable = false` requests (bypassed entirely) and host-level errors
/// (they reflect the machine, not the inputs).
pub struct CachingRunner<R> {
    inner: R,
    cache: ProcessCache,
    stats: CacheStats,
}

impl<R: ProcessRunner> CachingRunner<R> {
    pub fn new(inner: R, capacity: usize) -> Self {
        CachingRunner {
            inner,
            cache: ProcessCache::new(capacity),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn cache(&self) -> &ProcessCache {
        &self.cache
    }
}

#[async_trait]
impl<R: ProcessRunner> ProcessRunner for CachingRunner<R> {
    async fn run(&self, req: ExecutionRequest) -> Result<ExecutionResult, ProcessError> {
        if !req.cacheable {
            self.stats.runs.fetch_add(1, Ordering::SeqCst);
            return self.inner.run(req).await;
        }

        let fingerprint = req.fingerprint();
        if let Some(result) = self.cache.get(fingerprint) {
            self.stats.hits.fetch_add(1, Ordering::SeqCst);
            debug!(command = %req.description, %fingerprint, "process cache hit");
            return Ok(result);
        }

        self.stats.misses.fetch_add(1, Ordering::SeqCst);
        self.stats.runs.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.run(req).await?;
        self.cache.put(fingerprint, result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    use forge_core::Digest;

    /// Counts dispatches and returns a result derived from the argv.
    struct CountingRunner {
        dispatched: AtomicU64,
    }

    impl CountingRunner {
        fn new() -> Self {
            CountingRunner {
                dispatched: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ProcessRunner for CountingRunner {
        async fn run(&self, req: ExecutionRequest) -> Result<ExecutionResult, ProcessError> {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionResult {
                exit_code: i32::from(req.argv[0] == "false"),
                stdout_digest: Digest::of_bytes(req.argv.join(" ").as_bytes()),
                stderr_digest: Digest::empty(),
                output_tree: Digest::empty(),
                timed_out: false,
            })
        }
    }

    fn req(argv: &[&str]) -> ExecutionRequest {
        ExecutionRequest::new(
            argv.iter().map(|s| s.to_string()).collect(),
            Digest::of_bytes(b"tree"),
        )
    }

    #[tokio::test]
    async fn second_identical_request_hits_cache() {
        let runner = CachingRunner::new(CountingRunner::new(), 16);
        let first = runner.run(req(&["echo", "hi"])).await.unwrap();
        let second = runner.run(req(&["echo", "hi"])).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(runner.stats().hits(), 1);
        assert_eq!(runner.stats().misses(), 1);
        // The dispatcher was not invoked the second time.
        assert_eq!(runner.inner.dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_requests_do_not_collide() {
        let runner = CachingRunner::new(CountingRunner::new(), 16);
        runner.run(req(&["echo", "hi"])).await.unwrap();
        runner.run(req(&["echo", "bye"])).await.unwrap();
        assert_eq!(runner.stats().hits(), 0);
        assert_eq!(runner.inner.dispatched.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_cached_too() {
        let runner = CachingRunner::new(CountingRunner::new(), 16);
        let first = runner.run(req(&["false"])).await.unwrap();
        assert!(!first.succeeded());
        let second = runner.run(req(&["false"])).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(runner.inner.dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn uncacheable_requests_always_run() {
        let runner = CachingRunner::new(CountingRunner::new(), 16);
        let request = req(&["date"]).uncacheable();
        runner.run(request.clone()).await.unwrap();
        runner.run(request).await.unwrap();
        assert_eq!(runner.stats().hits(), 0);
        assert_eq!(runner.inner.dispatched.load(Ordering::SeqCst), 2);
        assert!(runner.cache().is_empty());
    }

    #[tokio::test]
    async fn eviction_only_costs_a_rerun() {
        let runner = CachingRunner::new(CountingRunner::new(), 1);
        runner.run(req(&["a"])).await.unwrap();
        runner.run(req(&["b"])).await.unwrap(); // evicts "a"
        runner.run(req(&["a"])).await.unwrap(); // re-runs
        assert_eq!(runner.inner.dispatched.load(Ordering::SeqCst), 3);
    }
}
