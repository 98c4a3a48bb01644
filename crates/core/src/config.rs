use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_usize(key: &str, default: usize) -> usize {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_opt(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

/// Engine configuration, read from `FORGE_*` env vars with sane defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub execution: ExecutionConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            store: StoreConfig::from_env(),
            execution: ExecutionConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  store:     dir={}",
            self.store
                .store_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(memory only)".to_string())
        );
        tracing::info!(
            "  execution: processes={}, cache_capacity={}, keep_sandboxes={}",
            self.execution.process_concurrency,
            self.execution.cache_capacity,
            self.execution.keep_sandboxes
        );
        tracing::info!(
            "  scheduler: io_concurrency={}, invalidation_delay={:?}",
            self.scheduler.io_concurrency,
            self.scheduler.invalidation_delay
        );
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults without consulting the environment; tests rely on this
        // being stable regardless of ambient env vars.
        Self {
            store: StoreConfig { store_dir: None },
            execution: ExecutionConfig {
                sandbox_root: None,
                process_concurrency: default_process_concurrency(),
                cache_capacity: 4096,
                keep_sandboxes: false,
            },
            scheduler: SchedulerConfig {
                io_concurrency: 64,
                invalidation_delay: Duration::from_millis(100),
            },
        }
    }
}

fn default_process_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// ── Store ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// On-disk CAS root; `None` keeps everything in memory.
    pub store_dir: Option<PathBuf>,
}

impl StoreConfig {
    fn from_env() -> Self {
        Self {
            store_dir: env_opt("FORGE_STORE_DIR").map(PathBuf::from),
        }
    }
}

// ── Process execution ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Root for sandbox working areas; `None` uses the system temp dir.
    pub sandbox_root: Option<PathBuf>,
    /// Maximum simultaneously running external processes.
    pub process_concurrency: usize,
    /// Process cache capacity (entries).
    pub cache_capacity: usize,
    /// Keep sandbox directories after execution, for debugging.
    pub keep_sandboxes: bool,
}

impl ExecutionConfig {
    fn from_env() -> Self {
        Self {
            sandbox_root: env_opt("FORGE_SANDBOX_ROOT").map(PathBuf::from),
            process_concurrency: env_usize(
                "FORGE_PROCESS_CONCURRENCY",
                default_process_concurrency(),
            ),
            cache_capacity: env_usize("FORGE_PROCESS_CACHE_CAPACITY", 4096),
            keep_sandboxes: env_bool("FORGE_KEEP_SANDBOXES", false),
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum concurrent filesystem intrinsics (digests, snapshots).
    pub io_concurrency: usize,
    /// Delay before a root request retries after mid-run invalidation.
    #[serde(with = "duration_millis")]
    pub invalidation_delay: Duration,
}

impl SchedulerConfig {
    fn from_env() -> Self {
        Self {
            io_concurrency: env_usize("FORGE_IO_CONCURRENCY", 64),
            invalidation_delay: Duration::from_millis(env_u64(
                "FORGE_INVALIDATION_DELAY_MS",
                100,
            )),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert!(config.execution.process_concurrency >= 1);
        assert!(config.scheduler.io_concurrency >= 1);
        assert!(config.store.store_dir.is_none());
    }

    #[test]
    fn env_helpers_fall_back() {
        assert_eq!(env_usize("FORGE_DOES_NOT_EXIST_XYZ", 7), 7);
        assert_eq!(env_u64("FORGE_DOES_NOT_EXIST_XYZ", 9), 9);
        assert!(!env_bool("FORGE_DOES_NOT_EXIST_XYZ", false));
        assert!(env_opt("FORGE_DOES_NOT_EXIST_XYZ").is_none());
    }

    #[test]
    fn config_serde_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.scheduler.invalidation_delay,
            config.scheduler.invalidation_delay
        );
    }
}
