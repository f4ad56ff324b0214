//! Engine configuration.
//!
//! All knobs have serde defaults so a partial JSON config deserializes into
//! a fully usable value. Paths are interpreted relative to nothing: callers
//! pass an absolute `local_root`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Retry policy for transient failures in the apply workers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// First backoff delay in milliseconds (default: 1000)
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt (default: 2.0)
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
    /// Upper bound on a single backoff delay in milliseconds (default: 60000)
    #[serde(default = "default_retry_cap_ms")]
    pub max_delay_ms: u64,
    /// Fractional jitter applied to each delay, e.g. 0.2 for ±20% (default: 0.2)
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
    /// Total attempts before the failure is surfaced (default: 5)
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_ms(),
            factor: default_retry_factor(),
            max_delay_ms: default_retry_cap_ms(),
            jitter: default_retry_jitter(),
            max_attempts: default_retry_attempts(),
        }
    }
}

/// Configuration for a sync engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Absolute path of the local directory tree to keep in sync.
    pub local_root: PathBuf,
    /// Name of the engine's own state directory inside `local_root`
    /// (index DB, temp downloads). Events under it are suppressed.
    #[serde(default = "default_cache_dir_name")]
    pub cache_dir_name: String,
    /// Debounce window for raw filesystem events in milliseconds (default: 500)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Number of apply workers running in parallel (default: 6)
    #[serde(default = "default_parallelism")]
    pub worker_parallelism: usize,
    /// Interval between maintenance passes in seconds (default: 3600)
    #[serde(default = "default_maintenance_secs")]
    pub maintenance_interval_secs: u64,
    /// A pause longer than this forces a fresh reconciliation on resume
    /// (default: 86400, i.e. 24 h).
    #[serde(default = "default_reconcile_after_pause_secs")]
    pub reconcile_after_pause_secs: u64,
    /// Long-poll timeout handed to the remote client in seconds (default: 30)
    #[serde(default = "default_long_poll_secs")]
    pub long_poll_timeout_secs: u64,
    /// Whether the local filesystem folds case. `None` means probe at startup
    /// by writing a marker file into the cache directory.
    #[serde(default)]
    pub case_insensitive: Option<bool>,
    /// Retry policy for transient apply failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl SyncConfig {
    /// Configuration with defaults for the given local root.
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            cache_dir_name: default_cache_dir_name(),
            debounce_ms: default_debounce_ms(),
            worker_parallelism: default_parallelism(),
            maintenance_interval_secs: default_maintenance_secs(),
            reconcile_after_pause_secs: default_reconcile_after_pause_secs(),
            long_poll_timeout_secs: default_long_poll_secs(),
            case_insensitive: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Absolute path of the engine's state directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.local_root.join(&self.cache_dir_name)
    }

    /// Absolute path of the index database file.
    pub fn index_db_path(&self) -> PathBuf {
        self.cache_dir().join("index.db")
    }
}

fn default_cache_dir_name() -> String {
    ".driftsync".to_string()
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_parallelism() -> usize {
    6
}

fn default_maintenance_secs() -> u64 {
    3600
}

fn default_reconcile_after_pause_secs() -> u64 {
    86_400
}

fn default_long_poll_secs() -> u64 {
    30
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_cap_ms() -> u64 {
    60_000
}

fn default_retry_jitter() -> f64 {
    0.2
}

fn default_retry_attempts() -> u32 {
    5
}
