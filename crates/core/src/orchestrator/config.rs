//! Orchestrator configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the orchestrator's pools and processing loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Size of the shared downloader pool.
    #[serde(default = "default_downloaders")]
    pub max_concurrent_downloaders: usize,

    /// How often the processing loop runs (milliseconds).
    /// 0 disables the loop; callers must invoke `update_state` themselves.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Hardware threads kept free when sizing the worker pool.
    #[serde(default = "default_reserved_threads")]
    pub reserved_threads: usize,

    /// Explicit worker pool size, overriding the hardware-derived one.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Minimum time between periodic updates of a running scheduler.
    #[serde(default = "default_attempt_update_interval")]
    pub attempt_update_interval_secs: u64,

    /// Where shared downloaders store their files.
    #[serde(default = "default_download_root")]
    pub download_root: PathBuf,

    /// Log lines kept per scheduler status.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_downloaders() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    5000 // 5 seconds
}

fn default_reserved_threads() -> usize {
    2
}

fn default_attempt_update_interval() -> u64 {
    3600 // 1 hour
}

fn default_download_root() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_log_capacity() -> usize {
    100
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloaders: default_downloaders(),
            poll_interval_ms: default_poll_interval(),
            reserved_threads: default_reserved_threads(),
            worker_threads: None,
            attempt_update_interval_secs: default_attempt_update_interval(),
            download_root: default_download_root(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl OrchestratorConfig {
    /// Worker pool size for a machine with `cpus` hardware threads.
    ///
    /// Small machines get a single worker; otherwise the reserved threads
    /// and the downloader pool are subtracted, floor 1.
    pub fn worker_pool_size(&self, cpus: usize) -> usize {
        if let Some(explicit) = self.worker_threads {
            return explicit.max(1);
        }
        if cpus < 4 {
            return 1;
        }
        cpus.saturating_sub(self.reserved_threads)
            .saturating_sub(self.max_concurrent_downloaders)
            .max(1)
    }
}
