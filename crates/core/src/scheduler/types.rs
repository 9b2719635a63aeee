//! Scheduler status snapshots and errors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheScope, StoreError};
use crate::download::DownloadError;
use crate::project::ProjectError;
use crate::registry::RegistryError;
use crate::stage::{PipelineStageKind, RunState, StageEvent};

/// Failures while building a scheduler. Fatal to that scheduler only.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid project: {0}")]
    Project(#[from] ProjectError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("cache error: {0}")]
    Store(#[from] StoreError),

    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    #[error("failed to provision project directories: {0}")]
    Io(#[from] std::io::Error),
}

/// Produced versus expected count for one stage item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub produced: u64,
    /// Unknown until the upstream population can be measured.
    pub expected: Option<u64>,
    /// Not clamped: a stale estimate may briefly read above 100.
    pub percent: Option<f64>,
}

impl StageProgress {
    pub fn new(produced: u64, expected: Option<u64>) -> Self {
        let percent = match expected {
            Some(expected) if expected > 0 => Some(produced as f64 * 100.0 / expected as f64),
            _ => None,
        };
        Self {
            produced,
            expected,
            percent,
        }
    }

    /// True once an estimate exists and production has reached it.
    pub fn is_complete(&self) -> bool {
        matches!(self.expected, Some(expected) if self.produced >= expected)
    }
}

/// Queued and running worker tasks of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageWorkers {
    pub stage: PipelineStageKind,
    pub queued: usize,
    pub active: usize,
}

/// Progress of one plugin pipeline within a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginProgress {
    pub plugin: String,
    /// Keyed by download data name.
    pub download: BTreeMap<String, StageProgress>,
    pub process: StageProgress,
    pub index: StageProgress,
    /// Keyed by summary id.
    pub summary: BTreeMap<String, StageProgress>,
    pub workers: Vec<StageWorkers>,
}

impl PluginProgress {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            download: BTreeMap::new(),
            process: StageProgress::new(0, None),
            index: StageProgress::new(0, None),
            summary: BTreeMap::new(),
            workers: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.download.values().all(StageProgress::is_complete)
            && self.process.is_complete()
            && self.index.is_complete()
            && self.summary.values().all(StageProgress::is_complete)
    }
}

/// Immutable snapshot of one scheduler handed to UI observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub id: u32,
    pub project_name: String,
    pub state: RunState,
    pub plugins: Vec<PluginProgress>,
    pub up_to_date: bool,
    /// Most recent log lines, oldest first.
    pub log: Vec<String>,
    pub last_update: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SchedulerStatus {
    pub fn plugin(&self, name: &str) -> Option<&PluginProgress> {
        self.plugins.iter().find(|p| p.plugin == name)
    }
}

/// Something that changed a scheduler's status.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A worker task finished.
    Stage(StageEvent),
    /// One of the scheduler's caches was written.
    Cache(CacheScope),
    /// Lifecycle transition or periodic update.
    Lifecycle,
}
