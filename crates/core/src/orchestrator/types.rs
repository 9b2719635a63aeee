//! Types for the orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::project::ProjectDescriptor;
use crate::stage::PoolStatus;

/// Identifier of a live scheduler or shared downloader. Freed IDs are reused.
pub type ResourceId = u32;

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// `close` has been called.
    #[error("orchestrator is closed")]
    Closed,

    /// `start` was called outside a tokio runtime.
    #[error("no async runtime available: {0}")]
    NoRuntime(String),
}

/// Addresses a scheduler by ID or by project name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerRef {
    Id(ResourceId),
    Name(String),
}

impl From<ResourceId> for SchedulerRef {
    fn from(id: ResourceId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for SchedulerRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for SchedulerRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl fmt::Display for SchedulerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{}", id),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// A structural change waiting for the next processing-loop pass.
#[derive(Debug, Clone)]
pub enum PendingRequest {
    Create(ProjectDescriptor),
    Stop(SchedulerRef),
    Start(SchedulerRef),
    Delete(SchedulerRef),
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// Pools exist.
    pub started: bool,
    pub closed: bool,
    pub schedulers: usize,
    pub shared_downloaders: usize,
    /// Requests not yet handled by a pass.
    pub pending_requests: usize,
    pub workers: Option<PoolStatus>,
    pub downloads: Option<PoolStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_ref_conversions() {
        assert_eq!(SchedulerRef::from(3), SchedulerRef::Id(3));
        assert_eq!(SchedulerRef::from("amhara"), SchedulerRef::Name("amhara".to_string()));
        assert_eq!(SchedulerRef::Id(3).to_string(), "#3");
        assert_eq!(SchedulerRef::from("amhara").to_string(), "amhara");
    }

    #[test]
    fn test_orchestrator_status_default() {
        let status = OrchestratorStatus::default();
        assert!(!status.started);
        assert_eq!(status.schedulers, 0);
        assert!(status.workers.is_none());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(OrchestratorError::Closed.to_string(), "orchestrator is closed");
    }
}
