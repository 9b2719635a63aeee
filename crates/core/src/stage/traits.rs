//! Collaborator contracts for stage work.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{StageEvent, UnitContext};
use crate::cache::CachedFileRecord;

/// Errors a unit-of-work collaborator can report.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("missing input '{0}'")]
    MissingInput(String),

    #[error("command '{program}' failed: {message}")]
    Command { program: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

/// One implementation of a Process, Index or Summarize unit of work.
///
/// Must be safe to run concurrently for different units, and idempotent
/// when re-run for the same unit.
#[async_trait]
pub trait StageUnitProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        inputs: &[CachedFileRecord],
        ctx: &UnitContext,
    ) -> Result<Vec<CachedFileRecord>, StageError>;
}

/// Receives a report for every finished worker task.
pub trait StageEventSink: Send + Sync {
    fn on_stage_event(&self, event: StageEvent);
}
