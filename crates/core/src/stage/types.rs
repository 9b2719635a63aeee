//! Stage kinds, run states and per-unit context.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::cache::{CachedFileRecord, DateKey};
use crate::project::SummaryDefinition;

/// The four pipeline stages, in data-flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStageKind {
    Download,
    Process,
    Index,
    Summarize,
}

impl PipelineStageKind {
    pub const ALL: [PipelineStageKind; 4] = [
        PipelineStageKind::Download,
        PipelineStageKind::Process,
        PipelineStageKind::Index,
        PipelineStageKind::Summarize,
    ];

    /// Directory and storage name of the stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Process => "processor",
            Self::Index => "indices",
            Self::Summarize => "summary",
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Download => Some(Self::Process),
            Self::Process => Some(Self::Index),
            Self::Index => Some(Self::Summarize),
            Self::Summarize => None,
        }
    }

    pub fn previous(&self) -> Option<Self> {
        match self {
            Self::Download => None,
            Self::Process => Some(Self::Download),
            Self::Index => Some(Self::Process),
            Self::Summarize => Some(Self::Index),
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for PipelineStageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state shared by schedulers, stages and downloaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Stopped,
    Starting,
    Running,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Atomic [`RunState`] with the legal transitions only.
///
/// A retired cell never accepts work again, whatever its state.
#[derive(Debug)]
pub struct RunStateCell {
    state: AtomicU8,
    retired: AtomicBool,
}

impl Default for RunStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Stopped as u8),
            retired: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Stopped -> Starting. Returns false if the cell was not stopped.
    pub fn begin_start(&self) -> bool {
        !self.is_retired()
            && self
                .state
                .compare_exchange(
                    RunState::Stopped as u8,
                    RunState::Starting as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
    }

    /// Starting -> Running.
    pub fn finish_start(&self) -> bool {
        self.state
            .compare_exchange(
                RunState::Starting as u8,
                RunState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Any state -> Stopped. Returns the previous state.
    pub fn stop(&self) -> RunState {
        RunState::from_u8(self.state.swap(RunState::Stopped as u8, Ordering::SeqCst))
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.stop();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Workers only run while Starting or Running.
    pub fn accepts_work(&self) -> bool {
        !self.is_retired() && matches!(self.get(), RunState::Starting | RunState::Running)
    }
}

/// Everything a collaborator needs to process one work unit.
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub project: String,
    pub plugin: String,
    pub stage: PipelineStageKind,
    pub implementation: String,
    pub date: DateKey,
    /// `<workingDir>/<project>/<plugin>/<stage>/<year>/<dayOfYear>`
    pub output_dir: PathBuf,
    /// Indices configured for the project's plugin.
    pub indices: Vec<String>,
    /// Set for summary units.
    pub summary: Option<SummaryDefinition>,
}

impl UnitContext {
    /// Date the unit's outputs are filed under. Temporal summaries file
    /// every day of a composite under the composite's first day.
    pub fn output_date(&self) -> DateKey {
        match (&self.summary, self.date.to_date()) {
            (Some(SummaryDefinition { temporal: Some(strategy), .. }), Some(date)) => {
                DateKey::from_date(strategy.composite_start(date))
            }
            _ => self.date,
        }
    }

    /// Build an output record for this unit.
    pub fn output_record(
        &self,
        data_name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> CachedFileRecord {
        CachedFileRecord::new(data_name, path, self.output_date(), self.stage)
    }
}

/// Progress report from one finished worker task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    pub stage: PipelineStageKind,
    pub plugin: String,
    pub implementation: String,
    pub date: DateKey,
    pub produced: usize,
    pub success: bool,
    pub message: Option<String>,
}
