//! UI observers of scheduler status.

use crate::scheduler::SchedulerStatus;

/// Receives status snapshots from the processing loop. Must not block long.
pub trait UiObserver: Send + Sync {
    /// Every status that changed during one processing-loop pass.
    fn on_status_changed(&self, statuses: &[SchedulerStatus]);
}

/// Handle returned by [`super::Orchestrator::register_ui_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);
