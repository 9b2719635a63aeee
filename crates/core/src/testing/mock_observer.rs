//! Recording UI observer for testing.

use parking_lot::Mutex;

use crate::orchestrator::UiObserver;
use crate::scheduler::SchedulerStatus;

/// Records every status batch it receives.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    batches: Mutex<Vec<Vec<SchedulerStatus>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn last_batch(&self) -> Option<Vec<SchedulerStatus>> {
        self.batches.lock().last().cloned()
    }

    /// Most recent status seen for `project`, across all batches.
    pub fn latest_for(&self, project: &str) -> Option<SchedulerStatus> {
        self.batches
            .lock()
            .iter()
            .rev()
            .flat_map(|batch| batch.iter())
            .find(|status| status.project_name == project)
            .cloned()
    }
}

impl UiObserver for RecordingObserver {
    fn on_status_changed(&self, statuses: &[SchedulerStatus]) {
        self.batches.lock().push(statuses.to_vec());
    }
}
