//! Latest status snapshot of every live scheduler.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::{Mutex, RwLock};

use super::types::SchedulerStatus;

/// Read-mostly map of scheduler snapshots plus the set of IDs whose
/// snapshot changed since the orchestrator last fanned them out.
#[derive(Debug, Default)]
pub struct StatusBoard {
    statuses: RwLock<BTreeMap<u32, SchedulerStatus>>,
    changed: Mutex<BTreeSet<u32>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, status: SchedulerStatus) {
        let id = status.id;
        self.statuses.write().insert(id, status);
        self.changed.lock().insert(id);
    }

    pub fn remove(&self, id: u32) -> Option<SchedulerStatus> {
        self.changed.lock().remove(&id);
        self.statuses.write().remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<SchedulerStatus> {
        self.statuses.read().get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<SchedulerStatus> {
        self.statuses
            .read()
            .values()
            .find(|s| s.project_name == name)
            .cloned()
    }

    /// Every snapshot, ordered by scheduler ID.
    pub fn all(&self) -> Vec<SchedulerStatus> {
        self.statuses.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.statuses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.read().is_empty()
    }

    /// Snapshots changed since the last call.
    pub fn take_changed(&self) -> Vec<SchedulerStatus> {
        let ids = std::mem::take(&mut *self.changed.lock());
        let statuses = self.statuses.read();
        ids.iter().filter_map(|id| statuses.get(id).cloned()).collect()
    }
}
