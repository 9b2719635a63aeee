//! Expected-count bookkeeping behind the progress percentages.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::types::StageProgress;
use crate::cache::{ExpectedKey, PersistenceStore, StoreError};
use crate::stage::PipelineStageKind;

/// Lazily computed expected totals for one project plugin.
///
/// An estimate is reused until the produced count exceeds it or the stage is
/// invalidated, then recomputed. Fresh estimates are persisted so a restart
/// can report progress before the upstream listing is available again.
pub struct ProgressTracker {
    project: String,
    plugin: String,
    store: Arc<dyn PersistenceStore>,
    memo: Mutex<HashMap<(PipelineStageKind, String), u64>>,
}

impl ProgressTracker {
    pub fn new(project: &str, plugin: &str, store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            project: project.to_string(),
            plugin: plugin.to_string(),
            store,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Expected total for `item` of `stage`, given the current produced count.
    ///
    /// `compute` returns `None` when the estimate cannot be measured right
    /// now; the last persisted value is used instead.
    pub fn expected<F>(
        &self,
        stage: PipelineStageKind,
        item: &str,
        produced: u64,
        compute: F,
    ) -> Result<Option<u64>, StoreError>
    where
        F: FnOnce() -> Result<Option<u64>, StoreError>,
    {
        let memo_key = (stage, item.to_string());
        if let Some(&cached) = self.memo.lock().get(&memo_key) {
            if produced <= cached {
                return Ok(Some(cached));
            }
        }

        let key = ExpectedKey::new(&self.project, &self.plugin, stage, item);
        let expected = match compute()? {
            Some(value) => {
                self.store.set_expected_count(&key, value)?;
                Some(value)
            }
            None => self.store.expected_count(&key)?,
        };

        if let Some(value) = expected {
            if produced > value {
                warn!(
                    project = %self.project,
                    plugin = %self.plugin,
                    %stage,
                    item,
                    produced,
                    expected = value,
                    "Produced count exceeds expected count"
                );
            } else {
                debug!(
                    project = %self.project,
                    plugin = %self.plugin,
                    %stage,
                    item,
                    expected = value,
                    "Recomputed expected count"
                );
            }
            self.memo.lock().insert(memo_key, value);
        }
        Ok(expected)
    }

    pub fn progress<F>(
        &self,
        stage: PipelineStageKind,
        item: &str,
        produced: u64,
        compute: F,
    ) -> Result<StageProgress, StoreError>
    where
        F: FnOnce() -> Result<Option<u64>, StoreError>,
    {
        let expected = self.expected(stage, item, produced, compute)?;
        Ok(StageProgress::new(produced, expected))
    }

    /// Drop cached estimates of `stage` and every stage after it.
    pub fn invalidate_from(&self, stage: PipelineStageKind) {
        self.memo.lock().retain(|(kind, _), _| *kind < stage);
    }

    pub fn invalidate_all(&self) {
        self.memo.lock().clear();
    }
}
