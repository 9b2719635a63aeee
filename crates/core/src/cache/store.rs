//! Persistence contract backing every incremental cache.

use thiserror::Error;

use super::types::{CacheEntry, CacheScope, CachedFileRecord, DateKey};
use crate::stage::PipelineStageKind;

/// Error type for persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// A record was written to a cache of another stage.
    #[error("record '{data_name}' tagged {actual} written to {expected} cache")]
    StageMismatch {
        data_name: String,
        expected: String,
        actual: String,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Filter for querying cached records within one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    /// Exact data name.
    pub data_name: Option<String>,
    /// Data name prefix.
    pub data_name_prefix: Option<String>,
    /// Earliest date, inclusive.
    pub from: Option<DateKey>,
    /// Latest date, inclusive.
    pub to: Option<DateKey>,
    /// Only rows inserted or changed after this sequence number.
    pub after_seq: Option<i64>,
    /// Only rows the downstream stage has not consumed yet.
    pub unprocessed_only: bool,
}

impl RecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_name(mut self, data_name: impl Into<String>) -> Self {
        self.data_name = Some(data_name.into());
        self
    }

    pub fn with_data_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.data_name_prefix = Some(prefix.into());
        self
    }

    pub fn with_from(mut self, from: DateKey) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_to(mut self, to: DateKey) -> Self {
        self.to = Some(to);
        self
    }

    /// Restrict to a single date.
    pub fn on(self, date: DateKey) -> Self {
        self.with_from(date).with_to(date)
    }

    pub fn with_after_seq(mut self, seq: i64) -> Self {
        self.after_seq = Some(seq);
        self
    }

    pub fn unprocessed(mut self) -> Self {
        self.unprocessed_only = true;
        self
    }
}

/// Key of one persisted expected-count estimate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpectedKey {
    pub project: String,
    pub plugin: String,
    pub stage: PipelineStageKind,
    /// Data name, summary id, or empty when the stage has a single total.
    pub item: String,
}

impl ExpectedKey {
    pub fn new(project: &str, plugin: &str, stage: PipelineStageKind, item: &str) -> Self {
        Self {
            project: project.to_string(),
            plugin: plugin.to_string(),
            stage,
            item: item.to_string(),
        }
    }
}

/// Durable storage for cache rows and progress bookkeeping.
///
/// Implementations must make `upsert_records` idempotent per
/// (data name, year, day of year, stage) within a scope.
pub trait PersistenceStore: Send + Sync {
    /// Insert or update records. Returns the number of rows that changed.
    fn upsert_records(
        &self,
        scope: &CacheScope,
        records: &[CachedFileRecord],
    ) -> Result<usize, StoreError>;

    /// List records matching the query, ordered by sequence number.
    fn query_records(
        &self,
        scope: &CacheScope,
        query: &RecordQuery,
    ) -> Result<Vec<CacheEntry>, StoreError>;

    /// Mark the records of `date` with sequence number up to `up_to_seq` as consumed.
    fn mark_processed(
        &self,
        scope: &CacheScope,
        date: DateKey,
        up_to_seq: i64,
    ) -> Result<usize, StoreError>;

    /// Count records matching the query.
    fn count_records(&self, scope: &CacheScope, query: &RecordQuery) -> Result<u64, StoreError>;

    /// Count distinct dates among records matching the query.
    fn count_dates(&self, scope: &CacheScope, query: &RecordQuery) -> Result<u64, StoreError>;

    /// Earliest and latest cached dates.
    fn date_span(&self, scope: &CacheScope) -> Result<Option<(DateKey, DateKey)>, StoreError>;

    /// Read a persisted expected-count estimate.
    fn expected_count(&self, key: &ExpectedKey) -> Result<Option<u64>, StoreError>;

    /// Persist an expected-count estimate.
    fn set_expected_count(&self, key: &ExpectedKey, value: u64) -> Result<(), StoreError>;
}
