//! Cache record types.

use std::fmt;
use std::path::PathBuf;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::stage::PipelineStageKind;

/// Work-unit key: one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateKey {
    pub year: i32,
    pub day_of_year: u32,
}

impl DateKey {
    pub fn new(year: i32, day_of_year: u32) -> Self {
        Self { year, day_of_year }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            day_of_year: date.ordinal(),
        }
    }

    /// Calendar date, or `None` if the day does not exist in that year.
    pub fn to_date(self) -> Option<NaiveDate> {
        NaiveDate::from_yo_opt(self.year, self.day_of_year)
    }

    /// Sortable integer form used by the persistence layer.
    pub fn ordinal(self) -> i64 {
        self.year as i64 * 1000 + self.day_of_year as i64
    }

    pub fn from_ordinal(value: i64) -> Self {
        Self {
            year: (value / 1000) as i32,
            day_of_year: (value % 1000) as u32,
        }
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:03}", self.year, self.day_of_year)
    }
}

/// One produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFileRecord {
    pub data_name: String,
    pub path: PathBuf,
    pub date: DateKey,
    pub stage: PipelineStageKind,
}

impl CachedFileRecord {
    pub fn new(
        data_name: impl Into<String>,
        path: impl Into<PathBuf>,
        date: DateKey,
        stage: PipelineStageKind,
    ) -> Self {
        Self {
            data_name: data_name.into(),
            path: path.into(),
            date,
            stage,
        }
    }
}

/// A stored record with its insertion sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub seq: i64,
    pub record: CachedFileRecord,
}

/// Identifies the rows one cache owns inside the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheScope {
    pub namespace: String,
    pub stage: PipelineStageKind,
}

impl CacheScope {
    /// Output cache of one stage of a project's plugin pipeline.
    pub fn project(project: &str, plugin: &str, stage: PipelineStageKind) -> Self {
        Self {
            namespace: format!("project/{}/{}", project, plugin),
            stage,
        }
    }

    /// Cache owned by a shared downloader.
    pub fn shared(source: &str) -> Self {
        Self {
            namespace: format!("shared/{}", source),
            stage: PipelineStageKind::Download,
        }
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.stage.as_str())
    }
}

/// What an observer is told when a cache signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    /// A `cache_files` call completed.
    Written { submitted: usize, changed: usize },
    /// Re-scan for produced but unconsumed work.
    CatchUp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_key_roundtrips_through_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let key = DateKey::from_date(date);
        assert_eq!(key, DateKey::new(2024, 61));
        assert_eq!(key.to_date(), Some(date));
        assert_eq!(DateKey::new(2023, 366).to_date(), None);
    }

    #[test]
    fn test_date_key_ordering() {
        assert!(DateKey::new(2023, 365) < DateKey::new(2024, 1));
        assert!(DateKey::new(2024, 2) > DateKey::new(2024, 1));
        assert_eq!(DateKey::from_ordinal(DateKey::new(2024, 45).ordinal()), DateKey::new(2024, 45));
        assert_eq!(DateKey::new(2024, 7).to_string(), "2024-007");
    }

    #[test]
    fn test_scope_namespaces() {
        let scope = CacheScope::project("p", "modis", PipelineStageKind::Process);
        assert_eq!(scope.to_string(), "project/p/modis/processor");
        let shared = CacheScope::shared("modis:data");
        assert_eq!(shared.stage, PipelineStageKind::Download);
        assert_eq!(shared.namespace, "shared/modis:data");
    }
}
