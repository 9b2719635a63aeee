//! Project identity types.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::temporal::CompositionStrategy;
use crate::cache::DateKey;

/// Errors raised while validating a project descriptor.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("invalid project descriptor: {0}")]
    Invalid(String),
}

/// Immutable identity of one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    pub name: String,
    pub working_dir: PathBuf,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    pub plugins: Vec<ProjectPlugin>,
    #[serde(default)]
    pub summaries: Vec<SummaryDefinition>,
}

/// A plugin enabled for a project, with the indices it should compute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectPlugin {
    pub name: String,
    #[serde(default)]
    pub indices: Vec<String>,
}

/// A summary computed over every index of every plugin in the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryDefinition {
    pub id: String,
    /// Temporal composition applied before zonal statistics, if any.
    #[serde(default)]
    pub temporal: Option<CompositionStrategy>,
    #[serde(default)]
    pub zone_field: Option<String>,
    #[serde(default)]
    pub shapefile: Option<PathBuf>,
}

impl SummaryDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            temporal: None,
            zone_field: None,
            shapefile: None,
        }
    }

    pub fn with_temporal(mut self, strategy: CompositionStrategy) -> Self {
        self.temporal = Some(strategy);
        self
    }

    /// Data name of the record this summary produces for `index`.
    pub fn output_data_name(&self, index: &str) -> String {
        format!("{}:{}", self.id, index)
    }

    /// Prefix shared by every record this summary produces.
    pub fn output_prefix(&self) -> String {
        format!("{}:", self.id)
    }
}

/// Inclusive range of dates a project covers. An open end means "up to now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateKey,
    pub end: Option<DateKey>,
}

impl DateRange {
    pub fn contains(&self, date: DateKey) -> bool {
        date >= self.start && self.end.map_or(true, |end| date <= end)
    }
}

impl ProjectDescriptor {
    pub fn new(name: impl Into<String>, working_dir: impl Into<PathBuf>, start_date: NaiveDate) -> Self {
        Self {
            name: name.into(),
            working_dir: working_dir.into(),
            start_date,
            end_date: None,
            plugins: Vec::new(),
            summaries: Vec::new(),
        }
    }

    pub fn with_end_date(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn with_plugin<I, S>(mut self, name: impl Into<String>, indices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins.push(ProjectPlugin {
            name: name.into(),
            indices: indices.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_summary(mut self, summary: SummaryDefinition) -> Self {
        self.summaries.push(summary);
        self
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name.clone()).collect()
    }

    pub fn date_range(&self) -> DateRange {
        DateRange {
            start: DateKey::from_date(self.start_date),
            end: self.end_date.map(DateKey::from_date),
        }
    }

    /// Check the structural rules every descriptor must satisfy.
    pub fn validate(&self) -> Result<(), ProjectError> {
        if self.name.trim().is_empty() {
            return Err(ProjectError::Invalid("project name is empty".to_string()));
        }
        if self.plugins.is_empty() {
            return Err(ProjectError::Invalid(format!(
                "project '{}' has no plugins",
                self.name
            )));
        }
        if let Some(end) = self.end_date {
            if end < self.start_date {
                return Err(ProjectError::Invalid(format!(
                    "project '{}' ends ({}) before it starts ({})",
                    self.name, end, self.start_date
                )));
            }
        }

        let mut plugins = HashSet::new();
        for plugin in &self.plugins {
            if !plugins.insert(plugin.name.as_str()) {
                return Err(ProjectError::Invalid(format!(
                    "plugin '{}' listed twice in project '{}'",
                    plugin.name, self.name
                )));
            }
        }

        let mut summaries = HashSet::new();
        for summary in &self.summaries {
            if !summaries.insert(summary.id.as_str()) {
                return Err(ProjectError::Invalid(format!(
                    "duplicate summary id '{}' in project '{}'",
                    summary.id, self.name
                )));
            }
        }

        Ok(())
    }
}
