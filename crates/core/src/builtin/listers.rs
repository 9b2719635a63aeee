use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{Datelike, NaiveDate, Utc};
use regex_lite::Regex;
use tracing::debug;

use super::template::render_date;
use crate::cache::DateKey;
use crate::download::{DownloadError, DownloadSourceLister, RemoteFileRef};

/// Lists one file per input period from `origin` through today, at URLs
/// built from a date template. Periods the upstream never published fail at
/// download time and are retried on later polls.
pub struct DatePatternLister {
    url_template: String,
    file_template: Option<String>,
    origin: NaiveDate,
    step_days: u32,
}

impl DatePatternLister {
    pub fn new(url_template: impl Into<String>, file_template: Option<String>, origin: NaiveDate) -> Self {
        Self {
            url_template: url_template.into(),
            file_template,
            origin,
            step_days: 1,
        }
    }

    /// One input every `days`, counted from January 1st of each year.
    pub fn with_step(mut self, days: u32) -> Self {
        self.step_days = days.max(1);
        self
    }

    /// Listing for every input period starting in `origin..=last`.
    pub fn list_through(&self, last: NaiveDate) -> BTreeMap<DateKey, Vec<RemoteFileRef>> {
        self.origin
            .iter_days()
            .take_while(|day| *day <= last)
            .filter(|day| day.ordinal0() % self.step_days == 0)
            .map(|day| {
                let date = DateKey::from_date(day);
                let url = render_date(&self.url_template, date);
                let name = match &self.file_template {
                    Some(template) => render_date(template, date),
                    None => file_name_of(&url),
                };
                (date, vec![RemoteFileRef::new(name, url)])
            })
            .collect()
    }
}

fn file_name_of(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}

#[async_trait]
impl DownloadSourceLister for DatePatternLister {
    async fn list_available(&self) -> Result<BTreeMap<DateKey, Vec<RemoteFileRef>>, DownloadError> {
        Ok(self.list_through(Utc::now().date_naive()))
    }
}

/// Lists files in a directory whose names match a pattern with date groups.
///
/// The pattern must capture `year` plus either `doy` or `month` and `day`.
pub struct LocalDirectoryLister {
    directory: PathBuf,
    pattern: Regex,
}

impl LocalDirectoryLister {
    pub fn new(directory: impl Into<PathBuf>, pattern: &str) -> Result<Self, DownloadError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| DownloadError::InvalidSource(format!("bad pattern '{}': {}", pattern, e)))?;
        let names: Vec<&str> = pattern.capture_names().flatten().collect();
        let has_doy = names.contains(&"doy");
        let has_md = names.contains(&"month") && names.contains(&"day");
        if !names.contains(&"year") || !(has_doy || has_md) {
            return Err(DownloadError::InvalidSource(
                "pattern needs a 'year' group and either 'doy' or 'month' and 'day'".to_string(),
            ));
        }
        Ok(Self {
            directory: directory.into(),
            pattern,
        })
    }

    fn date_of(&self, file_name: &str) -> Option<DateKey> {
        let caps = self.pattern.captures(file_name)?;
        let year: i32 = caps.name("year")?.as_str().parse().ok()?;
        if let Some(doy) = caps.name("doy") {
            let doy: u32 = doy.as_str().parse().ok()?;
            return NaiveDate::from_yo_opt(year, doy).map(DateKey::from_date);
        }
        let month: u32 = caps.name("month")?.as_str().parse().ok()?;
        let day: u32 = caps.name("day")?.as_str().parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day).map(DateKey::from_date)
    }
}

#[async_trait]
impl DownloadSourceLister for LocalDirectoryLister {
    async fn list_available(&self) -> Result<BTreeMap<DateKey, Vec<RemoteFileRef>>, DownloadError> {
        let mut entries = tokio::fs::read_dir(&self.directory).await.map_err(|e| {
            DownloadError::Listing(format!("cannot read {}: {}", self.directory.display(), e))
        })?;

        let mut listing: BTreeMap<DateKey, Vec<RemoteFileRef>> = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.date_of(&name) {
                Some(date) => {
                    let location = entry.path().to_string_lossy().into_owned();
                    listing
                        .entry(date)
                        .or_default()
                        .push(RemoteFileRef::new(name, location));
                }
                None => debug!(file = %name, "Ignoring file without a date"),
            }
        }
        for files in listing.values_mut() {
            files.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Ok(listing)
    }
}
