use std::sync::Arc;
use std::time::Duration;

use crate::config::{DownloadKind, DownloadSourceConfig};
use crate::download::{
    DownloadError, DownloadFactory, DownloadSourceLister, FileDownloader, SourceId,
    DEFAULT_POLL_INTERVAL,
};

use super::downloaders::{HttpFileDownloader, LocalCopyDownloader};
use super::listers::{DatePatternLister, LocalDirectoryLister};

const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Builds collaborators for one configured download source.
pub struct SourceDownloadFactory {
    source_id: SourceId,
    config: DownloadSourceConfig,
    step_days: u32,
}

impl SourceDownloadFactory {
    pub fn new(plugin: &str, config: DownloadSourceConfig) -> Self {
        Self {
            source_id: SourceId::new(config.source_id(plugin)),
            config,
            step_days: 1,
        }
    }

    /// Days between two upstream inputs, for date-pattern sources.
    pub fn with_step_days(mut self, days: u32) -> Self {
        self.step_days = days;
        self
    }

    fn missing(&self, field: &str) -> DownloadError {
        DownloadError::InvalidSource(format!("source '{}' has no {}", self.source_id, field))
    }
}

impl DownloadFactory for SourceDownloadFactory {
    fn source_id(&self) -> SourceId {
        self.source_id.clone()
    }

    fn data_name(&self) -> &str {
        &self.config.data_name
    }

    fn poll_interval(&self) -> Duration {
        self.config
            .poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    fn create_lister(&self) -> Result<Arc<dyn DownloadSourceLister>, DownloadError> {
        match self.config.kind {
            DownloadKind::Http => {
                let url = self
                    .config
                    .url_template
                    .clone()
                    .ok_or_else(|| self.missing("url_template"))?;
                let origin = self.config.origin_date.ok_or_else(|| self.missing("origin_date"))?;
                Ok(Arc::new(DatePatternLister::new(
                    url,
                    self.config.file_template.clone(),
                    origin,
                )
                .with_step(self.step_days)) as Arc<dyn DownloadSourceLister>)
            }
            DownloadKind::Local => {
                let directory = self
                    .config
                    .directory
                    .clone()
                    .ok_or_else(|| self.missing("directory"))?;
                let pattern = self
                    .config
                    .pattern
                    .as_deref()
                    .ok_or_else(|| self.missing("pattern"))?;
                Ok(Arc::new(LocalDirectoryLister::new(directory, pattern)?) as Arc<dyn DownloadSourceLister>)
            }
        }
    }

    fn create_downloader(&self) -> Result<Arc<dyn FileDownloader>, DownloadError> {
        match self.config.kind {
            DownloadKind::Http => Ok(Arc::new(HttpFileDownloader::new(HTTP_TIMEOUT)?) as Arc<dyn FileDownloader>),
            DownloadKind::Local => Ok(Arc::new(LocalCopyDownloader) as Arc<dyn FileDownloader>),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(kind: DownloadKind) -> DownloadSourceConfig {
        DownloadSourceConfig {
            data_name: "qc".to_string(),
            kind,
            source_id: None,
            url_template: None,
            file_template: None,
            origin_date: None,
            directory: None,
            pattern: None,
            poll_interval_secs: Some(60),
        }
    }

    #[test]
    fn test_identity_and_interval() {
        let factory = SourceDownloadFactory::new("modis", source(DownloadKind::Local));
        assert_eq!(factory.source_id(), SourceId::new("modis:qc"));
        assert_eq!(factory.data_name(), "qc");
        assert_eq!(factory.poll_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_explicit_source_id_is_shared() {
        let mut config = source(DownloadKind::Http);
        config.source_id = Some("lpdaac:mod13".to_string());
        let a = SourceDownloadFactory::new("modis", config.clone());
        let b = SourceDownloadFactory::new("modis_v2", config);
        assert_eq!(a.source_id(), b.source_id());
    }

    #[test]
    fn test_incomplete_source_cannot_build_lister() {
        let factory = SourceDownloadFactory::new("modis", source(DownloadKind::Http));
        assert!(matches!(
            factory.create_lister(),
            Err(DownloadError::InvalidSource(_))
        ));
    }
}
