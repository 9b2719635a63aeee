//! Download collaborator contracts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{DateKey, StoreError};

/// Shared downloaders poll once a day unless configured otherwise.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Download errors.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("listing failed: {0}")]
    Listing(String),

    #[error("download of '{name}' failed: {message}")]
    Transfer { name: String, message: String },

    #[error("invalid download source: {0}")]
    InvalidSource(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cache error: {0}")]
    Store(#[from] StoreError),

    #[error("downloader is shut down")]
    ShutDown,

    #[error("poll of '{0}' panicked")]
    Panicked(String),
}

/// Identity of an upstream data source. Projects drawing from the same
/// source share one downloader.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote file announced by a lister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileRef {
    /// File name used locally.
    pub name: String,
    /// URL or path the downloader fetches from.
    pub location: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl RemoteFileRef {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            size: None,
        }
    }
}

/// Enumerates what the upstream source currently offers.
#[async_trait]
pub trait DownloadSourceLister: Send + Sync {
    async fn list_available(&self) -> Result<BTreeMap<DateKey, Vec<RemoteFileRef>>, DownloadError>;
}

/// Fetches one remote file into `dest_dir`.
#[async_trait]
pub trait FileDownloader: Send + Sync {
    async fn download(
        &self,
        date: DateKey,
        remote: &RemoteFileRef,
        dest_dir: &Path,
    ) -> Result<PathBuf, DownloadError>;
}

/// Builds the collaborators of one upstream source.
pub trait DownloadFactory: Send + Sync {
    /// Sources with equal ids are shared between projects.
    fn source_id(&self) -> SourceId;

    /// Data name recorded for downloaded files ("data", "qc", ...).
    fn data_name(&self) -> &str;

    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    fn create_lister(&self) -> Result<Arc<dyn DownloadSourceLister>, DownloadError>;

    fn create_downloader(&self) -> Result<Arc<dyn FileDownloader>, DownloadError>;
}
