use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::cache::DateKey;
use crate::download::{DownloadError, FileDownloader, RemoteFileRef};

/// Fetches files over HTTP into a temporary file, renamed into place once
/// the body has been fully written.
pub struct HttpFileDownloader {
    client: Client,
}

impl HttpFileDownloader {
    pub fn new(timeout: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FileDownloader for HttpFileDownloader {
    async fn download(
        &self,
        date: DateKey,
        remote: &RemoteFileRef,
        dest_dir: &Path,
    ) -> Result<PathBuf, DownloadError> {
        debug!(%date, url = %remote.location, "Downloading");

        let mut response = self.client.get(&remote.location).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Transfer {
                name: remote.name.clone(),
                message: format!("HTTP {}", response.status()),
            });
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(&remote.name);
        let partial = dest_dir.join(format!("{}.part", remote.name));

        let mut file = tokio::fs::File::create(&partial).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, &path).await?;
        Ok(path)
    }
}

/// Copies files from a local path.
#[derive(Debug, Default)]
pub struct LocalCopyDownloader;

#[async_trait]
impl FileDownloader for LocalCopyDownloader {
    async fn download(
        &self,
        _date: DateKey,
        remote: &RemoteFileRef,
        dest_dir: &Path,
    ) -> Result<PathBuf, DownloadError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(&remote.name);
        tokio::fs::copy(&remote.location, &path)
            .await
            .map_err(|e| DownloadError::Transfer {
                name: remote.name.clone(),
                message: e.to_string(),
            })?;
        Ok(path)
    }
}
