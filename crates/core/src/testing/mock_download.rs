//! Mock download source for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::DateKey;
use crate::download::{
    DownloadError, DownloadFactory, DownloadSourceLister, FileDownloader, RemoteFileRef, SourceId,
    DEFAULT_POLL_INTERVAL,
};

/// Mock lister announcing a configurable set of dates.
#[derive(Debug, Default)]
pub struct MockLister {
    available: Mutex<BTreeMap<DateKey, Vec<RemoteFileRef>>>,
    fail: AtomicBool,
    panic_next: AtomicBool,
    calls: AtomicUsize,
}

impl MockLister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce one file per day of `year` in `days`, replacing the listing.
    pub fn set_days(&self, year: i32, days: RangeInclusive<u32>) {
        let mut available = self.available.lock();
        available.clear();
        for day in days {
            let date = DateKey::new(year, day);
            let name = format!("{}{:03}.hdf", year, day);
            let location = format!("mock://{}/{}", year, name);
            available.insert(date, vec![RemoteFileRef::new(name, location)]);
        }
    }

    /// Announce `files` for `date`, keeping the rest of the listing.
    pub fn set_files(&self, date: DateKey, files: Vec<RemoteFileRef>) {
        self.available.lock().insert(date, files);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Panic on the next listing only.
    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownloadSourceLister for MockLister {
    async fn list_available(&self) -> Result<BTreeMap<DateKey, Vec<RemoteFileRef>>, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("mock listing panic");
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(DownloadError::Listing("mock listing failure".to_string()));
        }
        Ok(self.available.lock().clone())
    }
}

/// Mock downloader writing a small placeholder file per remote file.
#[derive(Debug, Default)]
pub struct MockDownloader {
    failing: Mutex<HashSet<DateKey>>,
    downloads: AtomicUsize,
}

impl MockDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every download for `date` until cleared.
    pub fn fail_on(&self, date: DateKey) {
        self.failing.lock().insert(date);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Number of successful downloads.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileDownloader for MockDownloader {
    async fn download(
        &self,
        date: DateKey,
        remote: &RemoteFileRef,
        dest_dir: &Path,
    ) -> Result<PathBuf, DownloadError> {
        if self.failing.lock().contains(&date) {
            return Err(DownloadError::Transfer {
                name: remote.name.clone(),
                message: "mock transfer failure".to_string(),
            });
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(&remote.name);
        tokio::fs::write(&path, remote.location.as_bytes()).await?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(path)
    }
}

/// Mock factory handing out shared handles to its lister and downloader,
/// so tests can steer a source after the orchestrator picked it up.
pub struct MockDownloadFactory {
    source_id: String,
    data_name: String,
    poll_interval: Duration,
    pub lister: Arc<MockLister>,
    pub downloader: Arc<MockDownloader>,
}

impl MockDownloadFactory {
    pub fn new(source_id: &str, data_name: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            data_name: data_name.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lister: Arc::new(MockLister::new()),
            downloader: Arc::new(MockDownloader::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl DownloadFactory for MockDownloadFactory {
    fn source_id(&self) -> SourceId {
        SourceId::new(&self.source_id)
    }

    fn data_name(&self) -> &str {
        &self.data_name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn create_lister(&self) -> Result<Arc<dyn DownloadSourceLister>, DownloadError> {
        Ok(self.lister.clone() as Arc<dyn DownloadSourceLister>)
    }

    fn create_downloader(&self) -> Result<Arc<dyn FileDownloader>, DownloadError> {
        Ok(self.downloader.clone() as Arc<dyn FileDownloader>)
    }
}
