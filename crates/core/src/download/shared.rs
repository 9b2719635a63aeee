//! Process-wide poller for one upstream source.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::{DownloadError, DownloadFactory, DownloadSourceLister, FileDownloader, RemoteFileRef, SourceId};
use crate::cache::{CacheScope, CachedFileRecord, DateKey, IncrementalCache, PersistenceStore};
use crate::metrics::{DOWNLOAD_POLLS, FILES_DOWNLOADED};
use crate::project::date_dir;
use crate::project::DateRange;
use crate::stage::{PipelineStageKind, RunState, RunStateCell, WorkerPool};

/// Outcome of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Dates the lister announced.
    pub listed_dates: usize,
    /// Announced dates not cached before this poll.
    pub missing_dates: usize,
    /// Dates newly cached by this poll.
    pub cached_dates: usize,
    /// Dates whose download failed.
    pub failed_dates: usize,
    /// Another poll was already running.
    pub skipped: bool,
}

/// One polling task per distinct upstream source, shared by every project
/// that draws from it.
///
/// Each poll lists the source, diffs the listing against the dates already
/// cached, and downloads only the difference into the resource's own cache.
/// Stopping keeps the cache; releasing retires the resource for good.
pub struct SharedDownloadResource {
    id: u32,
    source: SourceId,
    data_name: String,
    cache: Arc<IncrementalCache>,
    lister: Arc<dyn DownloadSourceLister>,
    downloader: Arc<dyn FileDownloader>,
    download_dir: PathBuf,
    poll_interval: Duration,
    state: RunStateCell,
    pool: WorkerPool,
    listing: RwLock<Option<BTreeMap<DateKey, Vec<RemoteFileRef>>>>,
    polling: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<SharedDownloadResource>,
}

impl SharedDownloadResource {
    pub fn new(
        id: u32,
        factory: &dyn DownloadFactory,
        store: Arc<dyn PersistenceStore>,
        download_root: &Path,
        pool: WorkerPool,
    ) -> Result<Arc<Self>, DownloadError> {
        let source = factory.source_id();
        let lister = factory.create_lister()?;
        let downloader = factory.create_downloader()?;
        let download_dir = download_root.join(dir_name(&source));
        std::fs::create_dir_all(&download_dir)?;
        let cache = Arc::new(IncrementalCache::new(
            CacheScope::shared(source.as_str()),
            store,
        ));

        Ok(Arc::new_cyclic(|weak| Self {
            id,
            source,
            data_name: factory.data_name().to_string(),
            cache,
            lister,
            downloader,
            download_dir,
            poll_interval: factory.poll_interval(),
            state: RunStateCell::new(),
            pool,
            listing: RwLock::new(None),
            polling: AtomicBool::new(false),
            ticker: Mutex::new(None),
            self_ref: weak.clone(),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source
    }

    pub fn data_name(&self) -> &str {
        &self.data_name
    }

    pub fn cache(&self) -> &Arc<IncrementalCache> {
        &self.cache
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn is_released(&self) -> bool {
        self.state.is_retired()
    }

    /// Begin polling: once immediately, then every poll interval.
    pub fn start(&self) {
        if !self.state.begin_start() {
            return;
        }
        self.spawn_ticker();
        self.state.finish_start();
        info!(
            source = %self.source,
            interval_secs = self.poll_interval.as_secs(),
            "Shared downloader started"
        );
    }

    /// Stop polling. Cached downloads are kept.
    pub fn stop(&self) {
        let previous = self.state.stop();
        self.abort_ticker();
        if previous != RunState::Stopped {
            info!(source = %self.source, "Shared downloader stopped");
        }
    }

    /// Stop for good. A released resource never starts again.
    pub fn release(&self) {
        self.state.retire();
        self.abort_ticker();
        info!(source = %self.source, "Shared downloader released");
    }

    /// Number of announced dates within `range`, once a listing exists.
    pub fn expected_files(&self, range: &DateRange) -> Option<u64> {
        self.listing
            .read()
            .as_ref()
            .map(|listing| listing.keys().filter(|d| range.contains(**d)).count() as u64)
    }

    /// Run one poll now on the caller's task.
    pub async fn poll_now(&self) -> Result<PollSummary, DownloadError> {
        if self.polling.swap(true, Ordering::SeqCst) {
            DOWNLOAD_POLLS.with_label_values(&["skipped"]).inc();
            return Ok(PollSummary {
                skipped: true,
                ..Default::default()
            });
        }

        let result = AssertUnwindSafe(self.poll_inner())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(DownloadError::Panicked(self.source.to_string())));
        self.polling.store(false, Ordering::SeqCst);

        match &result {
            Ok(summary) => {
                DOWNLOAD_POLLS.with_label_values(&["success"]).inc();
                info!(
                    source = %self.source,
                    listed = summary.listed_dates,
                    missing = summary.missing_dates,
                    cached = summary.cached_dates,
                    failed = summary.failed_dates,
                    "Poll finished"
                );
            }
            Err(e) => {
                DOWNLOAD_POLLS.with_label_values(&["failure"]).inc();
                warn!(source = %self.source, "Poll failed: {}", e);
            }
        }
        result
    }

    async fn poll_inner(&self) -> Result<PollSummary, DownloadError> {
        let listing = self.lister.list_available().await?;
        let cached = self.cache.cached_dates()?;
        let missing: Vec<(DateKey, Vec<RemoteFileRef>)> = listing
            .iter()
            .filter(|(date, files)| !files.is_empty() && !cached.contains(*date))
            .map(|(date, files)| (*date, files.clone()))
            .collect();

        let mut summary = PollSummary {
            listed_dates: listing.len(),
            missing_dates: missing.len(),
            ..Default::default()
        };
        *self.listing.write() = Some(listing);

        for (date, files) in missing {
            if self.state.is_retired() {
                debug!(source = %self.source, "Released mid-poll, stopping");
                break;
            }

            let dest = date_dir(&self.download_dir, date);
            match self.download_date(date, &files, &dest).await {
                Ok(path) => {
                    let record = CachedFileRecord::new(
                        self.data_name.clone(),
                        path,
                        date,
                        PipelineStageKind::Download,
                    );
                    summary.cached_dates += self.cache.cache_files(vec![record])?.min(1);
                }
                Err(e) => {
                    warn!(source = %self.source, %date, "Download failed: {}", e);
                    summary.failed_dates += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Download every file of one date. The cached path is the file itself,
    /// or the date directory when the date has several files.
    async fn download_date(
        &self,
        date: DateKey,
        files: &[RemoteFileRef],
        dest: &Path,
    ) -> Result<PathBuf, DownloadError> {
        let mut paths = Vec::with_capacity(files.len());
        for remote in files {
            let path = self.downloader.download(date, remote, dest).await?;
            FILES_DOWNLOADED.inc();
            paths.push(path);
        }
        match paths.len() {
            1 => Ok(paths.remove(0)),
            _ => Ok(dest.to_path_buf()),
        }
    }

    fn spawn_ticker(&self) {
        let weak = self.self_ref.clone();
        let interval = self.poll_interval;
        let handle = self.pool.handle().spawn(async move {
            loop {
                let Some(resource) = weak.upgrade() else {
                    break;
                };
                if resource.state.is_retired() || resource.state.get() == RunState::Stopped {
                    break;
                }
                let pool = resource.pool.clone();
                pool.submit(async move { resource.poll_now().await.is_ok() });
                tokio::time::sleep(interval).await;
            }
        });

        if let Some(previous) = self.ticker.lock().replace(handle) {
            previous.abort();
        }
    }

    fn abort_ticker(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for SharedDownloadResource {
    fn drop(&mut self) {
        self.abort_ticker();
    }
}

fn dir_name(source: &SourceId) -> String {
    source
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{RecordQuery, SqlitePersistenceStore};
    use crate::testing::{fixtures, MockDownloadFactory};
    use tempfile::TempDir;
    use tokio::runtime::Handle;

    fn resource(tmp: &TempDir, factory: &MockDownloadFactory) -> Arc<SharedDownloadResource> {
        SharedDownloadResource::new(
            1,
            factory,
            Arc::new(SqlitePersistenceStore::in_memory().unwrap()),
            tmp.path(),
            WorkerPool::new("downloads", 1, Handle::current()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_poll_downloads_only_missing_dates() {
        let tmp = TempDir::new().unwrap();
        let factory = MockDownloadFactory::new("modis:data", "data");
        factory.lister.set_days(2024, 1..=3);
        let res = resource(&tmp, &factory);

        res.cache
            .cache_files(vec![fixtures::record(
                "data",
                DateKey::new(2024, 1),
                PipelineStageKind::Download,
            )])
            .unwrap();

        let summary = res.poll_now().await.unwrap();
        assert_eq!(summary.listed_dates, 3);
        assert_eq!(summary.missing_dates, 2);
        assert_eq!(summary.cached_dates, 2);
        assert_eq!(factory.downloader.downloads(), 2);

        let again = res.poll_now().await.unwrap();
        assert_eq!(again.missing_dates, 0);
        assert_eq!(factory.downloader.downloads(), 2);
    }

    #[tokio::test]
    async fn test_failed_date_is_retried_next_poll() {
        let tmp = TempDir::new().unwrap();
        let factory = MockDownloadFactory::new("modis:data", "data");
        factory.lister.set_days(2024, 1..=3);
        factory.downloader.fail_on(DateKey::new(2024, 2));
        let res = resource(&tmp, &factory);

        let summary = res.poll_now().await.unwrap();
        assert_eq!(summary.cached_dates, 2);
        assert_eq!(summary.failed_dates, 1);
        assert_eq!(res.cache.count(&RecordQuery::new()).unwrap(), 2);

        factory.downloader.clear_failures();
        let summary = res.poll_now().await.unwrap();
        assert_eq!(summary.missing_dates, 1);
        assert_eq!(summary.cached_dates, 1);
        assert_eq!(res.cache.count(&RecordQuery::new()).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_panicking_poll_does_not_block_the_next() {
        let tmp = TempDir::new().unwrap();
        let factory = MockDownloadFactory::new("modis:data", "data");
        factory.lister.set_days(2024, 1..=3);
        factory.lister.panic_next();
        let res = resource(&tmp, &factory);

        assert!(matches!(
            res.poll_now().await,
            Err(DownloadError::Panicked(source)) if source == "modis:data"
        ));

        let summary = res.poll_now().await.unwrap();
        assert!(!summary.skipped);
        assert_eq!(summary.cached_dates, 3);
        assert_eq!(factory.lister.calls(), 2);
    }

    #[tokio::test]
    async fn test_listing_failure_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let factory = MockDownloadFactory::new("modis:data", "data");
        factory.lister.set_fail(true);
        let res = resource(&tmp, &factory);

        assert!(res.poll_now().await.is_err());
        assert!(res.expected_files(&fixtures::open_range(2024, 1)).is_none());
    }

    #[tokio::test]
    async fn test_expected_files_respects_range() {
        let tmp = TempDir::new().unwrap();
        let factory = MockDownloadFactory::new("modis:data", "data");
        factory.lister.set_days(2024, 1..=10);
        let res = resource(&tmp, &factory);
        res.poll_now().await.unwrap();

        let range = DateRange {
            start: DateKey::new(2024, 3),
            end: Some(DateKey::new(2024, 6)),
        };
        assert_eq!(res.expected_files(&range), Some(4));
        assert_eq!(res.expected_files(&fixtures::open_range(2024, 1)), Some(10));
    }

    #[tokio::test]
    async fn test_start_polls_immediately_and_stop_keeps_cache() {
        let tmp = TempDir::new().unwrap();
        let factory = MockDownloadFactory::new("modis:data", "data");
        factory.lister.set_days(2024, 1..=3);
        let res = resource(&tmp, &factory);

        res.start();
        assert_eq!(res.state(), RunState::Running);
        let cache = Arc::clone(res.cache());
        assert!(
            fixtures::wait_until(Duration::from_secs(5), || {
                cache.count(&RecordQuery::new()).unwrap_or(0) == 3
            })
            .await
        );

        res.stop();
        assert_eq!(res.state(), RunState::Stopped);
        assert_eq!(res.cache.count(&RecordQuery::new()).unwrap(), 3);

        res.release();
        res.start();
        assert!(res.is_released());
        assert_eq!(res.state(), RunState::Stopped);
    }

    #[test]
    fn test_dir_name_sanitizes_source() {
        assert_eq!(dir_name(&SourceId::new("modis:data/v6")), "modis_data_v6");
    }
}
