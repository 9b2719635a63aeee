//! Links a project's download cache to a shared downloader.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::shared::SharedDownloadResource;
use super::traits::SourceId;
use crate::cache::{
    CacheEvent, CacheObserver, CacheScope, IncrementalCache, RecordQuery, StoreError,
    SubscriptionId,
};
use crate::project::DateRange;

/// Copies records from a shared downloader's cache into one project's
/// download cache, restricted to the project's date range.
///
/// The binding remembers the last sequence number it copied and only loads
/// newer records on each notification.
pub struct ProjectDownloadBinding {
    resource: Arc<SharedDownloadResource>,
    target: Arc<IncrementalCache>,
    range: DateRange,
    marker: AtomicI64,
    subscription: Mutex<Option<SubscriptionId>>,
    loading: Mutex<()>,
}

impl ProjectDownloadBinding {
    /// Create the binding and subscribe it to the shared cache.
    pub fn attach(
        resource: Arc<SharedDownloadResource>,
        target: Arc<IncrementalCache>,
        range: DateRange,
    ) -> Arc<Self> {
        let binding = Arc::new(Self {
            resource,
            target,
            range,
            marker: AtomicI64::new(0),
            subscription: Mutex::new(None),
            loading: Mutex::new(()),
        });

        let weak: Weak<dyn CacheObserver> = Arc::downgrade(&binding) as Weak<dyn CacheObserver>;
        let id = binding.resource.cache().subscribe(weak);
        *binding.subscription.lock() = Some(id);
        binding
    }

    pub fn source_id(&self) -> &SourceId {
        self.resource.source_id()
    }

    pub fn resource(&self) -> &Arc<SharedDownloadResource> {
        &self.resource
    }

    pub fn target(&self) -> &Arc<IncrementalCache> {
        &self.target
    }

    /// Sequence number of the newest record copied so far.
    pub fn marker(&self) -> i64 {
        self.marker.load(Ordering::SeqCst)
    }

    /// Copy records newer than the marker. The target cache is notified even
    /// when nothing new arrived so downstream stages re-check their input.
    pub fn load_new(&self) -> Result<usize, StoreError> {
        let _guard = self.loading.lock();
        let marker = self.marker();

        let mut query = RecordQuery::new().with_from(self.range.start);
        if let Some(end) = self.range.end {
            query = query.with_to(end);
        }
        let entries = self.resource.cache().load_records_since(marker, query)?;
        let newest = entries.iter().map(|e| e.seq).max();
        let records = entries.into_iter().map(|e| e.record).collect::<Vec<_>>();
        let loaded = records.len();

        let changed = self.target.cache_files(records)?;
        if let Some(newest) = newest {
            self.marker.fetch_max(newest, Ordering::SeqCst);
        }

        debug!(
            source = %self.resource.source_id(),
            target = %self.target.scope(),
            loaded,
            changed,
            "Loaded shared downloads"
        );
        Ok(changed)
    }

    /// Re-run the load outside of a notification.
    pub fn attempt_update(&self) -> Result<usize, StoreError> {
        self.load_new()
    }

    /// Dates the source announced within the project range, once listed.
    pub fn expected_count(&self) -> Option<u64> {
        self.resource.expected_files(&self.range)
    }

    /// Stop receiving notifications from the shared cache.
    pub fn detach(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.resource.cache().unsubscribe(id);
        }
    }
}

impl CacheObserver for ProjectDownloadBinding {
    fn on_cache_changed(&self, _scope: &CacheScope, _event: CacheEvent) {
        if let Err(e) = self.load_new() {
            warn!(
                source = %self.resource.source_id(),
                "Failed to copy shared downloads: {}",
                e
            );
        }
    }
}

impl Drop for ProjectDownloadBinding {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DateKey, SqlitePersistenceStore};
    use crate::stage::{PipelineStageKind, WorkerPool};
    use crate::testing::{fixtures, MockDownloadFactory};
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::runtime::Handle;

    fn setup(
        tmp: &Path,
        factory: &MockDownloadFactory,
        range: DateRange,
    ) -> (Arc<SharedDownloadResource>, Arc<IncrementalCache>, Arc<ProjectDownloadBinding>) {
        let store: Arc<dyn crate::cache::PersistenceStore> =
            Arc::new(SqlitePersistenceStore::in_memory().unwrap());
        let resource = SharedDownloadResource::new(
            1,
            factory,
            Arc::clone(&store),
            tmp,
            WorkerPool::new("downloads", 1, Handle::current()),
        )
        .unwrap();
        let target = Arc::new(IncrementalCache::new(
            CacheScope::project("p", "modis", PipelineStageKind::Download),
            store,
        ));
        let binding = ProjectDownloadBinding::attach(Arc::clone(&resource), Arc::clone(&target), range);
        (resource, target, binding)
    }

    #[tokio::test]
    async fn test_poll_propagates_into_project_cache() {
        let tmp = TempDir::new().unwrap();
        let factory = MockDownloadFactory::new("modis:data", "data");
        factory.lister.set_days(2024, 1..=5);
        let (resource, target, binding) = setup(tmp.path(), &factory, fixtures::open_range(2024, 1));

        resource.poll_now().await.unwrap();

        assert_eq!(target.count(&RecordQuery::new()).unwrap(), 5);
        assert!(binding.marker() > 0);
        assert_eq!(binding.expected_count(), Some(5));
    }

    #[tokio::test]
    async fn test_records_outside_range_are_not_copied() {
        let tmp = TempDir::new().unwrap();
        let factory = MockDownloadFactory::new("modis:data", "data");
        factory.lister.set_days(2024, 1..=10);
        let range = DateRange {
            start: DateKey::new(2024, 4),
            end: Some(DateKey::new(2024, 6)),
        };
        let (resource, target, binding) = setup(tmp.path(), &factory, range);

        resource.poll_now().await.unwrap();

        let dates = target.cached_dates().unwrap();
        assert_eq!(dates.len(), 3);
        assert_eq!(dates.first(), Some(&DateKey::new(2024, 4)));
        assert_eq!(binding.expected_count(), Some(3));
    }

    #[tokio::test]
    async fn test_late_binding_loads_existing_downloads() {
        let tmp = TempDir::new().unwrap();
        let factory = MockDownloadFactory::new("modis:data", "data");
        factory.lister.set_days(2024, 1..=3);
        let (resource, _target, _binding) = setup(tmp.path(), &factory, fixtures::open_range(2024, 1));
        resource.poll_now().await.unwrap();

        let second = Arc::new(IncrementalCache::new(
            CacheScope::project("q", "modis", PipelineStageKind::Download),
            Arc::clone(resource.cache().store()),
        ));
        let late = ProjectDownloadBinding::attach(
            Arc::clone(&resource),
            Arc::clone(&second),
            fixtures::open_range(2024, 1),
        );
        assert_eq!(second.count(&RecordQuery::new()).unwrap(), 0);

        assert_eq!(late.attempt_update().unwrap(), 3);
        assert_eq!(late.attempt_update().unwrap(), 0);
        assert_eq!(second.count(&RecordQuery::new()).unwrap(), 3);
        assert_eq!(factory.downloader.downloads(), 3);
    }

    #[tokio::test]
    async fn test_detach_stops_propagation() {
        let tmp = TempDir::new().unwrap();
        let factory = MockDownloadFactory::new("modis:data", "data");
        factory.lister.set_days(2024, 1..=2);
        let (resource, target, binding) = setup(tmp.path(), &factory, fixtures::open_range(2024, 1));

        binding.detach();
        assert_eq!(resource.cache().observer_count(), 0);
        resource.poll_now().await.unwrap();
        assert_eq!(target.count(&RecordQuery::new()).unwrap(), 0);
    }
}
