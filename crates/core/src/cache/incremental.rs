//! The cache each stage writes to and the next stage watches.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::store::{PersistenceStore, RecordQuery, StoreError};
use super::types::{CacheEntry, CacheEvent, CacheScope, CachedFileRecord, DateKey};
use crate::metrics::CACHE_WRITES;

/// Receives change notifications from an [`IncrementalCache`].
///
/// Callbacks run on the writer's thread after the write committed. They may
/// subscribe or unsubscribe observers, including themselves.
pub trait CacheObserver: Send + Sync {
    fn on_cache_changed(&self, scope: &CacheScope, event: CacheEvent);
}

/// Handle returned by [`IncrementalCache::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct IncrementalCache {
    scope: CacheScope,
    store: Arc<dyn PersistenceStore>,
    observers: Mutex<Vec<(SubscriptionId, Weak<dyn CacheObserver>)>>,
    next_id: AtomicU64,
}

impl IncrementalCache {
    pub fn new(scope: CacheScope, store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            scope,
            store,
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn scope(&self) -> &CacheScope {
        &self.scope
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    /// Register an observer. The cache only holds a weak reference.
    pub fn subscribe(&self, observer: Weak<dyn CacheObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .iter()
            .filter(|(_, o)| o.strong_count() > 0)
            .count()
    }

    /// Upsert `records` and notify every observer once, even when nothing changed.
    ///
    /// Returns the number of rows that were inserted or changed.
    pub fn cache_files(&self, records: Vec<CachedFileRecord>) -> Result<usize, StoreError> {
        if let Some(bad) = records.iter().find(|r| r.stage != self.scope.stage) {
            return Err(StoreError::StageMismatch {
                data_name: bad.data_name.clone(),
                expected: self.scope.stage.to_string(),
                actual: bad.stage.to_string(),
            });
        }

        let submitted = records.len();
        let changed = self.store.upsert_records(&self.scope, &records)?;
        if changed > 0 {
            CACHE_WRITES
                .with_label_values(&[self.scope.stage.as_str()])
                .inc_by(changed as u64);
        }
        debug!(
            scope = %self.scope,
            submitted,
            changed,
            "Cached files"
        );

        self.notify(CacheEvent::Written { submitted, changed });
        Ok(changed)
    }

    /// Rows not yet consumed by the downstream stage.
    pub fn unprocessed_records(&self) -> Result<Vec<CacheEntry>, StoreError> {
        self.store
            .query_records(&self.scope, &RecordQuery::new().unprocessed())
    }

    /// Rows not yet consumed for a single date.
    pub fn unprocessed_on(&self, date: DateKey) -> Result<Vec<CacheEntry>, StoreError> {
        self.store
            .query_records(&self.scope, &RecordQuery::new().unprocessed().on(date))
    }

    /// Rows written after `marker`, optionally narrowed by `query`.
    pub fn load_records_since(
        &self,
        marker: i64,
        query: RecordQuery,
    ) -> Result<Vec<CacheEntry>, StoreError> {
        self.store
            .query_records(&self.scope, &query.with_after_seq(marker))
    }

    pub fn records(&self, query: &RecordQuery) -> Result<Vec<CacheEntry>, StoreError> {
        self.store.query_records(&self.scope, query)
    }

    /// Record that the downstream stage consumed `date` up to sequence `up_to_seq`.
    pub fn mark_processed(&self, date: DateKey, up_to_seq: i64) -> Result<usize, StoreError> {
        self.store.mark_processed(&self.scope, date, up_to_seq)
    }

    pub fn count(&self, query: &RecordQuery) -> Result<u64, StoreError> {
        self.store.count_records(&self.scope, query)
    }

    pub fn count_dates(&self, query: &RecordQuery) -> Result<u64, StoreError> {
        self.store.count_dates(&self.scope, query)
    }

    pub fn cached_dates(&self) -> Result<BTreeSet<DateKey>, StoreError> {
        Ok(self
            .store
            .query_records(&self.scope, &RecordQuery::new())?
            .into_iter()
            .map(|e| e.record.date)
            .collect())
    }

    pub fn date_span(&self) -> Result<Option<(DateKey, DateKey)>, StoreError> {
        self.store.date_span(&self.scope)
    }

    /// Ask every observer to re-scan for produced but unconsumed work.
    pub fn notify_observers_to_check_for_past_updates(&self) {
        self.notify(CacheEvent::CatchUp);
    }

    fn notify(&self, event: CacheEvent) {
        // Copy the list so callbacks can (un)subscribe without deadlocking.
        let observers: Vec<Weak<dyn CacheObserver>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();

        let mut dead = false;
        for observer in observers {
            match observer.upgrade() {
                Some(observer) => observer.on_cache_changed(&self.scope, event),
                None => dead = true,
            }
        }

        if dead {
            self.observers.lock().retain(|(_, o)| o.strong_count() > 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqlitePersistenceStore;
    use crate::stage::PipelineStageKind;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        events: Mutex<Vec<CacheEvent>>,
    }

    impl CacheObserver for Counter {
        fn on_cache_changed(&self, _scope: &CacheScope, event: CacheEvent) {
            self.events.lock().push(event);
        }
    }

    fn cache() -> IncrementalCache {
        let store = Arc::new(SqlitePersistenceStore::in_memory().unwrap());
        IncrementalCache::new(
            CacheScope::project("p", "modis", PipelineStageKind::Download),
            store,
        )
    }

    fn record(day: u32) -> CachedFileRecord {
        CachedFileRecord::new(
            "data",
            format!("/d/{}.tif", day),
            DateKey::new(2024, day),
            PipelineStageKind::Download,
        )
    }

    fn subscribe(cache: &IncrementalCache, counter: &Arc<Counter>) -> SubscriptionId {
        let observer: Arc<dyn CacheObserver> = counter.clone();
        cache.subscribe(Arc::downgrade(&observer))
    }

    #[test]
    fn test_identical_writes_notify_once_per_call() {
        let cache = cache();
        let counter = Arc::new(Counter::default());
        subscribe(&cache, &counter);

        let records = vec![record(1), record(2)];
        assert_eq!(cache.cache_files(records.clone()).unwrap(), 2);
        let state_after_first = cache.records(&RecordQuery::new()).unwrap();
        assert_eq!(cache.cache_files(records).unwrap(), 0);

        assert_eq!(cache.records(&RecordQuery::new()).unwrap(), state_after_first);
        let events = counter.events.lock();
        assert_eq!(
            *events,
            vec![
                CacheEvent::Written { submitted: 2, changed: 2 },
                CacheEvent::Written { submitted: 2, changed: 0 },
            ]
        );
    }

    #[test]
    fn test_empty_write_still_notifies() {
        let cache = cache();
        let counter = Arc::new(Counter::default());
        subscribe(&cache, &counter);

        cache.cache_files(Vec::new()).unwrap();
        assert_eq!(counter.events.lock().len(), 1);
    }

    #[test]
    fn test_rejects_foreign_stage() {
        let cache = cache();
        let counter = Arc::new(Counter::default());
        subscribe(&cache, &counter);

        let mut bad = record(1);
        bad.stage = PipelineStageKind::Index;
        let err = cache.cache_files(vec![bad]).unwrap_err();
        assert!(matches!(err, StoreError::StageMismatch { .. }));
        assert!(counter.events.lock().is_empty());
    }

    #[test]
    fn test_catch_up_signal() {
        let cache = cache();
        let counter = Arc::new(Counter::default());
        subscribe(&cache, &counter);

        cache.notify_observers_to_check_for_past_updates();
        assert_eq!(*counter.events.lock(), vec![CacheEvent::CatchUp]);
    }

    #[test]
    fn test_unsubscribe_and_dropped_observers() {
        let cache = cache();
        let kept = Arc::new(Counter::default());
        let id = subscribe(&cache, &kept);
        {
            let dropped = Arc::new(Counter::default());
            subscribe(&cache, &dropped);
            assert_eq!(cache.observer_count(), 2);
        }
        assert_eq!(cache.observer_count(), 1);

        assert!(cache.unsubscribe(id));
        assert!(!cache.unsubscribe(id));
        cache.cache_files(vec![record(1)]).unwrap();
        assert!(kept.events.lock().is_empty());
    }

    struct SelfRemoving {
        cache: Arc<IncrementalCache>,
        id: Mutex<Option<SubscriptionId>>,
        calls: AtomicUsize,
    }

    impl CacheObserver for SelfRemoving {
        fn on_cache_changed(&self, _scope: &CacheScope, _event: CacheEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = self.id.lock().take() {
                self.cache.unsubscribe(id);
            }
        }
    }

    #[test]
    fn test_observer_can_unsubscribe_during_callback() {
        let cache = Arc::new(cache());
        let observer = Arc::new(SelfRemoving {
            cache: Arc::clone(&cache),
            id: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let dyn_observer: Arc<dyn CacheObserver> = observer.clone();
        let id = cache.subscribe(Arc::downgrade(&dyn_observer));
        *observer.id.lock() = Some(id);

        cache.cache_files(vec![record(1)]).unwrap();
        cache.cache_files(vec![record(2)]).unwrap();
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unprocessed_and_since() {
        let cache = cache();
        cache.cache_files(vec![record(1), record(2)]).unwrap();
        let entries = cache.unprocessed_records().unwrap();
        assert_eq!(entries.len(), 2);

        cache.mark_processed(DateKey::new(2024, 1), entries[0].seq).unwrap();
        assert_eq!(cache.unprocessed_records().unwrap().len(), 1);
        assert!(cache.unprocessed_on(DateKey::new(2024, 1)).unwrap().is_empty());

        let since = cache.load_records_since(entries[0].seq, RecordQuery::new()).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].record.date, DateKey::new(2024, 2));
    }
}
