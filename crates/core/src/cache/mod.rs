//! Incremental per-stage caches.
//!
//! A cache is the durable record of what a stage has produced and the only
//! channel through which the next stage learns about new input. Writes are
//! idempotent upserts keyed by (data name, year, day of year, stage), and
//! every write signals the registered observers exactly once.

mod incremental;
mod sqlite_store;
mod store;
mod types;

pub use incremental::{CacheObserver, IncrementalCache, SubscriptionId};
pub use sqlite_store::SqlitePersistenceStore;
pub use store::{ExpectedKey, PersistenceStore, RecordQuery, StoreError};
pub use types::{CacheEntry, CacheEvent, CacheScope, CachedFileRecord, DateKey};
