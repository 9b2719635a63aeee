//! Bounded worker pools shared by every pipeline.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::error;

/// Snapshot of a pool's load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Pool name (e.g., "workers", "downloads").
    pub name: String,
    /// Number of running tasks.
    pub active_jobs: usize,
    /// Maximum concurrent tasks.
    pub max_concurrent: usize,
    /// Tasks waiting for a slot.
    pub queued_jobs: usize,
    /// Tasks that completed successfully since startup.
    pub total_processed: u64,
    /// Tasks that failed or panicked since startup.
    pub total_failed: u64,
}

/// Tracks statistics for a pool.
#[derive(Default)]
struct PoolStats {
    active: AtomicU64,
    queued: AtomicU64,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
}

impl PoolStats {
    fn to_status(&self, name: &str, max_concurrent: usize) -> PoolStatus {
        PoolStatus {
            name: name.to_string(),
            active_jobs: self.active.load(Ordering::Relaxed) as usize,
            max_concurrent,
            queued_jobs: self.queued.load(Ordering::Relaxed) as usize,
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
        }
    }
}

struct PoolInner {
    name: String,
    max_concurrent: usize,
    semaphore: Semaphore,
    stats: PoolStats,
    handle: Handle,
}

/// A fixed number of concurrent slots on a tokio runtime.
///
/// Submitted tasks queue on the semaphore; the backlog is the only
/// back-pressure signal. Tasks report success as a `bool`; panics are
/// caught and counted as failures.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, max_concurrent: usize, handle: Handle) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                max_concurrent,
                semaphore: Semaphore::new(max_concurrent),
                stats: PoolStats::default(),
                handle,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Queue a task. Returns false if the pool has been closed.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = bool> + Send + 'static,
    {
        if self.inner.semaphore.is_closed() {
            return false;
        }

        let inner = Arc::clone(&self.inner);
        inner.stats.queued.fetch_add(1, Ordering::Relaxed);
        self.inner.handle.spawn(async move {
            let permit = inner.semaphore.acquire().await;
            inner.stats.queued.fetch_sub(1, Ordering::Relaxed);
            let Ok(_permit) = permit else {
                return;
            };

            inner.stats.active.fetch_add(1, Ordering::Relaxed);
            let result = AssertUnwindSafe(task).catch_unwind().await;
            inner.stats.active.fetch_sub(1, Ordering::Relaxed);

            match result {
                Ok(true) => {
                    inner.stats.total_processed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {
                    inner.stats.total_failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    inner.stats.total_failed.fetch_add(1, Ordering::Relaxed);
                    error!(pool = %inner.name, "Pool task panicked");
                }
            }
        });
        true
    }

    /// Reject new tasks; queued tasks are dropped, running ones finish.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        self.inner
            .stats
            .to_status(&self.inner.name, self.inner.max_concurrent)
    }
}

/// The two pools owned by the orchestrator.
#[derive(Clone)]
pub struct Pools {
    /// Stage work for every project.
    pub workers: WorkerPool,
    /// Shared downloader polls.
    pub downloads: WorkerPool,
}

impl Pools {
    pub fn new(worker_threads: usize, downloaders: usize, handle: Handle) -> Self {
        Self {
            workers: WorkerPool::new("workers", worker_threads, handle.clone()),
            downloads: WorkerPool::new("downloads", downloaders, handle),
        }
    }

    pub fn close(&self) {
        self.workers.close();
        self.downloads.close();
    }
}
