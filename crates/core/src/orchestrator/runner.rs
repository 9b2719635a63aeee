//! Orchestrator implementation.
//!
//! One processing-loop pass at a time mutates the scheduler and downloader
//! registries; readers take shared locks only.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::OrchestratorConfig;
use super::ids::IdAllocator;
use super::observer::{ObserverId, UiObserver};
use super::types::{OrchestratorError, OrchestratorStatus, PendingRequest, SchedulerRef};
use crate::cache::{IncrementalCache, PersistenceStore};
use crate::download::{
    DownloadError, DownloadFactory, ProjectDownloadBinding, SharedDownloadResource, SourceId,
};
use crate::metrics::SCHEDULER_REQUESTS;
use crate::project::{DateRange, ProjectDescriptor};
use crate::registry::PluginRegistry;
use crate::scheduler::{
    DownloaderProvider, ProjectScheduler, SchedulerDeps, SchedulerStatus, StatusBoard,
};
use crate::stage::{Pools, RunState};

/// The single owner of every scheduler and shared downloader.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn PersistenceStore>,
    registry: Arc<PluginRegistry>,
    pools: OnceLock<Pools>,
    board: Arc<StatusBoard>,

    schedulers: RwLock<BTreeMap<u32, Arc<ProjectScheduler>>>,
    downloaders: RwLock<BTreeMap<SourceId, Arc<SharedDownloadResource>>>,
    scheduler_ids: Mutex<IdAllocator>,
    downloader_ids: Mutex<IdAllocator>,

    requests: Mutex<VecDeque<PendingRequest>>,
    just_create: AtomicBool,
    pass_lock: Mutex<()>,

    observers: RwLock<Vec<(ObserverId, Arc<dyn UiObserver>)>>,
    next_observer_id: AtomicU64,
    /// Final snapshots of schedulers deleted during the current pass.
    farewells: Mutex<Vec<SchedulerStatus>>,

    shutdown_tx: broadcast::Sender<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn PersistenceStore>,
        registry: Arc<PluginRegistry>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            config,
            store,
            registry,
            pools: OnceLock::new(),
            board: Arc::new(StatusBoard::new()),
            schedulers: RwLock::new(BTreeMap::new()),
            downloaders: RwLock::new(BTreeMap::new()),
            scheduler_ids: Mutex::new(IdAllocator::new()),
            downloader_ids: Mutex::new(IdAllocator::new()),
            requests: Mutex::new(VecDeque::new()),
            just_create: AtomicBool::new(false),
            pass_lock: Mutex::new(()),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(0),
            farewells: Mutex::new(Vec::new()),
            shutdown_tx,
            loop_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Size the pools and, unless polling is disabled, launch the
    /// processing loop. Later calls are no-ops.
    pub fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Closed);
        }
        let runtime = Handle::try_current().map_err(|e| OrchestratorError::NoRuntime(e.to_string()))?;

        let mut created = false;
        let pools = self.pools.get_or_init(|| {
            created = true;
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            Pools::new(
                self.config.worker_pool_size(cpus),
                self.config.max_concurrent_downloaders,
                runtime.clone(),
            )
        });
        if !created {
            debug!("Orchestrator already started");
            return Ok(());
        }

        info!(
            workers = pools.workers.max_concurrent(),
            downloaders = pools.downloads.max_concurrent(),
            poll_interval_ms = self.config.poll_interval_ms,
            "Orchestrator started"
        );

        if self.config.poll_interval_ms > 0 {
            self.spawn_processing_loop(&runtime);
        }
        Ok(())
    }

    fn spawn_processing_loop(self: &Arc<Self>, runtime: &Handle) {
        let orchestrator = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = runtime.spawn(async move {
            info!("Processing loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Processing loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let Some(orchestrator) = orchestrator.upgrade() else {
                            break;
                        };
                        match tokio::task::spawn_blocking(move || orchestrator.update_state()).await {
                            Ok(()) => {}
                            Err(e) if e.is_panic() => {
                                error!("Processing loop pass panicked: {}", e);
                            }
                            Err(e) => {
                                warn!("Processing loop pass cancelled: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            info!("Processing loop stopped");
        });
        *self.loop_handle.lock() = Some(handle);
    }

    /// Queue construction of a scheduler for `descriptor`.
    ///
    /// With `force_update` one pass runs before returning; that pass only
    /// handles creations.
    pub fn request_new_scheduler(
        &self,
        descriptor: ProjectDescriptor,
        force_update: bool,
    ) -> Result<(), OrchestratorError> {
        if force_update {
            self.just_create.store(true, Ordering::SeqCst);
        }
        self.enqueue(PendingRequest::Create(descriptor), force_update)
    }

    pub fn request_stop(
        &self,
        target: impl Into<SchedulerRef>,
        force_update: bool,
    ) -> Result<(), OrchestratorError> {
        self.enqueue(PendingRequest::Stop(target.into()), force_update)
    }

    pub fn request_start(
        &self,
        target: impl Into<SchedulerRef>,
        force_update: bool,
    ) -> Result<(), OrchestratorError> {
        self.enqueue(PendingRequest::Start(target.into()), force_update)
    }

    pub fn request_delete(
        &self,
        target: impl Into<SchedulerRef>,
        force_update: bool,
    ) -> Result<(), OrchestratorError> {
        self.enqueue(PendingRequest::Delete(target.into()), force_update)
    }

    fn enqueue(&self, request: PendingRequest, force_update: bool) -> Result<(), OrchestratorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Closed);
        }
        let kind = match &request {
            PendingRequest::Create(_) => "create",
            PendingRequest::Stop(_) => "stop",
            PendingRequest::Start(_) => "start",
            PendingRequest::Delete(_) => "delete",
        };
        SCHEDULER_REQUESTS.with_label_values(&[kind]).inc();
        debug!(kind, "Queued scheduler request");

        self.requests.lock().push_back(request);
        if force_update {
            self.update_state();
        }
        Ok(())
    }

    /// Run exactly one processing-loop pass on the calling thread.
    pub fn update_state(&self) {
        let _pass = self.pass_lock.lock();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(pools) = self.pools.get() else {
            warn!("Processing pass requested before the orchestrator was started");
            return;
        };

        let just_create = self.just_create.swap(false, Ordering::SeqCst);
        let (creates, controls) = self.take_requests(just_create);

        self.process_creates(pools, creates);
        if !just_create {
            self.process_controls(controls);
            self.run_periodic_updates();
        }
        self.reconcile_downloaders();
        self.flush_notifications();
    }

    /// Split the queue into creations and the rest. In create-only passes
    /// the rest stays queued.
    fn take_requests(&self, just_create: bool) -> (Vec<ProjectDescriptor>, Vec<PendingRequest>) {
        let mut queue = self.requests.lock();
        let mut creates = Vec::new();
        let mut controls = Vec::new();
        for request in queue.drain(..) {
            match request {
                PendingRequest::Create(descriptor) => creates.push(descriptor),
                other => controls.push(other),
            }
        }
        if just_create {
            queue.extend(controls.drain(..));
        }
        (creates, controls)
    }

    fn process_creates(&self, pools: &Pools, creates: Vec<ProjectDescriptor>) {
        let mut deferred = Vec::new();

        for descriptor in creates {
            let name = descriptor.name.clone();
            if self.find(&SchedulerRef::Name(name.clone())).is_some() {
                warn!(project = %name, "Scheduler already exists, ignoring duplicate request");
                continue;
            }
            let Some(id) = self.scheduler_ids.lock().allocate() else {
                warn!(project = %name, "No free scheduler IDs, deferring creation");
                deferred.push(descriptor);
                continue;
            };

            let deps = SchedulerDeps {
                store: Arc::clone(&self.store),
                registry: &self.registry,
                workers: pools.workers.clone(),
                downloads: self,
                board: Arc::clone(&self.board),
                log_capacity: self.config.log_capacity,
            };
            match ProjectScheduler::new(id, descriptor, &deps) {
                Ok(scheduler) => {
                    self.schedulers.write().insert(id, Arc::clone(&scheduler));
                    scheduler.start();
                }
                Err(e) => {
                    error!(project = %name, "Failed to create scheduler: {}", e);
                    self.scheduler_ids.lock().release(id);
                }
            }
        }

        if !deferred.is_empty() {
            let mut queue = self.requests.lock();
            for descriptor in deferred.into_iter().rev() {
                queue.push_front(PendingRequest::Create(descriptor));
            }
        }
    }

    fn process_controls(&self, controls: Vec<PendingRequest>) {
        let mut stops = Vec::new();
        let mut deletes = Vec::new();
        let mut starts = Vec::new();
        for request in controls {
            match request {
                PendingRequest::Stop(target) => stops.push(target),
                PendingRequest::Delete(target) => deletes.push(target),
                PendingRequest::Start(target) => starts.push(target),
                PendingRequest::Create(_) => {}
            }
        }

        for target in stops {
            match self.find(&target) {
                Some(scheduler) => {
                    scheduler.stop();
                }
                None => warn!(%target, "Stop requested for unknown scheduler"),
            }
        }
        for target in deletes {
            self.delete_scheduler(&target);
        }
        for target in starts {
            match self.find(&target) {
                Some(scheduler) => {
                    scheduler.start();
                }
                None => warn!(%target, "Start requested for unknown scheduler"),
            }
        }
    }

    fn delete_scheduler(&self, target: &SchedulerRef) {
        let Some(scheduler) = self.find(target) else {
            warn!(%target, "Delete requested for unknown scheduler");
            return;
        };

        let id = scheduler.id();
        scheduler.stop();
        scheduler.retire();
        self.schedulers.write().remove(&id);
        self.board.remove(id);
        self.scheduler_ids.lock().release(id);
        self.farewells.lock().push(scheduler.status());
    }

    fn run_periodic_updates(&self) {
        let interval = Duration::from_secs(self.config.attempt_update_interval_secs);
        let due: Vec<Arc<ProjectScheduler>> = self
            .schedulers
            .read()
            .values()
            .filter(|s| s.needs_update(interval))
            .cloned()
            .collect();

        for scheduler in due {
            debug!(project = %scheduler.name(), "Periodic update");
            scheduler.attempt_update();
        }
    }

    /// Release downloaders nobody references, stop those whose referencing
    /// schedulers are all stopped, and restart stopped ones that are needed.
    fn reconcile_downloaders(&self) {
        let schedulers: Vec<Arc<ProjectScheduler>> =
            self.schedulers.read().values().cloned().collect();
        let resources: Vec<Arc<SharedDownloadResource>> =
            self.downloaders.read().values().cloned().collect();

        for resource in resources {
            let source = resource.source_id();
            let referencing: Vec<&Arc<ProjectScheduler>> = schedulers
                .iter()
                .filter(|s| s.references_source(source))
                .collect();

            if referencing.is_empty() {
                resource.release();
                self.downloaders.write().remove(source);
                self.downloader_ids.lock().release(resource.id());
            } else if referencing.iter().all(|s| s.state() == RunState::Stopped) {
                if resource.state() != RunState::Stopped {
                    resource.stop();
                }
            } else if resource.state() == RunState::Stopped {
                resource.start();
            }
        }
    }

    fn flush_notifications(&self) {
        let schedulers: Vec<Arc<ProjectScheduler>> =
            self.schedulers.read().values().cloned().collect();
        for scheduler in schedulers {
            scheduler.publish_if_dirty();
        }

        let mut batch = std::mem::take(&mut *self.farewells.lock());
        batch.extend(self.board.take_changed());
        if !batch.is_empty() {
            self.notify_ui(&batch);
        }
    }

    /// Fan `statuses` out to every registered observer.
    pub fn notify_ui(&self, statuses: &[SchedulerStatus]) {
        let observers: Vec<Arc<dyn UiObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer.on_status_changed(statuses);
        }
    }

    pub fn register_ui_observer(&self, observer: Arc<dyn UiObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::SeqCst));
        self.observers.write().push((id, observer));
        id
    }

    pub fn unregister_ui_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    fn find(&self, target: &SchedulerRef) -> Option<Arc<ProjectScheduler>> {
        let schedulers = self.schedulers.read();
        match target {
            SchedulerRef::Id(id) => schedulers.get(id).cloned(),
            SchedulerRef::Name(name) => schedulers.values().find(|s| s.name() == name).cloned(),
        }
    }

    /// A fresh snapshot, or `None` for an unknown scheduler.
    pub fn get_scheduler_status(&self, target: impl Into<SchedulerRef>) -> Option<SchedulerStatus> {
        self.find(&target.into()).map(|s| s.status())
    }

    /// Snapshots of every live scheduler, ordered by ID.
    pub fn get_scheduler_statuses(&self) -> Vec<SchedulerStatus> {
        let schedulers: Vec<Arc<ProjectScheduler>> =
            self.schedulers.read().values().cloned().collect();
        schedulers.iter().map(|s| s.status()).collect()
    }

    /// Run a scheduler's update now. Returns the number of newly loaded
    /// downloads, or `None` for an unknown scheduler.
    pub fn attempt_update(&self, target: impl Into<SchedulerRef>) -> Option<usize> {
        self.find(&target.into()).map(|s| s.attempt_update())
    }

    pub fn number_of_schedulers(&self) -> usize {
        self.schedulers.read().len()
    }

    pub fn number_of_shared_downloaders(&self) -> usize {
        self.downloaders.read().len()
    }

    pub fn shared_downloader(&self, source: &SourceId) -> Option<Arc<SharedDownloadResource>> {
        self.downloaders.read().get(source).cloned()
    }

    pub fn status(&self) -> OrchestratorStatus {
        let pools = self.pools.get();
        OrchestratorStatus {
            started: pools.is_some(),
            closed: self.closed.load(Ordering::SeqCst),
            schedulers: self.number_of_schedulers(),
            shared_downloaders: self.number_of_shared_downloaders(),
            pending_requests: self.requests.lock().len(),
            workers: pools.map(|p| p.workers.status()),
            downloads: pools.map(|p| p.downloads.status()),
        }
    }

    /// Stop every scheduler and downloader, then close the pools. Running
    /// units finish; queued ones are dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing orchestrator");
        let _ = self.shutdown_tx.send(());
        self.loop_handle.lock().take();

        let _pass = self.pass_lock.lock();
        let schedulers: Vec<Arc<ProjectScheduler>> =
            self.schedulers.read().values().cloned().collect();
        for scheduler in &schedulers {
            scheduler.stop();
        }
        let resources: Vec<Arc<SharedDownloadResource>> =
            self.downloaders.read().values().cloned().collect();
        for resource in &resources {
            resource.stop();
        }
        self.flush_notifications();

        if let Some(pools) = self.pools.get() {
            pools.close();
        }
        info!(schedulers = schedulers.len(), "Orchestrator closed");
    }
}

impl DownloaderProvider for Orchestrator {
    /// Bind `target` to the shared downloader of the factory's source,
    /// creating the downloader on first use.
    fn acquire_shared_downloader(
        &self,
        factory: Arc<dyn DownloadFactory>,
        target: Arc<IncrementalCache>,
        range: DateRange,
    ) -> Result<Arc<ProjectDownloadBinding>, DownloadError> {
        let pools = self.pools.get().ok_or(DownloadError::ShutDown)?;
        let source = factory.source_id();

        let resource = {
            let mut downloaders = self.downloaders.write();
            match downloaders.get(&source) {
                Some(existing) if !existing.is_released() => Arc::clone(existing),
                _ => {
                    let id = self.downloader_ids.lock().allocate().ok_or_else(|| {
                        DownloadError::InvalidSource(format!("no free downloader ID for {}", source))
                    })?;
                    let created = SharedDownloadResource::new(
                        id,
                        factory.as_ref(),
                        Arc::clone(&self.store),
                        &self.config.download_root,
                        pools.downloads.clone(),
                    );
                    match created {
                        Ok(resource) => {
                            info!(source = %source, id, "Shared downloader created");
                            downloaders.insert(source.clone(), Arc::clone(&resource));
                            resource
                        }
                        Err(e) => {
                            self.downloader_ids.lock().release(id);
                            return Err(e);
                        }
                    }
                }
            }
        };

        Ok(ProjectDownloadBinding::attach(resource, target, range))
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
