//! One project's plugin pipelines and their lifecycle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::progress::ProgressTracker;
use super::status::StatusBoard;
use super::types::{
    PluginProgress, SchedulerError, SchedulerEvent, SchedulerStatus, StageProgress, StageWorkers,
};
use crate::cache::{
    CacheEvent, CacheObserver, CacheScope, DateKey, IncrementalCache, PersistenceStore,
    RecordQuery, StoreError, SubscriptionId,
};
use crate::download::{DownloadError, DownloadFactory, ProjectDownloadBinding, SourceId};
use crate::project::{CompositionStrategy, DateRange, ProjectDescriptor, ProjectLayout, SummaryDefinition};
use crate::registry::{FactoryContext, PluginMetadata, PluginRegistry};
use crate::stage::{
    PipelineStage, PipelineStageKind, RunState, RunStateCell, StageEvent, StageEventSink,
    StageSettings, WorkerPool,
};

/// Hands out project-scoped bindings to shared downloaders.
pub trait DownloaderProvider: Send + Sync {
    fn acquire_shared_downloader(
        &self,
        factory: Arc<dyn DownloadFactory>,
        target: Arc<IncrementalCache>,
        range: DateRange,
    ) -> Result<Arc<ProjectDownloadBinding>, DownloadError>;
}

/// What a scheduler borrows from its owner at construction.
pub struct SchedulerDeps<'a> {
    pub store: Arc<dyn PersistenceStore>,
    pub registry: &'a PluginRegistry,
    pub workers: WorkerPool,
    pub downloads: &'a dyn DownloaderProvider,
    pub board: Arc<StatusBoard>,
    pub log_capacity: usize,
}

/// The four caches and stages of one plugin within a project.
struct PluginPipeline {
    plugin: String,
    metadata: PluginMetadata,
    indices: Vec<String>,
    summaries: Vec<SummaryDefinition>,
    caches: Vec<Arc<IncrementalCache>>,
    stages: Vec<Arc<PipelineStage>>,
    bindings: Vec<Arc<ProjectDownloadBinding>>,
    progress: ProgressTracker,
}

impl PluginPipeline {
    fn cache(&self, kind: PipelineStageKind) -> &Arc<IncrementalCache> {
        &self.caches[kind.index()]
    }

    fn stage_of(&self, scope: &CacheScope) -> Option<PipelineStageKind> {
        self.caches
            .iter()
            .find(|cache| cache.scope() == scope)
            .map(|cache| cache.scope().stage)
    }

    /// Dates with primary download data.
    fn download_dates(&self) -> Result<u64, StoreError> {
        let query = match self.bindings.first() {
            Some(binding) => RecordQuery::new().with_data_name(binding.resource().data_name()),
            None => RecordQuery::new(),
        };
        self.cache(PipelineStageKind::Download).count_dates(&query)
    }

    fn snapshot(&self) -> Result<PluginProgress, StoreError> {
        let mut progress = PluginProgress::new(&self.plugin);

        let download = self.cache(PipelineStageKind::Download);
        for binding in &self.bindings {
            let name = binding.resource().data_name();
            let produced = download.count_dates(&RecordQuery::new().with_data_name(name))?;
            let entry = self.progress.progress(PipelineStageKind::Download, name, produced, || {
                Ok(binding.expected_count())
            })?;
            progress.download.insert(name.to_string(), entry);
        }

        let outputs_per_day = u64::from(self.metadata.process_outputs_per_day);
        let produced = self.cache(PipelineStageKind::Process).count(&RecordQuery::new())?;
        progress.process = self.progress.progress(PipelineStageKind::Process, "", produced, || {
            Ok(Some(outputs_per_day * self.download_dates()?))
        })?;

        let indices = self.indices.len() as u64;
        let produced = self.cache(PipelineStageKind::Index).count(&RecordQuery::new())?;
        progress.index = self.progress.progress(PipelineStageKind::Index, "", produced, || {
            let dates = self
                .cache(PipelineStageKind::Process)
                .count_dates(&RecordQuery::new())?;
            Ok(Some(indices * dates))
        })?;

        for summary in &self.summaries {
            let entry = self.summary_progress(summary, indices)?;
            progress.summary.insert(summary.id.clone(), entry);
        }

        progress.workers = self
            .stages
            .iter()
            .map(|stage| {
                let (queued, active) = stage.worker_counts();
                StageWorkers {
                    stage: stage.kind(),
                    queued,
                    active,
                }
            })
            .collect();

        Ok(progress)
    }

    fn summary_progress(
        &self,
        summary: &SummaryDefinition,
        indices: u64,
    ) -> Result<StageProgress, StoreError> {
        let index_cache = self.cache(PipelineStageKind::Index);
        let summary_cache = self.cache(PipelineStageKind::Summarize);
        let query = RecordQuery::new().with_data_name_prefix(summary.output_prefix());

        // Temporal summaries only count complete composites.
        let (composites, produced) = match (summary.temporal, index_cache.date_span()?) {
            (Some(strategy), Some((first, last))) => match complete_window(strategy, first, last) {
                Some((from, to)) => (
                    Some(count_composites(strategy, first, last)),
                    summary_cache.count(&query.with_from(from).with_to(to))?,
                ),
                None => (Some(0), 0),
            },
            (Some(_), None) => (Some(0), 0),
            (None, _) => (None, summary_cache.count(&query)?),
        };

        self.progress
            .progress(PipelineStageKind::Summarize, &summary.id, produced, || {
                let units = match composites {
                    Some(count) => count,
                    None => index_cache.count_dates(&RecordQuery::new())?,
                };
                Ok(Some(indices * units))
            })
    }

    fn detach(&self) {
        for stage in &self.stages {
            stage.detach();
        }
        for binding in &self.bindings {
            binding.detach();
        }
    }
}

/// Composite starts of the complete composites within `[first, last]`, as
/// an inclusive window over summary record dates.
fn complete_window(
    strategy: CompositionStrategy,
    first: DateKey,
    last: DateKey,
) -> Option<(DateKey, DateKey)> {
    let (first_date, last_date) = (first.to_date()?, last.to_date()?);
    let last_start = strategy.composite_start(last_date);
    let last_end = last_start + chrono::Duration::days(strategy.days_in_composite(last_start) as i64 - 1);
    let upper = if last_end == last_date {
        last_start
    } else {
        last_start.pred_opt()?
    };
    (upper >= first_date).then(|| (first, DateKey::from_date(upper)))
}

fn count_composites(strategy: CompositionStrategy, first: DateKey, last: DateKey) -> u64 {
    match (first.to_date(), last.to_date()) {
        (Some(first), Some(last)) => strategy.complete_composites(first, last),
        _ => 0,
    }
}

/// Wires the four pipeline stages of every plugin of one project and
/// exposes their lifecycle and status.
pub struct ProjectScheduler {
    id: u32,
    descriptor: ProjectDescriptor,
    layout: ProjectLayout,
    state: Arc<RunStateCell>,
    pipelines: Vec<PluginPipeline>,
    board: Arc<StatusBoard>,
    log: Mutex<VecDeque<String>>,
    log_capacity: usize,
    up_to_date: AtomicBool,
    /// Progress changed since the last published snapshot.
    dirty: AtomicBool,
    last_update: Mutex<Option<DateTime<Utc>>>,
    subscriptions: Mutex<Vec<(Arc<IncrementalCache>, SubscriptionId)>>,
    status_lock: Mutex<()>,
}

impl ProjectScheduler {
    /// Build every plugin pipeline of `descriptor`. The scheduler starts
    /// out stopped.
    pub fn new(
        id: u32,
        descriptor: ProjectDescriptor,
        deps: &SchedulerDeps<'_>,
    ) -> Result<Arc<Self>, SchedulerError> {
        descriptor.validate()?;
        let layout = ProjectLayout::new(&descriptor.working_dir, &descriptor.name);
        let state = Arc::new(RunStateCell::new());
        let range = descriptor.date_range();

        let mut pipelines = Vec::with_capacity(descriptor.plugins.len());
        for plugin in &descriptor.plugins {
            let definition = deps.registry.get(&plugin.name)?;
            layout.provision(&plugin.name)?;

            let ctx = FactoryContext {
                project: &descriptor,
                plugin,
                layout: &layout,
            };
            let mut implementations = vec![
                Vec::new(),
                definition.build_processors(&ctx)?,
                definition.build_indices(&ctx)?,
                definition.build_summaries(&ctx)?,
            ];

            let caches: Vec<Arc<IncrementalCache>> = PipelineStageKind::ALL
                .iter()
                .map(|kind| {
                    Arc::new(IncrementalCache::new(
                        CacheScope::project(&descriptor.name, &plugin.name, *kind),
                        Arc::clone(&deps.store),
                    ))
                })
                .collect();

            let stages = PipelineStageKind::ALL
                .iter()
                .zip(implementations.drain(..))
                .map(|(kind, stage_impls)| {
                    let required_data_names = match kind {
                        PipelineStageKind::Process => definition.required_data_names(),
                        PipelineStageKind::Summarize => plugin.indices.clone(),
                        _ => Vec::new(),
                    };
                    let settings = StageSettings {
                        project: descriptor.name.clone(),
                        plugin: plugin.name.clone(),
                        kind: *kind,
                        layout: layout.clone(),
                        indices: plugin.indices.clone(),
                        required_data_names,
                    };
                    PipelineStage::new(
                        settings,
                        kind.previous().map(|prev| Arc::clone(&caches[prev.index()])),
                        Arc::clone(&caches[kind.index()]),
                        stage_impls,
                        Arc::clone(&state),
                        deps.workers.clone(),
                    )
                })
                .collect();

            let mut bindings = Vec::with_capacity(definition.downloads().len());
            for factory in definition.downloads() {
                bindings.push(deps.downloads.acquire_shared_downloader(
                    Arc::clone(factory),
                    Arc::clone(&caches[PipelineStageKind::Download.index()]),
                    range,
                )?);
            }

            pipelines.push(PluginPipeline {
                plugin: plugin.name.clone(),
                metadata: definition.metadata.clone(),
                indices: plugin.indices.clone(),
                summaries: descriptor.summaries.clone(),
                caches,
                stages,
                bindings,
                progress: ProgressTracker::new(
                    &descriptor.name,
                    &plugin.name,
                    Arc::clone(&deps.store),
                ),
            });
        }

        let scheduler = Arc::new(Self {
            id,
            descriptor,
            layout,
            state,
            pipelines,
            board: Arc::clone(&deps.board),
            log: Mutex::new(VecDeque::new()),
            log_capacity: deps.log_capacity.max(1),
            up_to_date: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            last_update: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            status_lock: Mutex::new(()),
        });

        let observer = Arc::downgrade(&scheduler) as Weak<dyn CacheObserver>;
        let sink = Arc::downgrade(&scheduler) as Weak<dyn StageEventSink>;
        {
            let mut subscriptions = scheduler.subscriptions.lock();
            for pipeline in &scheduler.pipelines {
                for cache in &pipeline.caches {
                    let id = cache.subscribe(observer.clone());
                    subscriptions.push((Arc::clone(cache), id));
                }
                for stage in &pipeline.stages {
                    stage.set_event_sink(sink.clone());
                }
            }
        }

        info!(
            id,
            project = %scheduler.descriptor.name,
            plugins = scheduler.pipelines.len(),
            "Scheduler created"
        );
        scheduler.push_log("Created");
        scheduler.notify_ui(SchedulerEvent::Lifecycle);
        Ok(scheduler)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ProjectDescriptor {
        &self.descriptor
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn is_retired(&self) -> bool {
        self.state.is_retired()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date.load(Ordering::SeqCst)
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.lock()
    }

    /// Running and not updated within `interval`.
    pub fn needs_update(&self, interval: Duration) -> bool {
        if self.state() != RunState::Running {
            return false;
        }
        match self.last_update() {
            None => true,
            Some(last) => chrono::Duration::from_std(interval)
                .map(|interval| Utc::now() - last >= interval)
                .unwrap_or(false),
        }
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.pipelines
            .iter()
            .flat_map(|p| p.bindings.iter().map(|b| b.source_id().clone()))
            .collect()
    }

    pub fn references_source(&self, source: &SourceId) -> bool {
        self.pipelines
            .iter()
            .any(|p| p.bindings.iter().any(|b| b.source_id() == source))
    }

    /// Output cache of `kind` for `plugin`.
    pub fn cache(&self, plugin: &str, kind: PipelineStageKind) -> Option<Arc<IncrementalCache>> {
        self.pipelines
            .iter()
            .find(|p| p.plugin == plugin)
            .map(|p| Arc::clone(p.cache(kind)))
    }

    /// Stopped -> Running, then ask every cache to re-scan for produced but
    /// unconsumed work. Returns false if the scheduler was not stopped.
    pub fn start(&self) -> bool {
        if !self.state.begin_start() {
            return false;
        }
        self.state.finish_start();
        info!(id = self.id, project = %self.descriptor.name, "Scheduler started");
        self.push_log("Started");

        for pipeline in &self.pipelines {
            for binding in &pipeline.bindings {
                if let Err(e) = binding.load_new() {
                    warn!(
                        project = %self.descriptor.name,
                        plugin = %pipeline.plugin,
                        source = %binding.source_id(),
                        "Failed to load shared downloads: {}",
                        e
                    );
                }
            }
            for cache in &pipeline.caches {
                cache.notify_observers_to_check_for_past_updates();
            }
        }

        self.notify_ui(SchedulerEvent::Lifecycle);
        true
    }

    /// Stop dispatching new units. In-flight units finish.
    pub fn stop(&self) -> bool {
        if self.state.stop() == RunState::Stopped {
            return false;
        }
        info!(id = self.id, project = %self.descriptor.name, "Scheduler stopped");
        self.push_log("Stopped");
        self.notify_ui(SchedulerEvent::Lifecycle);
        true
    }

    /// Load whatever the shared downloaders hold for this project, start,
    /// and recompute the up-to-date flag.
    pub fn attempt_update(&self) -> usize {
        if self.is_retired() {
            return 0;
        }

        let mut loaded = 0;
        for pipeline in &self.pipelines {
            pipeline.progress.invalidate_all();
            for binding in &pipeline.bindings {
                match binding.attempt_update() {
                    Ok(changed) => loaded += changed,
                    Err(e) => {
                        warn!(
                            project = %self.descriptor.name,
                            plugin = %pipeline.plugin,
                            source = %binding.source_id(),
                            "Update failed: {}",
                            e
                        );
                        self.push_log(format!("Update of {} failed: {}", binding.source_id(), e));
                    }
                }
            }
        }

        self.start();
        *self.last_update.lock() = Some(Utc::now());
        let status = self.publish(true);
        debug!(
            project = %self.descriptor.name,
            loaded,
            up_to_date = status.up_to_date,
            "Attempted update"
        );
        loaded
    }

    /// Stop for good and disconnect from every cache and downloader.
    /// In-flight units finish and their output is discarded.
    pub fn retire(&self) {
        {
            let _guard = self.status_lock.lock();
            self.state.retire();
        }
        for pipeline in &self.pipelines {
            pipeline.detach();
        }
        for (cache, id) in self.subscriptions.lock().drain(..) {
            cache.unsubscribe(id);
        }
        info!(id = self.id, project = %self.descriptor.name, "Scheduler deleted");
    }

    /// Route an event into the status snapshot. Lifecycle changes are
    /// published at once; progress is published by [`Self::publish_if_dirty`].
    pub fn notify_ui(&self, event: SchedulerEvent) {
        match &event {
            SchedulerEvent::Stage(stage_event) if !stage_event.success => {
                self.push_log(format!(
                    "{} {} failed for {}: {}",
                    stage_event.stage,
                    stage_event.implementation,
                    stage_event.date,
                    stage_event.message.as_deref().unwrap_or("unknown error")
                ));
            }
            SchedulerEvent::Cache(scope) => {
                for pipeline in &self.pipelines {
                    if let Some(kind) = pipeline.stage_of(scope) {
                        pipeline.progress.invalidate_from(kind);
                    }
                }
            }
            SchedulerEvent::Lifecycle => {
                self.publish(false);
                return;
            }
            _ => {}
        }
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Publish a snapshot if progress changed since the last one.
    pub fn publish_if_dirty(&self) -> bool {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.publish(false);
        true
    }

    /// A fresh snapshot, not published.
    pub fn status(&self) -> SchedulerStatus {
        self.snapshot(false)
    }

    fn publish(&self, recompute_up_to_date: bool) -> SchedulerStatus {
        let _guard = self.status_lock.lock();
        self.dirty.store(false, Ordering::SeqCst);
        let status = self.snapshot(recompute_up_to_date);
        if !self.state.is_retired() {
            self.board.publish(status.clone());
        }
        status
    }

    fn snapshot(&self, recompute_up_to_date: bool) -> SchedulerStatus {
        let plugins: Vec<PluginProgress> = self
            .pipelines
            .iter()
            .map(|pipeline| {
                pipeline.snapshot().unwrap_or_else(|e| {
                    warn!(
                        project = %self.descriptor.name,
                        plugin = %pipeline.plugin,
                        "Failed to compute progress: {}",
                        e
                    );
                    PluginProgress::new(&pipeline.plugin)
                })
            })
            .collect();

        if recompute_up_to_date {
            let up_to_date = plugins.iter().all(PluginProgress::is_complete);
            self.up_to_date.store(up_to_date, Ordering::SeqCst);
        }

        SchedulerStatus {
            id: self.id,
            project_name: self.descriptor.name.clone(),
            state: self.state.get(),
            plugins,
            up_to_date: self.up_to_date.load(Ordering::SeqCst),
            log: self.log.lock().iter().cloned().collect(),
            last_update: self.last_update(),
            updated_at: Utc::now(),
        }
    }

    fn push_log(&self, line: impl Into<String>) {
        let mut log = self.log.lock();
        log.push_back(format!(
            "{} {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            line.into()
        ));
        while log.len() > self.log_capacity {
            log.pop_front();
        }
    }
}

impl CacheObserver for ProjectScheduler {
    fn on_cache_changed(&self, scope: &CacheScope, _event: CacheEvent) {
        self.notify_ui(SchedulerEvent::Cache(scope.clone()));
    }
}

impl StageEventSink for ProjectScheduler {
    fn on_stage_event(&self, event: StageEvent) {
        self.notify_ui(SchedulerEvent::Stage(event));
    }
}
