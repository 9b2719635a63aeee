//! The generic fan-out engine behind every stage kind.
//!
//! Input rows are grouped into work units. A unit is one day, except for
//! temporal summaries, whose unit is a whole composite that only becomes
//! ready once every day of it has its inputs. A row is marked processed
//! once every unit covering it has consumed it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::pool::WorkerPool;
use super::traits::{StageError, StageEventSink, StageUnitProcessor};
use super::types::{PipelineStageKind, RunStateCell, StageEvent, UnitContext};
use crate::cache::{
    CacheEntry, CacheEvent, CacheObserver, CacheScope, CachedFileRecord, DateKey,
    IncrementalCache, RecordQuery, SubscriptionId,
};
use crate::metrics::{STAGE_UNITS, STAGE_UNIT_DURATION};
use crate::project::{CompositionStrategy, ProjectLayout, SummaryDefinition};

/// One collaborator a stage runs for every work unit.
pub struct StageImplementation {
    pub name: String,
    pub processor: Arc<dyn StageUnitProcessor>,
    /// Set for summary implementations.
    pub summary: Option<SummaryDefinition>,
}

impl StageImplementation {
    pub fn new(name: impl Into<String>, processor: Arc<dyn StageUnitProcessor>) -> Self {
        Self {
            name: name.into(),
            processor,
            summary: None,
        }
    }

    pub fn for_summary(summary: SummaryDefinition, processor: Arc<dyn StageUnitProcessor>) -> Self {
        Self {
            name: summary.id.clone(),
            processor,
            summary: Some(summary),
        }
    }

    fn composition(&self) -> Option<CompositionStrategy> {
        self.summary.as_ref().and_then(|summary| summary.temporal)
    }
}

impl fmt::Debug for StageImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageImplementation")
            .field("name", &self.name)
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

/// Identity and dispatch rules of one stage.
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub project: String,
    pub plugin: String,
    pub kind: PipelineStageKind,
    pub layout: ProjectLayout,
    pub indices: Vec<String>,
    /// A day is only ready once every one of these data names is cached.
    pub required_data_names: Vec<String>,
}

/// Implementations that share one way of cutting dates into units.
struct UnitGroup {
    composition: Option<CompositionStrategy>,
    implementations: Vec<Arc<StageImplementation>>,
}

impl UnitGroup {
    fn from_implementations(implementations: Vec<StageImplementation>) -> Vec<UnitGroup> {
        let mut groups: Vec<UnitGroup> = Vec::new();
        for implementation in implementations {
            let composition = implementation.composition();
            let implementation = Arc::new(implementation);
            match groups.iter_mut().find(|g| g.composition == composition) {
                Some(group) => group.implementations.push(implementation),
                None => groups.push(UnitGroup {
                    composition,
                    implementations: vec![implementation],
                }),
            }
        }
        groups
    }

    /// First day of the unit containing `date`.
    fn unit_start(&self, date: DateKey) -> DateKey {
        match (self.composition, date.to_date()) {
            (Some(strategy), Some(day)) => DateKey::from_date(strategy.composite_start(day)),
            _ => date,
        }
    }

    /// Every day of the unit starting at `start`, in order.
    fn unit_days(&self, start: DateKey) -> Vec<DateKey> {
        match (self.composition, start.to_date()) {
            (Some(strategy), Some(day)) => (0..strategy.days_in_composite(day) as i64)
                .filter_map(|offset| day.checked_add_signed(chrono::Duration::days(offset)))
                .map(DateKey::from_date)
                .collect(),
            _ => vec![start],
        }
    }

    fn unit_end(&self, start: DateKey) -> DateKey {
        self.unit_days(start).last().copied().unwrap_or(start)
    }
}

/// A work unit: one group's unit starting on `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct UnitKey {
    group: usize,
    start: DateKey,
}

/// Completion bookkeeping for one dispatched unit.
struct UnitTracker {
    remaining: AtomicUsize,
    failed: AtomicBool,
    max_seq: i64,
    dates: Vec<DateKey>,
}

pub struct PipelineStage {
    settings: StageSettings,
    input: Option<Arc<IncrementalCache>>,
    output: Arc<IncrementalCache>,
    groups: Vec<UnitGroup>,
    state: Arc<RunStateCell>,
    pool: WorkerPool,
    sink: OnceLock<Weak<dyn StageEventSink>>,
    in_flight: Mutex<HashSet<UnitKey>>,
    /// Highest input sequence each unit consumed successfully.
    consumed: Mutex<HashMap<UnitKey, i64>>,
    subscription: Mutex<Option<SubscriptionId>>,
    queued: AtomicUsize,
    active: AtomicUsize,
    self_ref: Weak<PipelineStage>,
}

impl PipelineStage {
    /// Create the stage and subscribe it to its input cache.
    pub fn new(
        settings: StageSettings,
        input: Option<Arc<IncrementalCache>>,
        output: Arc<IncrementalCache>,
        implementations: Vec<StageImplementation>,
        state: Arc<RunStateCell>,
        pool: WorkerPool,
    ) -> Arc<Self> {
        let stage = Arc::new_cyclic(|weak| Self {
            settings,
            input,
            output,
            groups: UnitGroup::from_implementations(implementations),
            state,
            pool,
            sink: OnceLock::new(),
            in_flight: Mutex::new(HashSet::new()),
            consumed: Mutex::new(HashMap::new()),
            subscription: Mutex::new(None),
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            self_ref: weak.clone(),
        });

        if let Some(input) = &stage.input {
            let observer: Arc<dyn CacheObserver> = stage.clone();
            let id = input.subscribe(Arc::downgrade(&observer));
            *stage.subscription.lock() = Some(id);
        }

        stage
    }

    pub fn set_event_sink(&self, sink: Weak<dyn StageEventSink>) {
        let _ = self.sink.set(sink);
    }

    pub fn kind(&self) -> PipelineStageKind {
        self.settings.kind
    }

    pub fn input(&self) -> Option<&Arc<IncrementalCache>> {
        self.input.as_ref()
    }

    pub fn output(&self) -> &Arc<IncrementalCache> {
        &self.output
    }

    pub fn implementation_names(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.implementations.iter().map(|i| i.name.clone()))
            .collect()
    }

    /// Tasks of this stage waiting for a pool slot, and running.
    pub fn worker_counts(&self) -> (usize, usize) {
        (
            self.queued.load(Ordering::SeqCst),
            self.active.load(Ordering::SeqCst),
        )
    }

    pub fn in_flight_units(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Stop listening to the input cache.
    pub fn detach(&self) {
        if let (Some(input), Some(id)) = (&self.input, self.subscription.lock().take()) {
            input.unsubscribe(id);
        }
    }

    /// Scan the input cache and dispatch every ready unit not already in
    /// flight.
    ///
    /// Returns the number of units dispatched.
    pub fn dispatch_pending(&self) -> usize {
        let Some(input) = &self.input else {
            return 0;
        };
        if !self.state.accepts_work() || self.groups.is_empty() {
            return 0;
        }

        match input.unprocessed_records() {
            Ok(entries) => self.dispatch_entries(&entries),
            Err(e) => {
                warn!(
                    project = %self.settings.project,
                    plugin = %self.settings.plugin,
                    stage = %self.settings.kind,
                    "Failed to read unprocessed input: {}",
                    e
                );
                0
            }
        }
    }

    fn dispatch_entries(&self, entries: &[CacheEntry]) -> usize {
        let mut dispatched = 0;
        for (index, group) in self.groups.iter().enumerate() {
            let mut units: BTreeMap<DateKey, Vec<CacheEntry>> = BTreeMap::new();
            for entry in entries {
                units
                    .entry(group.unit_start(entry.record.date))
                    .or_default()
                    .push(entry.clone());
            }

            for (start, pending) in units {
                let key = UnitKey {
                    group: index,
                    start,
                };
                let newest = pending.iter().map(|e| e.seq).max().unwrap_or(0);
                if self
                    .consumed
                    .lock()
                    .get(&key)
                    .is_some_and(|seq| *seq >= newest)
                {
                    continue;
                }

                let inputs = match group.composition {
                    None => pending,
                    Some(_) => match self.composite_inputs(group, start) {
                        Some(inputs) => inputs,
                        None => continue,
                    },
                };
                if !self.has_required_inputs(group, start, &inputs) {
                    debug!(
                        project = %self.settings.project,
                        plugin = %self.settings.plugin,
                        stage = %self.settings.kind,
                        date = %start,
                        "Waiting for remaining inputs"
                    );
                    continue;
                }
                if !self.in_flight.lock().insert(key) {
                    continue;
                }
                self.dispatch_unit(key, inputs);
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Every row of the composite starting at `start`, consumed or not.
    fn composite_inputs(&self, group: &UnitGroup, start: DateKey) -> Option<Vec<CacheEntry>> {
        let input = self.input.as_ref()?;
        let query = RecordQuery::new()
            .with_from(start)
            .with_to(group.unit_end(start));
        match input.records(&query) {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!(
                    project = %self.settings.project,
                    stage = %self.settings.kind,
                    date = %start,
                    "Failed to read composite input: {}",
                    e
                );
                None
            }
        }
    }

    fn has_required_inputs(&self, group: &UnitGroup, start: DateKey, inputs: &[CacheEntry]) -> bool {
        let required = &self.settings.required_data_names;
        group.unit_days(start).into_iter().all(|day| {
            let present: BTreeSet<&str> = inputs
                .iter()
                .filter(|e| e.record.date == day)
                .map(|e| e.record.data_name.as_str())
                .collect();
            if required.is_empty() {
                // A composite needs something for each of its days
                return group.composition.is_none() || !present.is_empty();
            }
            required.iter().all(|name| present.contains(name.as_str()))
        })
    }

    fn dispatch_unit(&self, key: UnitKey, entries: Vec<CacheEntry>) {
        let Some(me) = self.self_ref.upgrade() else {
            self.in_flight.lock().remove(&key);
            return;
        };
        let group = &self.groups[key.group];

        let max_seq = entries.iter().map(|e| e.seq).max().unwrap_or(0);
        let dates: BTreeSet<DateKey> = entries.iter().map(|e| e.record.date).collect();
        let inputs: Arc<Vec<CachedFileRecord>> =
            Arc::new(entries.into_iter().map(|e| e.record).collect());
        let tracker = Arc::new(UnitTracker {
            remaining: AtomicUsize::new(group.implementations.len()),
            failed: AtomicBool::new(false),
            max_seq,
            dates: dates.into_iter().collect(),
        });

        debug!(
            project = %self.settings.project,
            plugin = %self.settings.plugin,
            stage = %self.settings.kind,
            date = %key.start,
            inputs = inputs.len(),
            "Dispatching work unit"
        );

        for implementation in &group.implementations {
            let stage = Arc::clone(&me);
            let implementation = Arc::clone(implementation);
            let inputs = Arc::clone(&inputs);
            let unit_tracker = Arc::clone(&tracker);

            self.queued.fetch_add(1, Ordering::SeqCst);
            let submitted = self.pool.submit(async move {
                stage.run_unit(implementation, key, inputs, unit_tracker).await
            });
            if !submitted {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                self.complete_one(key, &tracker, false);
            }
        }
    }

    async fn run_unit(
        self: Arc<Self>,
        implementation: Arc<StageImplementation>,
        key: UnitKey,
        inputs: Arc<Vec<CachedFileRecord>>,
        tracker: Arc<UnitTracker>,
    ) -> bool {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);

        let date = key.start;
        let stage_label = self.settings.kind.as_str();
        let ctx = self.unit_context(&implementation, date);

        let (success, produced, message) = if !self.state.accepts_work() {
            debug!(
                project = %self.settings.project,
                plugin = %self.settings.plugin,
                stage = %self.settings.kind,
                %date,
                "Skipping unit, scheduler is not running"
            );
            (false, 0, Some("skipped: scheduler not running".to_string()))
        } else {
            let timer = STAGE_UNIT_DURATION
                .with_label_values(&[stage_label])
                .start_timer();
            let result = AssertUnwindSafe(implementation.processor.run(&inputs, &ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(StageError::Failed("unit of work panicked".to_string())));
            timer.observe_duration();

            match result {
                Ok(_) if self.state.is_retired() => {
                    debug!(
                        project = %self.settings.project,
                        %date,
                        "Discarding output of deleted scheduler"
                    );
                    (true, 0, None)
                }
                Ok(outputs) => match self.output.cache_files(outputs) {
                    Ok(changed) => (true, changed, None),
                    Err(e) => {
                        warn!(
                            project = %self.settings.project,
                            plugin = %self.settings.plugin,
                            stage = %self.settings.kind,
                            implementation = %implementation.name,
                            %date,
                            "Failed to cache unit output: {}",
                            e
                        );
                        (false, 0, Some(e.to_string()))
                    }
                },
                Err(e) => {
                    warn!(
                        project = %self.settings.project,
                        plugin = %self.settings.plugin,
                        stage = %self.settings.kind,
                        implementation = %implementation.name,
                        %date,
                        "Unit of work failed: {}",
                        e
                    );
                    (false, 0, Some(e.to_string()))
                }
            }
        };

        STAGE_UNITS
            .with_label_values(&[stage_label, if success { "success" } else { "failure" }])
            .inc();
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.report(StageEvent {
            stage: self.settings.kind,
            plugin: self.settings.plugin.clone(),
            implementation: implementation.name.clone(),
            date,
            produced,
            success,
            message,
        });
        self.complete_one(key, &tracker, success);
        success
    }

    fn complete_one(&self, key: UnitKey, tracker: &UnitTracker, success: bool) {
        if !success {
            tracker.failed.store(true, Ordering::SeqCst);
        }
        if tracker.remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }

        let all_succeeded = !tracker.failed.load(Ordering::SeqCst);
        if all_succeeded && !self.state.is_retired() {
            {
                let mut consumed = self.consumed.lock();
                let seq = consumed.entry(key).or_insert(tracker.max_seq);
                *seq = (*seq).max(tracker.max_seq);
            }
            self.mark_consumed(&tracker.dates);
        }
        self.in_flight.lock().remove(&key);

        // Inputs for this unit may have arrived while it was in flight.
        if all_succeeded && self.state.accepts_work() {
            if let Some(input) = &self.input {
                let group = &self.groups[key.group];
                let query = RecordQuery::new()
                    .unprocessed()
                    .with_from(key.start)
                    .with_to(group.unit_end(key.start));
                match input.records(&query) {
                    Ok(entries) if !entries.is_empty() => {
                        self.dispatch_entries(&entries);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to re-scan {} for {}: {}", input.scope(), key.start, e),
                }
            }
        }
    }

    /// Mark rows of `dates` processed up to the lowest sequence every group
    /// has consumed for them.
    fn mark_consumed(&self, dates: &[DateKey]) {
        let Some(input) = &self.input else {
            return;
        };

        let bounds: Vec<(DateKey, i64)> = {
            let consumed = self.consumed.lock();
            dates
                .iter()
                .filter_map(|date| {
                    let seqs = self
                        .groups
                        .iter()
                        .enumerate()
                        .map(|(group, g)| {
                            consumed
                                .get(&UnitKey {
                                    group,
                                    start: g.unit_start(*date),
                                })
                                .copied()
                        })
                        .collect::<Option<Vec<i64>>>()?;
                    seqs.into_iter().min().map(|bound| (*date, bound))
                })
                .collect()
        };

        for (date, bound) in bounds {
            if let Err(e) = input.mark_processed(date, bound) {
                warn!(
                    project = %self.settings.project,
                    stage = %self.settings.kind,
                    %date,
                    "Failed to mark input processed: {}",
                    e
                );
            }
        }
    }

    fn unit_context(&self, implementation: &StageImplementation, date: DateKey) -> UnitContext {
        let mut ctx = UnitContext {
            project: self.settings.project.clone(),
            plugin: self.settings.plugin.clone(),
            stage: self.settings.kind,
            implementation: implementation.name.clone(),
            date,
            output_dir: Default::default(),
            indices: self.settings.indices.clone(),
            summary: implementation.summary.clone(),
        };
        ctx.output_dir =
            self.settings
                .layout
                .unit_dir(&self.settings.plugin, self.settings.kind, ctx.output_date());
        ctx
    }

    fn report(&self, event: StageEvent) {
        if let Some(sink) = self.sink.get().and_then(|sink| sink.upgrade()) {
            sink.on_stage_event(event);
        }
    }
}

impl CacheObserver for PipelineStage {
    fn on_cache_changed(&self, _scope: &CacheScope, _event: CacheEvent) {
        self.dispatch_pending();
    }
}
