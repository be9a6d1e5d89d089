// crates/curlew-ingest/src/scheduler.rs
// ============================================================================
// Module: Ingest Queue & Flush Scheduler
// Description: Producer queue, latency/threshold flush, and resend queue.
// Purpose: Decouple producers from storage latency while bounding
//          end-to-end ingestion delay.
// Dependencies: curlew-core, serde_json, thiserror, tracing
// ============================================================================

//! ## Overview
//! Producers append to the active queue; when it reaches the configured
//! threshold (or the service is stopping) it rotates onto the full-queue
//! stack and the flush worker is notified. The worker drains the resend
//! queue first, then full queues, then the current active queue, passing
//! each batch through the filter pipeline before persisting it. A batch
//! that fails to persist moves to the resend tail; after six consecutive
//! failures of the same batch its first five readings are dropped and
//! counted as discarded, so one malformed reading cannot stall the pipeline
//! forever.
//!
//! The wait discipline bounds latency: with nothing pending the worker
//! sleeps on a condition variable for three quarters of the remaining flush
//! timeout, measured from the age of the oldest queued reading.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use curlew_core::AssetTrackerApi;
use curlew_core::Reading;
use curlew_core::ReadingSet;
use curlew_core::ReadingsAppender;
use curlew_core::StatisticsSink;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::pipeline::FilterPipeline;
use crate::pipeline::FilterRegistry;
use crate::pipeline::PipelineError;
use crate::stats::AssetTracker;
use crate::stats::StatsShared;
use crate::stats::StatsSnapshot;
use crate::stats::ensure_base_statistics;
use crate::stats::flush_statistics;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Consecutive failures of one batch before its head readings are dropped.
const MAX_BATCH_FAILURES: u32 = 5;
/// Readings dropped from a poisoned batch once the failure cap is hit.
const POISON_DROP_COUNT: usize = 5;
/// Idle sleep while the scheduler is paused for reconfiguration.
const PAUSED_POLL: Duration = Duration::from_millis(100);
/// Pause between retries while the resend queue is non-empty.
const RESEND_RETRY_PAUSE: Duration = Duration::from_millis(50);
/// Stats worker wait bound, so shutdown is observed promptly.
const STATS_WAIT: Duration = Duration::from_millis(250);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Scheduler startup failure.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The initial filter chain could not be built.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// A worker thread could not be spawned.
    #[error("failed to spawn ingest worker: {0}")]
    Spawn(String),
}

// ============================================================================
// SECTION: Options
// ============================================================================

/// Scheduler tuning and identity.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Maximum time before a queue of readings is flushed.
    pub flush_timeout: Duration,
    /// Queue length that triggers an immediate flush.
    pub queue_threshold: usize,
    /// South service name reported in asset-tracking tuples.
    pub service_name: String,
    /// South plugin name reported in asset-tracking tuples.
    pub plugin_name: String,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            flush_timeout: Duration::from_secs(5),
            queue_threshold: 100,
            service_name: "curlew-south".to_string(),
            plugin_name: "curlew".to_string(),
        }
    }
}

// ============================================================================
// SECTION: Shared State
// ============================================================================

/// Flush-worker bookkeeping surviving across process_queue calls.
#[derive(Debug, Default)]
struct FlushState {
    /// Consecutive failures of the batch at the resend head.
    fail_count: u32,
    /// Whether the storage layer is currently failing.
    storage_failed: bool,
    /// Failures observed during the current outage.
    stores_failed: u64,
    /// Whether the latency gauge is in the high state.
    high_latency: bool,
}

/// State shared between producers, the workers, and the handle.
struct Inner {
    /// Scheduler options.
    options: IngestOptions,
    /// Active producer queue; the condition variable pairs with it.
    active: Mutex<Vec<Reading>>,
    /// Flush worker wake-up.
    cv: Condvar,
    /// Rotated queues awaiting processing.
    full: Mutex<VecDeque<Vec<Reading>>>,
    /// Batches that failed to persist.
    resend: Mutex<VecDeque<Vec<Reading>>>,
    /// Worker bookkeeping.
    flush_state: Mutex<FlushState>,
    /// Filter chain; held for a batch's whole traversal.
    pipeline: Mutex<FilterPipeline>,
    /// Filter factories for hot reloads.
    registry: FilterRegistry,
    /// False while the pipeline is being reconfigured.
    running: AtomicBool,
    /// True once shutdown begins.
    shutdown: AtomicBool,
    /// Batch persistence seam.
    storage: Arc<dyn ReadingsAppender>,
    /// Statistics pending counters and worker wake-up.
    stats: StatsShared,
    /// Statistics table seam.
    stats_sink: Arc<dyn StatisticsSink>,
    /// Asset announcement dedup.
    tracker: AssetTracker,
}

// ============================================================================
// SECTION: Scheduler
// ============================================================================

/// Handle to the ingest scheduler and its workers.
pub struct Ingest {
    /// Shared state.
    inner: Arc<Inner>,
    /// Flush worker handle.
    flush_worker: Option<thread::JoinHandle<()>>,
    /// Stats worker handle.
    stats_worker: Option<thread::JoinHandle<()>>,
}

impl Ingest {
    /// Starts the scheduler: one flush worker and one stats worker.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] when the initial filter chain cannot be
    /// built or a worker thread cannot be spawned.
    pub fn start(
        options: IngestOptions,
        storage: Arc<dyn ReadingsAppender>,
        stats_sink: Arc<dyn StatisticsSink>,
        tracker_api: Arc<dyn AssetTrackerApi>,
        registry: FilterRegistry,
        filters: &[(String, Value)],
    ) -> Result<Self, IngestError> {
        let pipeline = registry.build(filters)?;
        let tracker =
            AssetTracker::new(tracker_api, &options.service_name, &options.plugin_name);
        let inner = Arc::new(Inner {
            options,
            active: Mutex::new(Vec::new()),
            cv: Condvar::new(),
            full: Mutex::new(VecDeque::new()),
            resend: Mutex::new(VecDeque::new()),
            flush_state: Mutex::new(FlushState::default()),
            pipeline: Mutex::new(pipeline),
            registry,
            running: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            storage,
            stats: StatsShared::default(),
            stats_sink,
            tracker,
        });

        let flush_inner = Arc::clone(&inner);
        let flush_worker = thread::Builder::new()
            .name("curlew-ingest".to_string())
            .spawn(move || flush_worker_loop(&flush_inner))
            .map_err(|err| IngestError::Spawn(err.to_string()))?;
        let stats_inner = Arc::clone(&inner);
        let stats_worker = thread::Builder::new()
            .name("curlew-stats".to_string())
            .spawn(move || stats_worker_loop(&stats_inner))
            .map_err(|err| IngestError::Spawn(err.to_string()))?;

        Ok(Self {
            inner,
            flush_worker: Some(flush_worker),
            stats_worker: Some(stats_worker),
        })
    }

    /// Queues one reading.
    pub fn ingest(&self, reading: Reading) {
        let rotated = {
            let mut active = self.inner.lock_active();
            active.push(reading);
            self.inner.take_if_due(&mut active)
        };
        // The full-queue mutex is taken only after the active queue is
        // released; the worker nests them the other way around.
        let pending = {
            let mut full = self.inner.lock_full();
            if let Some(batch) = rotated {
                full.push_back(batch);
            }
            !full.is_empty()
        };
        if pending {
            self.inner.cv.notify_all();
        }
    }

    /// Queues a batch of readings.
    pub fn ingest_many(&self, readings: Vec<Reading>) {
        let (rotated, queue_len) = {
            let mut active = self.inner.lock_active();
            active.extend(readings);
            let rotated = self.inner.take_if_due(&mut active);
            (rotated, active.len())
        };
        let pending = {
            let mut full = self.inner.lock_full();
            if let Some(batch) = rotated {
                full.push_back(batch);
            }
            !full.is_empty()
        };
        // Nudge the worker early once the queue is three quarters full.
        if pending || queue_len > self.inner.options.queue_threshold * 3 / 4 {
            self.inner.cv.notify_all();
        }
    }

    /// Approximate number of readings queued in the scheduler.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        let threshold = self.inner.options.queue_threshold;
        let mut length = self.inner.lock_active().len();
        length += self.inner.lock_full().len() * threshold;
        length += self.inner.lock_resend().len() * threshold;
        length
    }

    /// Pending statistics counters, for diagnostics and tests.
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Applies a configuration change for the service category (rebuilding
    /// the filter chain) or for one filter (delegated to the pipeline).
    pub fn config_change(&self, category: &str, config: &Value) {
        if category == self.inner.options.service_name {
            let entries = filter_entries(config);
            {
                let current = self.inner.lock_pipeline();
                let changed = current.names()
                    != entries.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>();
                if !changed {
                    info!("filter pipeline is unchanged");
                    return;
                }
            }
            // Quiesce the flush worker out of the pipeline, swap, resume.
            self.inner.running.store(false, Ordering::Release);
            {
                let mut pipeline = self.inner.lock_pipeline();
                match self.inner.registry.build(&entries) {
                    Ok(rebuilt) => {
                        *pipeline = rebuilt;
                        info!("filter pipeline recreated");
                    }
                    Err(err) => {
                        warn!(error = %err, "new filter pipeline rejected, keeping current chain");
                    }
                }
            }
            self.inner.running.store(true, Ordering::Release);
        } else {
            let mut pipeline = self.inner.lock_pipeline();
            if !pipeline.reconfigure_filter(category, config) {
                debug!(category, "configuration change matched no filter");
            }
        }
    }

    /// Stops both workers, draining residual queues synchronously.
    pub fn shutdown(&mut self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.running.store(false, Ordering::Release);
        self.inner.cv.notify_all();
        if let Some(worker) = self.flush_worker.take() {
            let _ = worker.join();
        }
        // Residual readings queued after the worker observed shutdown.
        process_queue(&self.inner);
        self.inner.stats.notify();
        if let Some(worker) = self.stats_worker.take() {
            let _ = worker.join();
        }
        let mut created = HashSet::new();
        ensure_base_statistics(self.inner.stats_sink.as_ref(), &mut created);
        flush_statistics(&self.inner.stats, self.inner.stats_sink.as_ref(), &mut created);
    }
}

impl Drop for Ingest {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// SECTION: Inner Helpers
// ============================================================================

impl Inner {
    /// Takes the active queue for rotation when the threshold is reached or
    /// the service is stopping. The caller pushes the result onto the full
    /// stack after releasing the active-queue mutex.
    fn take_if_due(&self, active: &mut Vec<Reading>) -> Option<Vec<Reading>> {
        if !active.is_empty()
            && (active.len() >= self.options.queue_threshold
                || !self.running.load(Ordering::Acquire))
        {
            Some(std::mem::take(active))
        } else {
            None
        }
    }

    /// Remaining wait before the oldest queued reading breaches the flush
    /// timeout.
    fn wait_budget(&self, active: &[Reading]) -> Duration {
        let timeout = self.options.flush_timeout;
        match active.first() {
            Some(oldest) => {
                timeout.saturating_sub(Duration::from_millis(oldest.user_ts.age_millis()))
            }
            None => timeout,
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Vec<Reading>> {
        self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_full(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<Reading>>> {
        self.full.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_resend(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<Reading>>> {
        self.resend.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_pipeline(&self) -> std::sync::MutexGuard<'_, FilterPipeline> {
        self.pipeline.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_flush_state(&self) -> std::sync::MutexGuard<'_, FlushState> {
        self.flush_state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Extracts ordered `(name, config)` filter entries from a service
/// category value (`{"filter": [{"name": ..., "config": ...}, ...]}`).
fn filter_entries(config: &Value) -> Vec<(String, Value)> {
    config
        .get("filter")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name").and_then(Value::as_str)?;
                    let config = entry.get("config").cloned().unwrap_or(Value::Null);
                    Some((name.to_string(), config))
                })
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// SECTION: Flush Worker
// ============================================================================

/// Flush worker body: wait, then process, until shutdown.
fn flush_worker_loop(inner: &Arc<Inner>) {
    while !inner.shutdown.load(Ordering::Acquire) {
        if inner.running.load(Ordering::Acquire) {
            wait_for_queue(inner);
            process_queue(inner);
        } else {
            thread::sleep(PAUSED_POLL);
        }
    }
}

/// Sleeps until a flush is due: notified, threshold reached, or three
/// quarters of the remaining latency budget elapsed.
fn wait_for_queue(inner: &Arc<Inner>) {
    if !inner.lock_full().is_empty() {
        return;
    }
    if !inner.lock_resend().is_empty() {
        // Storage is struggling; pace the retries instead of spinning.
        let active = inner.lock_active();
        let _unused = inner.cv.wait_timeout(active, RESEND_RETRY_PAUSE);
        return;
    }
    let active = inner.lock_active();
    if !inner.running.load(Ordering::Acquire) || active.len() >= inner.options.queue_threshold {
        return;
    }
    let budget = inner.wait_budget(&active);
    if budget.is_zero() {
        return;
    }
    let wait = budget.mul_f64(0.75);
    let _unused = inner.cv.wait_timeout(active, wait);
}

/// Drains the resend queue, then full queues, then the active queue.
fn process_queue(inner: &Arc<Inner>) {
    loop {
        drain_resend(inner);

        // Pick the next batch: a rotated queue if one is waiting, otherwise
        // swap out the active queue so producers stall only for the swap.
        let data = {
            let mut full = inner.lock_full();
            match full.pop_front() {
                Some(batch) => batch,
                None => std::mem::take(&mut *inner.lock_active()),
            }
        };
        if data.is_empty() {
            return;
        }

        // The pipeline mutex is held for the whole traversal so a
        // reconfiguration cannot tear the chain down under the batch.
        let data = {
            let mut pipeline = inner.lock_pipeline();
            if pipeline.is_empty() {
                data
            } else {
                pipeline.run(ReadingSet::new(data)).into_readings()
            }
        };
        if data.is_empty() {
            return;
        }

        gauge_latency(inner, &data);

        if let Err(err) = persist_batch(inner, data, true) {
            debug!(error = %err, "batch parked on resend queue");
        }
        inner.stats.notify();

        if inner.lock_full().is_empty() {
            return;
        }
    }
}

/// Retries previously failed batches, dropping poisoned heads.
fn drain_resend(inner: &Arc<Inner>) {
    loop {
        let Some(batch) = inner.lock_resend().pop_front() else {
            return;
        };
        match persist_batch(inner, batch, false) {
            Ok(()) => {}
            Err(_) => {
                // Head batch still failing: count the strike and drop the
                // first readings once the cap is reached, then let the next
                // cycle retry.
                let mut state = inner.lock_flush_state();
                if state.fail_count > MAX_BATCH_FAILURES {
                    state.fail_count = 0;
                    drop(state);
                    let dropped = {
                        let mut resend = inner.lock_resend();
                        let Some(head) = resend.front_mut() else { return };
                        let dropped = head.len().min(POISON_DROP_COUNT);
                        for reading in head.drain(.. dropped) {
                            info!(
                                asset = %reading.asset_code,
                                "removing reading from failing block"
                            );
                        }
                        if head.is_empty() {
                            resend.pop_front();
                        }
                        dropped
                    };
                    warn!(dropped, "too many failures with block of readings");
                    inner.stats.add_discarded(dropped as u64);
                    inner.stats.notify();
                }
                return;
            }
        }
    }
}

/// Persists one batch, updating failure bookkeeping, statistics, and the
/// asset tracker. On failure the batch is parked on the resend queue
/// (`fresh`) or returned to its head (`!fresh`).
fn persist_batch(
    inner: &Arc<Inner>,
    batch: Vec<Reading>,
    fresh: bool,
) -> Result<(), curlew_core::StorageError> {
    match inner.storage.append_readings(&batch) {
        Ok(outcome) => {
            let mut state = inner.lock_flush_state();
            if state.storage_failed {
                warn!(failures = state.stores_failed, "storage operational after failures");
                state.storage_failed = false;
                state.stores_failed = 0;
            }
            state.fail_count = 0;
            drop(state);

            let mut per_asset: HashMap<String, u64> = HashMap::new();
            let mut last_asset: Option<&str> = None;
            for reading in &batch {
                if last_asset != Some(reading.asset_code.as_str()) {
                    inner.tracker.record(&reading.asset_code);
                    last_asset = Some(reading.asset_code.as_str());
                }
                *per_asset.entry(reading.asset_code.clone()).or_default() += 1;
            }
            inner.stats.add_batch(&per_asset);
            if outcome.skipped > 0 {
                inner.stats.add_discarded(outcome.skipped as u64);
            }
            Ok(())
        }
        Err(err) => {
            let mut state = inner.lock_flush_state();
            if !state.storage_failed {
                warn!(error = %err, "failed to write readings to storage layer, queueing for resend");
            }
            state.storage_failed = true;
            state.stores_failed += 1;
            state.fail_count += 1;
            drop(state);
            let mut resend = inner.lock_resend();
            if fresh {
                resend.push_back(batch);
            } else {
                resend.push_front(batch);
            }
            Err(err)
        }
    }
}

/// Logs latency transitions against the configured flush timeout, once per
/// transition rather than per batch.
fn gauge_latency(inner: &Arc<Inner>, batch: &[Reading]) {
    let Some(first) = batch.first() else {
        return;
    };
    let latency = Duration::from_millis(first.user_ts.age_millis());
    let timeout = inner.options.flush_timeout;
    let mut state = inner.lock_flush_state();
    if latency > timeout && !state.high_latency {
        warn!(
            latency_ms = latency.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "current send latency exceeds requested maximum"
        );
        state.high_latency = true;
    } else if latency <= timeout && state.high_latency {
        warn!("send latency now within requested limits");
        state.high_latency = false;
    }
}

// ============================================================================
// SECTION: Stats Worker
// ============================================================================

/// Stats worker body: wake on nudge (or the wait bound), flush, repeat.
fn stats_worker_loop(inner: &Arc<Inner>) {
    let mut created_keys = HashSet::new();
    ensure_base_statistics(inner.stats_sink.as_ref(), &mut created_keys);
    while !inner.shutdown.load(Ordering::Acquire) {
        inner.stats.wait(STATS_WAIT);
        flush_statistics(&inner.stats, inner.stats_sink.as_ref(), &mut created_keys);
    }
}
