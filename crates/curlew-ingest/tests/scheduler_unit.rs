// crates/curlew-ingest/tests/scheduler_unit.rs
// ============================================================================
// Module: Ingest Scheduler Unit Tests
// Description: Queue rotation, latency flush, resend, and filter behavior.
// Purpose: Validate the flush discipline against a mock storage layer.
// ============================================================================

//! ## Overview
//! Scheduler-level tests with mock storage/statistics/tracker seams:
//! - Threshold and timeout driven flushes
//! - Resend queue behavior and the poison-drop policy
//! - Filter traversal and hot reconfiguration
//! - Shutdown draining and final statistics flush

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use curlew_core::AppendOutcome;
use curlew_core::AssetTrackerApi;
use curlew_core::AssetTrackingTuple;
use curlew_core::ManagementError;
use curlew_core::Reading;
use curlew_core::ReadingSet;
use curlew_core::ReadingsAppender;
use curlew_core::StatisticsSink;
use curlew_core::StorageError;
use curlew_core::UserTimestamp;
use curlew_ingest::Filter;
use curlew_ingest::FilterRegistry;
use curlew_ingest::Ingest;
use curlew_ingest::IngestOptions;
use curlew_ingest::PipelineError;
use serde_json::Value;
use serde_json::json;

// ============================================================================
// SECTION: Mocks
// ============================================================================

#[derive(Default)]
struct MockStorage {
    batches: Mutex<Vec<Vec<Reading>>>,
    fail_remaining: AtomicU32,
}

impl MockStorage {
    fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    fn total_readings(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }
}

impl ReadingsAppender for MockStorage {
    fn append_readings(&self, readings: &[Reading]) -> Result<AppendOutcome, StorageError> {
        if self.fail_remaining.load(Ordering::Acquire) > 0 {
            self.fail_remaining.fetch_sub(1, Ordering::AcqRel);
            return Err(StorageError::Busy("injected failure".to_string()));
        }
        self.batches.lock().unwrap().push(readings.to_vec());
        Ok(AppendOutcome {
            inserted: readings.len(),
            skipped: 0,
        })
    }
}

#[derive(Default)]
struct MockStats {
    bumped: Mutex<Vec<Vec<(String, i64)>>>,
}

impl MockStats {
    fn total_for(&self, key: &str) -> i64 {
        self.bumped
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .filter(|(k, _)| k == key)
            .map(|(_, delta)| delta)
            .sum()
    }
}

impl StatisticsSink for MockStats {
    fn ensure_statistic(&self, _key: &str, _description: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn bump_statistics(&self, deltas: &[(String, i64)]) -> Result<(), StorageError> {
        self.bumped.lock().unwrap().push(deltas.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct MockTracker {
    tuples: Mutex<Vec<AssetTrackingTuple>>,
}

impl AssetTrackerApi for MockTracker {
    fn tuples(
        &self,
        _service: &str,
        _event: &str,
    ) -> Result<Vec<AssetTrackingTuple>, ManagementError> {
        Ok(Vec::new())
    }

    fn record_tuple(&self, tuple: &AssetTrackingTuple) -> Result<(), ManagementError> {
        self.tuples.lock().unwrap().push(tuple.clone());
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

struct Rig {
    ingest: Ingest,
    storage: Arc<MockStorage>,
    stats: Arc<MockStats>,
    tracker: Arc<MockTracker>,
}

fn rig(options: IngestOptions, filters: &[(String, Value)], registry: FilterRegistry) -> Rig {
    let storage = Arc::new(MockStorage::default());
    let stats = Arc::new(MockStats::default());
    let tracker = Arc::new(MockTracker::default());
    let ingest = Ingest::start(
        options,
        Arc::clone(&storage) as Arc<dyn ReadingsAppender>,
        Arc::clone(&stats) as Arc<dyn StatisticsSink>,
        Arc::clone(&tracker) as Arc<dyn AssetTrackerApi>,
        registry,
        filters,
    )
    .expect("start ingest");
    Rig {
        ingest,
        storage,
        stats,
        tracker,
    }
}

fn reading(asset: &str, value: i64) -> Reading {
    Reading::new(asset, UserTimestamp::Now, json!({"v": value})).expect("reading")
}

/// Polls a predicate with a deadline, the usual dance for worker assertions.
fn wait_until(what: &str, deadline: Duration, predicate: impl Fn() -> bool) {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

fn fast_options(threshold: usize) -> IngestOptions {
    IngestOptions {
        flush_timeout: Duration::from_millis(100),
        queue_threshold: threshold,
        service_name: "svc".to_string(),
        plugin_name: "plg".to_string(),
    }
}

// ============================================================================
// SECTION: Flush Discipline
// ============================================================================

#[test]
fn reaching_the_threshold_flushes_immediately() {
    let mut r = rig(fast_options(3), &[], FilterRegistry::new());
    r.ingest.ingest(reading("a", 1));
    r.ingest.ingest(reading("a", 2));
    r.ingest.ingest(reading("a", 3));
    let storage = Arc::clone(&r.storage);
    wait_until("threshold flush", Duration::from_secs(2), || storage.batch_count() == 1);
    assert_eq!(storage.total_readings(), 3);
    r.ingest.shutdown();
}

#[test]
fn an_old_reading_is_flushed_by_the_timeout() {
    let mut r = rig(fast_options(1_000), &[], FilterRegistry::new());
    r.ingest.ingest(reading("slow", 1));
    let storage = Arc::clone(&r.storage);
    wait_until("timeout flush", Duration::from_secs(2), || storage.total_readings() == 1);
    r.ingest.shutdown();
}

#[test]
fn batch_ingest_nudges_ahead_of_the_threshold() {
    let mut r = rig(fast_options(1_000), &[], FilterRegistry::new());
    let batch: Vec<Reading> = (0 .. 800).map(|index| reading("bulk", index)).collect();
    r.ingest.ingest_many(batch);
    let storage = Arc::clone(&r.storage);
    wait_until("bulk flush", Duration::from_secs(2), || storage.total_readings() == 800);
    r.ingest.shutdown();
}

#[test]
fn shutdown_drains_readings_below_the_threshold() {
    let mut r = rig(fast_options(1_000), &[], FilterRegistry::new());
    for index in 0 .. 3 {
        r.ingest.ingest(reading("drain", index));
    }
    r.ingest.shutdown();
    assert_eq!(r.storage.total_readings(), 3);
}

#[test]
fn queue_length_reflects_unflushed_readings() {
    let mut r = rig(fast_options(1_000), &[], FilterRegistry::new());
    for index in 0 .. 5 {
        r.ingest.ingest(reading("q", index));
    }
    assert!(r.ingest.queue_length() >= 5 || r.storage.total_readings() > 0);
    r.ingest.shutdown();
}

// ============================================================================
// SECTION: Resend Queue
// ============================================================================

#[test]
fn failed_batches_are_resent_after_recovery() {
    let mut r = rig(fast_options(2), &[], FilterRegistry::new());
    r.storage.fail_remaining.store(2, Ordering::Release);
    r.ingest.ingest(reading("retry", 1));
    r.ingest.ingest(reading("retry", 2));
    let storage = Arc::clone(&r.storage);
    wait_until("resend delivery", Duration::from_secs(5), || storage.total_readings() == 2);
    r.ingest.shutdown();
    // Nothing was dropped on the way through.
    assert_eq!(r.stats.total_for("DISCARDED"), 0);
}

#[test]
fn six_consecutive_failures_drop_the_head_readings() {
    let mut r = rig(fast_options(6), &[], FilterRegistry::new());
    // Exactly six failures: the sixth strike drops the head readings and
    // the next attempt delivers the survivor.
    r.storage.fail_remaining.store(6, Ordering::Release);
    let batch: Vec<Reading> = (0 .. 6).map(|index| reading("poison", index)).collect();
    r.ingest.ingest_many(batch);
    let stats = Arc::clone(&r.stats);
    wait_until("poison drop", Duration::from_secs(10), || stats.total_for("DISCARDED") == 5);
    let storage = Arc::clone(&r.storage);
    wait_until("survivor delivery", Duration::from_secs(5), || storage.total_readings() == 1);
    r.ingest.shutdown();
}

// ============================================================================
// SECTION: Filters
// ============================================================================

struct Scale {
    factor: i64,
}

impl Filter for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn ingest(&mut self, set: ReadingSet) -> ReadingSet {
        set.into_readings()
            .into_iter()
            .map(|r| {
                let scaled = r.payload["v"].as_i64().unwrap_or(0) * self.factor;
                Reading::new(r.asset_code, r.user_ts, json!({"v": scaled})).unwrap()
            })
            .collect()
    }

    fn reconfigure(&mut self, config: &Value) {
        if let Some(factor) = config.get("factor").and_then(Value::as_i64) {
            self.factor = factor;
        }
    }
}

fn scale_factory(config: &Value) -> Result<Box<dyn Filter>, PipelineError> {
    Ok(Box::new(Scale {
        factor: config.get("factor").and_then(Value::as_i64).unwrap_or(1),
    }))
}

#[test]
fn batches_traverse_the_filter_chain() {
    let mut registry = FilterRegistry::new();
    registry.register("scale", scale_factory);
    let mut r = rig(
        fast_options(1),
        &[("scale".to_string(), json!({"factor": 10}))],
        registry,
    );
    r.ingest.ingest(reading("f", 4));
    let storage = Arc::clone(&r.storage);
    wait_until("filtered flush", Duration::from_secs(2), || storage.total_readings() == 1);
    let batches = r.storage.batches.lock().unwrap();
    assert_eq!(batches[0][0].payload, json!({"v": 40}));
    drop(batches);
    r.ingest.shutdown();
}

#[test]
fn filter_reconfiguration_applies_to_later_batches() {
    let mut registry = FilterRegistry::new();
    registry.register("scale", scale_factory);
    let mut r = rig(
        fast_options(1),
        &[("scale".to_string(), json!({"factor": 2}))],
        registry,
    );
    r.ingest.ingest(reading("f", 1));
    let storage = Arc::clone(&r.storage);
    wait_until("first flush", Duration::from_secs(2), || storage.total_readings() == 1);

    r.ingest.config_change("scale", &json!({"factor": 7}));
    r.ingest.ingest(reading("f", 1));
    wait_until("second flush", Duration::from_secs(2), || storage.total_readings() == 2);
    let batches = r.storage.batches.lock().unwrap();
    assert_eq!(batches[1][0].payload, json!({"v": 7}));
    drop(batches);
    r.ingest.shutdown();
}

#[test]
fn service_category_change_rebuilds_the_pipeline() {
    let mut registry = FilterRegistry::new();
    registry.register("scale", scale_factory);
    let mut r = rig(fast_options(1), &[], registry);
    r.ingest.config_change(
        "svc",
        &json!({"filter": [{"name": "scale", "config": {"factor": 3}}]}),
    );
    r.ingest.ingest(reading("f", 5));
    let storage = Arc::clone(&r.storage);
    wait_until("post-reload flush", Duration::from_secs(2), || storage.total_readings() == 1);
    let batches = r.storage.batches.lock().unwrap();
    assert_eq!(batches[0][0].payload, json!({"v": 15}));
    drop(batches);
    r.ingest.shutdown();
}

// ============================================================================
// SECTION: Statistics & Tracking
// ============================================================================

#[test]
fn statistics_reflect_persisted_batches() {
    let mut r = rig(fast_options(2), &[], FilterRegistry::new());
    r.ingest.ingest(reading("pump", 1));
    r.ingest.ingest(reading("valve", 2));
    let stats = Arc::clone(&r.stats);
    wait_until("stats flush", Duration::from_secs(2), || {
        stats.total_for("READINGS") == 2
    });
    assert_eq!(r.stats.total_for("PUMP"), 1);
    assert_eq!(r.stats.total_for("VALVE"), 1);
    r.ingest.shutdown();
}

#[test]
fn assets_are_announced_exactly_once() {
    let mut r = rig(fast_options(2), &[], FilterRegistry::new());
    for _ in 0 .. 3 {
        r.ingest.ingest(reading("pump", 1));
        r.ingest.ingest(reading("valve", 1));
    }
    let storage = Arc::clone(&r.storage);
    wait_until("flushes", Duration::from_secs(2), || storage.total_readings() == 6);
    r.ingest.shutdown();
    let tuples = r.tracker.tuples.lock().unwrap();
    let mut by_asset: HashMap<&str, usize> = HashMap::new();
    for tuple in tuples.iter() {
        *by_asset.entry(tuple.asset.as_str()).or_default() += 1;
        assert_eq!(tuple.service, "svc");
        assert_eq!(tuple.plugin, "plg");
    }
    assert_eq!(by_asset.get("pump"), Some(&1));
    assert_eq!(by_asset.get("valve"), Some(&1));
}
