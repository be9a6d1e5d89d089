// crates/curlew-ingest/src/stats.rs
// ============================================================================
// Module: Statistics & Asset Tracker
// Description: Per-asset counters, DISCARDED accounting, and tuple cache.
// Purpose: Reflect ingest throughput into the statistics table and announce
//          each asset to the management service exactly once.
// Dependencies: curlew-core, tracing
// ============================================================================

//! ## Overview
//! The flush worker accumulates per-asset counts into a pending map and
//! nudges the stats worker through a condition variable after every
//! successful persistence; spurious wakeups are benign because the map is
//! re-checked. The worker uppercases asset names into statistics keys,
//! creates missing rows once (tracked in a local cache), always updates the
//! `READINGS` and `DISCARDED` totals, and keeps the pending amounts on any
//! failure so the next tick retries them.
//!
//! Asset-tracking tuples are deduplicated through an in-memory set that is
//! pre-populated from the management service; only first sight posts.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;

use curlew_core::AssetTrackerApi;
use curlew_core::AssetTrackingTuple;
use curlew_core::StatisticsSink;
use tracing::info;
use tracing::warn;

/// Statistics key for the total readings counter.
const READINGS_KEY: &str = "READINGS";
/// Statistics key for the discarded readings counter.
const DISCARDED_KEY: &str = "DISCARDED";

// ============================================================================
// SECTION: Pending Counters
// ============================================================================

/// Counters accumulated since the last successful flush.
#[derive(Debug, Default)]
pub(crate) struct PendingStats {
    /// Readings persisted per asset.
    per_asset: HashMap<String, u64>,
    /// Readings dropped (malformed or resend-expired).
    discarded: u64,
}

/// Pending counters plus the worker wake-up.
#[derive(Debug, Default)]
pub(crate) struct StatsShared {
    /// Pending counters.
    pending: Mutex<PendingStats>,
    /// Nudged after each successful persistence.
    cv: Condvar,
}

/// Point-in-time copy of the pending counters, for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Readings persisted per asset, not yet flushed.
    pub per_asset: HashMap<String, u64>,
    /// Discarded count not yet flushed.
    pub discarded: u64,
}

impl StatsShared {
    /// Adds per-asset counts from one persisted batch.
    pub(crate) fn add_batch(&self, counts: &HashMap<String, u64>) {
        let mut pending = self.lock_pending();
        for (asset, count) in counts {
            *pending.per_asset.entry(asset.clone()).or_default() += count;
        }
    }

    /// Counts discarded readings.
    pub(crate) fn add_discarded(&self, count: u64) {
        if count > 0 {
            self.lock_pending().discarded += count;
        }
    }

    /// Wakes the stats worker.
    pub(crate) fn notify(&self) {
        self.cv.notify_one();
    }

    /// Copies the pending counters.
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        let pending = self.lock_pending();
        StatsSnapshot {
            per_asset: pending.per_asset.clone(),
            discarded: pending.discarded,
        }
    }

    /// Waits for a nudge, bounded so shutdown is never missed.
    pub(crate) fn wait(&self, timeout: Duration) {
        let pending = self.lock_pending();
        let _unused = self.cv.wait_timeout(pending, timeout);
    }

    /// Subtracts amounts that reached the statistics table; increments that
    /// raced in meanwhile survive for the next tick.
    fn settle(&self, flushed: &StatsSnapshot) {
        let mut pending = self.lock_pending();
        for (asset, count) in &flushed.per_asset {
            if let Some(remaining) = pending.per_asset.get_mut(asset) {
                *remaining = remaining.saturating_sub(*count);
                if *remaining == 0 {
                    pending.per_asset.remove(asset);
                }
            }
        }
        pending.discarded = pending.discarded.saturating_sub(flushed.discarded);
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingStats> {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ============================================================================
// SECTION: Flush Logic
// ============================================================================

/// One stats flush tick: create missing rows, submit the batch update,
/// settle on success, retain on failure.
pub(crate) fn flush_statistics(
    shared: &StatsShared,
    sink: &dyn StatisticsSink,
    created_keys: &mut HashSet<String>,
) {
    let snapshot = shared.snapshot();
    if snapshot.per_asset.is_empty() && snapshot.discarded == 0 {
        return;
    }

    let mut deltas: Vec<(String, i64)> = Vec::with_capacity(snapshot.per_asset.len() + 2);
    let mut readings_total = 0;
    for (asset, count) in &snapshot.per_asset {
        let key = asset.to_uppercase();
        if !created_keys.contains(&key) {
            let description = format!("Readings received from asset {asset}");
            if let Err(err) = sink.ensure_statistic(&key, &description) {
                warn!(asset = %asset, error = %err, "unable to create statistics row, will retry");
                return;
            }
            created_keys.insert(key.clone());
        }
        deltas.push((key, i64::try_from(*count).unwrap_or(i64::MAX)));
        readings_total += *count;
    }
    if readings_total > 0 {
        deltas.push((READINGS_KEY.to_string(), i64::try_from(readings_total).unwrap_or(i64::MAX)));
    }
    if snapshot.discarded > 0 {
        deltas.push((
            DISCARDED_KEY.to_string(),
            i64::try_from(snapshot.discarded).unwrap_or(i64::MAX),
        ));
    }

    match sink.bump_statistics(&deltas) {
        Ok(()) => shared.settle(&snapshot),
        Err(err) => {
            info!(error = %err, "statistics update failed, will retry on next tick");
        }
    }
}

/// Creates the always-updated total rows once at worker start.
pub(crate) fn ensure_base_statistics(sink: &dyn StatisticsSink, created_keys: &mut HashSet<String>) {
    for (key, description) in [
        (READINGS_KEY, "Readings received by the south service"),
        (DISCARDED_KEY, "Readings discarded at the input side"),
    ] {
        match sink.ensure_statistic(key, description) {
            Ok(()) => {
                created_keys.insert(key.to_string());
            }
            Err(err) => {
                warn!(key, error = %err, "unable to create base statistics row");
            }
        }
    }
}

// ============================================================================
// SECTION: Asset Tracker
// ============================================================================

/// First-sight asset announcement with an in-memory dedup cache.
pub(crate) struct AssetTracker {
    /// Management seam.
    api: Arc<dyn AssetTrackerApi>,
    /// Tuples already known to the management service.
    cache: Mutex<HashSet<AssetTrackingTuple>>,
    /// Service name reported in tuples.
    service: String,
    /// Plugin name reported in tuples.
    plugin: String,
}

impl AssetTracker {
    /// Creates the tracker and pre-populates the cache from the management
    /// service; a failure there only means extra first-sight posts later.
    pub(crate) fn new(api: Arc<dyn AssetTrackerApi>, service: &str, plugin: &str) -> Self {
        let cache = match api.tuples(service, "Ingest") {
            Ok(tuples) => {
                info!(count = tuples.len(), "asset tracking cache populated");
                tuples.into_iter().collect()
            }
            Err(err) => {
                warn!(error = %err, "unable to populate asset tracking cache");
                HashSet::new()
            }
        };
        Self {
            api,
            cache: Mutex::new(cache),
            service: service.to_string(),
            plugin: plugin.to_string(),
        }
    }

    /// Records an asset sighting, posting only the first one.
    pub(crate) fn record(&self, asset: &str) {
        let tuple = AssetTrackingTuple::ingest(&self.service, &self.plugin, asset);
        {
            let cache = self.lock_cache();
            if cache.contains(&tuple) {
                return;
            }
        }
        match self.api.record_tuple(&tuple) {
            Ok(()) => {
                self.lock_cache().insert(tuple);
            }
            Err(err) => {
                // Not cached: the next sighting retries the announcement.
                warn!(asset, error = %err, "asset tracking tuple not recorded");
            }
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashSet<AssetTrackingTuple>> {
        self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    use curlew_core::ManagementError;
    use curlew_core::StorageError;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        ensured: Mutex<Vec<String>>,
        bumped: Mutex<Vec<Vec<(String, i64)>>>,
        fail_bump: AtomicBool,
    }

    impl StatisticsSink for RecordingSink {
        fn ensure_statistic(&self, key: &str, _description: &str) -> Result<(), StorageError> {
            self.ensured.lock().unwrap().push(key.to_string());
            Ok(())
        }

        fn bump_statistics(&self, deltas: &[(String, i64)]) -> Result<(), StorageError> {
            if self.fail_bump.load(Ordering::Relaxed) {
                return Err(StorageError::Db("down".to_string()));
            }
            self.bumped.lock().unwrap().push(deltas.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTracker {
        posted: Mutex<Vec<AssetTrackingTuple>>,
        fail: AtomicBool,
    }

    impl AssetTrackerApi for RecordingTracker {
        fn tuples(
            &self,
            _service: &str,
            _event: &str,
        ) -> Result<Vec<AssetTrackingTuple>, ManagementError> {
            Ok(Vec::new())
        }

        fn record_tuple(&self, tuple: &AssetTrackingTuple) -> Result<(), ManagementError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(ManagementError::Http("down".to_string()));
            }
            self.posted.lock().unwrap().push(tuple.clone());
            Ok(())
        }
    }

    #[test]
    fn flush_uppercases_keys_and_adds_totals() {
        let shared = StatsShared::default();
        let sink = RecordingSink::default();
        let mut created = HashSet::new();
        shared.add_batch(&HashMap::from([("pump".to_string(), 3)]));
        shared.add_discarded(2);

        flush_statistics(&shared, &sink, &mut created);

        let bumped = sink.bumped.lock().unwrap();
        let deltas = &bumped[0];
        assert!(deltas.contains(&("PUMP".to_string(), 3)));
        assert!(deltas.contains(&("READINGS".to_string(), 3)));
        assert!(deltas.contains(&("DISCARDED".to_string(), 2)));
        assert_eq!(shared.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn failed_flush_retains_pending_amounts() {
        let shared = StatsShared::default();
        let sink = RecordingSink::default();
        sink.fail_bump.store(true, Ordering::Relaxed);
        let mut created = HashSet::new();
        shared.add_batch(&HashMap::from([("pump".to_string(), 3)]));

        flush_statistics(&shared, &sink, &mut created);
        assert_eq!(shared.snapshot().per_asset.get("pump"), Some(&3));

        sink.fail_bump.store(false, Ordering::Relaxed);
        flush_statistics(&shared, &sink, &mut created);
        assert!(shared.snapshot().per_asset.is_empty());
    }

    #[test]
    fn increments_during_flush_survive_settling() {
        let shared = StatsShared::default();
        shared.add_batch(&HashMap::from([("pump".to_string(), 3)]));
        let snapshot = shared.snapshot();
        shared.add_batch(&HashMap::from([("pump".to_string(), 2)]));
        shared.settle(&snapshot);
        assert_eq!(shared.snapshot().per_asset.get("pump"), Some(&2));
    }

    #[test]
    fn tracker_posts_each_asset_once() {
        let api = Arc::new(RecordingTracker::default());
        let tracker = AssetTracker::new(Arc::clone(&api) as Arc<dyn AssetTrackerApi>, "svc", "plg");
        tracker.record("pump");
        tracker.record("pump");
        tracker.record("valve");
        let posted = api.posted.lock().unwrap();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].asset, "pump");
        assert_eq!(posted[0].event, "Ingest");
    }

    #[test]
    fn tracker_retries_after_post_failure() {
        let api = Arc::new(RecordingTracker::default());
        api.fail.store(true, Ordering::Relaxed);
        let tracker = AssetTracker::new(Arc::clone(&api) as Arc<dyn AssetTrackerApi>, "svc", "plg");
        tracker.record("pump");
        assert!(api.posted.lock().unwrap().is_empty());
        api.fail.store(false, Ordering::Relaxed);
        tracker.record("pump");
        assert_eq!(api.posted.lock().unwrap().len(), 1);
    }
}
