// crates/curlew-store-sqlite/src/purge.rs
// ============================================================================
// Module: Adaptive Purge Engine
// Description: Block-wise retention deletes with a self-tuning block size.
// Purpose: Enforce retention without starving live writers of the database.
// Dependencies: rusqlite, serde_json, tracing
// ============================================================================

//! ## Overview
//! Purge deletes in blocks of `purge_block_size` rows and measures each
//! block's wall time against a 70 ms target. Every 30 blocks the size is
//! recomputed from a 50/50 blend of the long-term and current-window
//! averages, scaled by at most 2× either way, rounded down to a multiple of
//! five, and clamped to `[20, 1500]`. A block that ran over 150 ms is
//! followed by a proportional sleep so writers can take the file lock.
//!
//! The age variant snapshots each table's rowid range first, so rows
//! arriving during the purge are never considered, then binary-searches the
//! newest purgeable rowid. Rowids equal the global reading ID, so within
//! one table they are sparse; a probe therefore consults the nearest real
//! row at or below the midpoint rather than expecting an exact hit.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use rusqlite::Connection;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::catalogue::CatalogueEntry;
use crate::engine::SqliteReadingsStore;
use crate::engine::SqliteStoreError;
use crate::retry::exec_with_retry;
use crate::retry::query_row_with_retry;
use crate::state::StoreState;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Target wall time for one DELETE block, in microseconds.
pub(crate) const TARGET_PURGE_BLOCK_DEL_TIME_US: u64 = 70 * 1_000;
/// Block size rounding granularity, in rows.
pub(crate) const PURGE_BLOCK_SZ_GRANULARITY: usize = 5;
/// Blocks between block-size recomputations.
pub(crate) const RECALC_PURGE_BLOCK_SIZE_NUM_BLOCKS: u64 = 30;
/// Block duration past which the engine sleeps to release locks.
const PURGE_SLOWDOWN_THRESHOLD_US: u64 = 150_000;
/// Poll interval while waiting out in-flight bulk writes.
const WRITE_WAIT_POLL: Duration = Duration::from_millis(100);
/// Divisor applied when deriving an age from the oldest stored reading.
const DERIVED_AGE_DIVISOR: i64 = 360;
/// Rows deleted ahead of the minimum per by-rows iteration.
const ROWS_DELETE_SPAN: i64 = 10_000;

// ============================================================================
// SECTION: Result Payload
// ============================================================================

/// Purge outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeResult {
    /// Rows removed.
    pub removed: u64,
    /// Removed rows the north side had not acknowledged.
    pub unsent_purged: u64,
    /// Unacknowledged rows retained by the keep-unsent clamp.
    pub unsent_retained: u64,
    /// Rows remaining after the purge.
    pub readings: u64,
}

impl PurgeResult {
    /// Renders the documented JSON payload.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "removed": self.removed,
            "unsentPurged": self.unsent_purged,
            "unsentRetained": self.unsent_retained,
            "readings": self.readings,
        })
    }
}

// ============================================================================
// SECTION: Adaptive Sizing
// ============================================================================

/// Per-run block accounting feeding the adaptive sizing.
#[derive(Debug, Default)]
struct BlockStats {
    /// Blocks deleted so far.
    blocks: u64,
    /// Total block wall time, in microseconds.
    total_us: u64,
    /// Blocks at the previous recomputation.
    prev_blocks: u64,
    /// Total wall time at the previous recomputation.
    prev_total_us: u64,
}

/// Recomputes the block size from the blended per-block average.
///
/// Visible to tests: feeding a forced ~300 ms average must halve the size
/// (the 0.5× clamp) without ever leaving `[20, 1500]`.
pub(crate) fn recalculate_block_size(current: usize, prev_avg_us: u64, curr_avg_us: u64) -> usize {
    let prev = if prev_avg_us == 0 { curr_avg_us } else { prev_avg_us };
    let avg = (prev * 5 + curr_avg_us * 5) / 10;
    let deviation = avg.abs_diff(TARGET_PURGE_BLOCK_DEL_TIME_US);
    if deviation <= TARGET_PURGE_BLOCK_DEL_TIME_US / 10 || avg == 0 {
        return current;
    }
    let ratio = (TARGET_PURGE_BLOCK_DEL_TIME_US as f64 / avg as f64).clamp(0.5, 2.0);
    let scaled = (current as f64 * ratio) as usize;
    let rounded = scaled / PURGE_BLOCK_SZ_GRANULARITY * PURGE_BLOCK_SZ_GRANULARITY;
    rounded.clamp(crate::state::MIN_PURGE_BLOCK_SIZE, crate::state::MAX_PURGE_BLOCK_SIZE)
}

impl BlockStats {
    /// Records one block and recomputes the size on every thirtieth.
    fn record(&mut self, state: &StoreState, block_us: u64) {
        self.blocks += 1;
        self.total_us += block_us;
        if self.blocks % RECALC_PURGE_BLOCK_SIZE_NUM_BLOCKS != 0 {
            return;
        }
        let prev_avg = self.prev_total_us / self.prev_blocks.max(1);
        let curr_avg =
            (self.total_us - self.prev_total_us) / (self.blocks - self.prev_blocks).max(1);
        self.prev_blocks = self.blocks;
        self.prev_total_us = self.total_us;
        let current = state.purge_block_size();
        let updated = recalculate_block_size(current, prev_avg, curr_avg);
        if updated != current {
            debug!(from = current, to = updated, prev_avg, curr_avg, "purge block size retuned");
            state.set_purge_block_size(updated);
        }
        thread::sleep(Duration::from_millis(100));
    }
}

// ============================================================================
// SECTION: Purge Operations
// ============================================================================

impl SqliteReadingsStore {
    /// Purges rows older than `age_hours` (zero derives the age from the
    /// oldest stored reading). With `keep_unsent`, rows above the `sent`
    /// watermark survive regardless of age.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when a purge query fails; rows already
    /// deleted stay deleted.
    pub fn purge_readings_by_age(
        &self,
        age_hours: u64,
        sent: i64,
        keep_unsent: bool,
    ) -> Result<PurgeResult, SqliteStoreError> {
        let started = Instant::now();
        let entries = self.catalogue().entries();
        info!(age_hours, sent, keep_unsent, "purge starting");

        let age_hours = if age_hours == 0 {
            self.derive_age_hours(&entries)?
        } else {
            i64::try_from(age_hours).unwrap_or(i64::MAX)
        };

        let mut result = PurgeResult::default();
        let mut stats = BlockStats::default();
        for entry in &entries {
            self.purge_table_by_age(entry, age_hours, sent, keep_unsent, &mut result, &mut stats)?;
        }
        if sent == 0 {
            // No north-side exporter: everything removed was unsent.
            result.unsent_purged = result.removed;
        }
        result.readings = self.count_all_rows(&entries)?;
        info!(
            blocks = stats.blocks,
            removed = result.removed,
            duration_us = started.elapsed().as_micros() as u64,
            "purge process complete"
        );
        Ok(result)
    }

    /// Purges the oldest rows until at most `rows` remain. With
    /// `keep_unsent`, the delete point never crosses the `sent` watermark.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when a purge query fails.
    pub fn purge_readings_by_rows(
        &self,
        rows: u64,
        sent: i64,
        keep_unsent: bool,
    ) -> Result<PurgeResult, SqliteStoreError> {
        let counters = self.state().retry();
        let entries = self.catalogue().entries();
        let mut result = PurgeResult::default();
        info!(rows, sent, keep_unsent, "purge by rows starting");

        loop {
            let count = self.count_all_rows(&entries)?;
            if count <= rows {
                result.readings = count;
                break;
            }
            let Some((min_id, max_id)) = self.id_range(&entries)? else {
                result.readings = 0;
                break;
            };
            let mut delete_point = (min_id + ROWS_DELETE_SPAN)
                .min(max_id.saturating_sub(i64::try_from(rows).unwrap_or(i64::MAX)));
            if keep_unsent && sent > 0 {
                delete_point = delete_point.min(sent);
            }
            if delete_point < min_id {
                // The watermark protects everything old enough to purge.
                result.readings = count;
                break;
            }
            let mut affected_total = 0;
            for entry in &entries {
                if !keep_unsent && sent > 0 {
                    result.unsent_purged += self.count_rows_between(entry, sent, delete_point)?;
                }
                let affected = self.with_table_conn(|conn| {
                    exec_with_retry(
                        conn,
                        counters,
                        &format!(
                            "DELETE FROM {} WHERE id <= {delete_point}",
                            entry.table.qualified_name()
                        ),
                    )
                })?;
                affected_total += affected;
            }
            result.removed += affected_total as u64;
            debug!(deleted = affected_total, delete_point, "purge by rows block");
            if affected_total == 0 {
                result.readings = self.count_all_rows(&entries)?;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        if keep_unsent && sent > 0 {
            result.unsent_retained = self.count_rows_above(&entries, sent)?;
        }
        info!(removed = result.removed, readings = result.readings, "purge by rows complete");
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Age variant internals
    // ------------------------------------------------------------------

    /// Runs the block-delete loop for one table.
    fn purge_table_by_age(
        &self,
        entry: &CatalogueEntry,
        age_hours: i64,
        sent: i64,
        keep_unsent: bool,
        result: &mut PurgeResult,
        stats: &mut BlockStats,
    ) -> Result<(), SqliteStoreError> {
        let table = entry.table.qualified_name();
        let counters = self.state().retry();

        // Snapshot the rowid range so concurrent writes are out of scope.
        let Some((min_rowid, max_rowid)) = self.table_rowid_range(&table)? else {
            return Ok(());
        };
        let ceiling = if keep_unsent && sent > 0 { sent.min(max_rowid) } else { max_rowid };
        if ceiling < min_rowid {
            result.unsent_retained += self.count_rows_between_rowids(&table, min_rowid, max_rowid)?;
            return Ok(());
        }
        let Some(rowid_limit) =
            self.newest_purgeable_rowid(&table, min_rowid, ceiling, age_hours)?
        else {
            debug!(table = %table, "no data to purge");
            result.unsent_retained += self.count_rows_above_rowid(&table, ceiling)?;
            return Ok(());
        };

        if !keep_unsent && sent > 0 && rowid_limit > sent {
            result.unsent_purged += self.count_rows_between_rowids(&table, sent + 1, rowid_limit)?;
        }

        // Let in-flight bulk writes finish before taking the file lock for
        // the first DELETE block.
        while self.state().write_access_ongoing() {
            thread::sleep(WRITE_WAIT_POLL);
        }

        info!(table = %table, from = min_rowid, to = rowid_limit, "purge deleting readings");
        let mut rowid_min = min_rowid;
        while rowid_min < rowid_limit {
            rowid_min = (rowid_min + self.state().purge_block_size() as i64).min(rowid_limit);
            let block_started = Instant::now();
            let affected = self.with_table_conn(|conn| {
                exec_with_retry(
                    conn,
                    counters,
                    &format!("DELETE FROM {table} WHERE rowid <= {rowid_min}"),
                )
            })?;
            let block_us = block_started.elapsed().as_micros() as u64;
            result.removed += affected as u64;
            debug!(block = stats.blocks + 1, deleted = affected, "purge delete block");
            if block_us > PURGE_SLOWDOWN_THRESHOLD_US {
                thread::sleep(Duration::from_millis(100 + block_us / 10_000));
            }
            stats.record(self.state(), block_us);
        }
        result.unsent_retained += self.count_rows_above_rowid(&table, rowid_limit)?;
        Ok(())
    }

    /// Binary search for the newest rowid older than the cutoff.
    fn newest_purgeable_rowid(
        &self,
        table: &str,
        min_rowid: i64,
        ceiling: i64,
        age_hours: i64,
    ) -> Result<Option<i64>, SqliteStoreError> {
        let counters = self.state().retry();
        let mut low = min_rowid;
        let mut high = ceiling;
        let mut newest = None;
        while low <= high {
            let mid = low + (high - low) / 2;
            let probe = self.with_table_conn(|conn| {
                query_row_with_retry(
                    conn,
                    counters,
                    &format!(
                        "SELECT rowid, CASE WHEN user_ts < datetime('now', '-{age_hours} hours') \
                         THEN 1 ELSE 0 END FROM {table} WHERE rowid <= {mid} \
                         ORDER BY rowid DESC LIMIT 1"
                    ),
                    [],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
            })?;
            match probe {
                None => break,
                Some((rowid, 1)) => {
                    newest = Some(rowid);
                    low = mid + 1;
                }
                Some((rowid, _)) => {
                    high = rowid - 1;
                }
            }
        }
        Ok(newest)
    }

    /// Age derived from the oldest stored reading, in the configured
    /// divisor units.
    fn derive_age_hours(&self, entries: &[CatalogueEntry]) -> Result<i64, SqliteStoreError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let union = entries
            .iter()
            .map(|entry| format!("SELECT user_ts FROM {}", entry.table.qualified_name()))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let counters = self.state().retry();
        let derived = self.with_table_conn(|conn| {
            query_row_with_retry(
                conn,
                counters,
                &format!(
                    "SELECT (strftime('%s', 'now') - strftime('%s', MIN(user_ts))) / \
                     {DERIVED_AGE_DIVISOR} FROM ({union})"
                ),
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
        })?;
        Ok(derived.flatten().unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Counting helpers
    // ------------------------------------------------------------------

    /// Runs a closure against one pooled connection.
    fn with_table_conn<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        let connection = self.pool_ref().checkout();
        let guard = self.pool_ref().lock(connection);
        op(&guard)
    }

    fn table_rowid_range(&self, table: &str) -> Result<Option<(i64, i64)>, SqliteStoreError> {
        let counters = self.state().retry();
        let range = self.with_table_conn(|conn| {
            query_row_with_retry(
                conn,
                counters,
                &format!("SELECT min(rowid), max(rowid) FROM {table}"),
                [],
                |row| {
                    Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?))
                },
            )
        })?;
        Ok(match range {
            Some((Some(min), Some(max))) => Some((min, max)),
            _ => None,
        })
    }

    fn count_rows_between_rowids(
        &self,
        table: &str,
        from: i64,
        to: i64,
    ) -> Result<u64, SqliteStoreError> {
        let counters = self.state().retry();
        let count = self.with_table_conn(|conn| {
            query_row_with_retry(
                conn,
                counters,
                &format!("SELECT count(rowid) FROM {table} WHERE rowid >= {from} AND rowid <= {to}"),
                [],
                |row| row.get::<_, i64>(0),
            )
        })?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    fn count_rows_above_rowid(&self, table: &str, above: i64) -> Result<u64, SqliteStoreError> {
        let counters = self.state().retry();
        let count = self.with_table_conn(|conn| {
            query_row_with_retry(
                conn,
                counters,
                &format!("SELECT count(rowid) FROM {table} WHERE rowid > {above}"),
                [],
                |row| row.get::<_, i64>(0),
            )
        })?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    fn count_rows_between(
        &self,
        entry: &CatalogueEntry,
        sent: i64,
        delete_point: i64,
    ) -> Result<u64, SqliteStoreError> {
        self.count_rows_between_rowids(&entry.table.qualified_name(), sent + 1, delete_point)
    }

    fn count_all_rows(&self, entries: &[CatalogueEntry]) -> Result<u64, SqliteStoreError> {
        let mut total = 0;
        for entry in entries {
            total += self.count_rows_above_rowid(&entry.table.qualified_name(), 0)?;
        }
        Ok(total)
    }

    fn count_rows_above(
        &self,
        entries: &[CatalogueEntry],
        above: i64,
    ) -> Result<u64, SqliteStoreError> {
        let mut total = 0;
        for entry in entries {
            total += self.count_rows_above_rowid(&entry.table.qualified_name(), above)?;
        }
        Ok(total)
    }

    fn id_range(
        &self,
        entries: &[CatalogueEntry],
    ) -> Result<Option<(i64, i64)>, SqliteStoreError> {
        let mut overall: Option<(i64, i64)> = None;
        for entry in entries {
            if let Some((min, max)) = self.table_rowid_range(&entry.table.qualified_name())? {
                overall = Some(match overall {
                    Some((lo, hi)) => (lo.min(min), hi.max(max)),
                    None => (min, max),
                });
            }
        }
        Ok(overall)
    }
}

// ============================================================================
// SECTION: Purge Worker
// ============================================================================

/// Background retention loop driving the purge engine on a timer.
pub struct PurgeWorker {
    /// Worker thread handle.
    handle: Option<thread::JoinHandle<()>>,
    /// Shutdown flag observed between cycles.
    stop: Arc<AtomicBool>,
}

impl PurgeWorker {
    /// Spawns the retention loop. The `sent` watermark is read before every
    /// cycle, so the north-side exporter can advance it concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError::Io`] when the thread cannot be spawned.
    pub fn spawn(
        store: SqliteReadingsStore,
        interval: Duration,
        age_hours: u64,
        keep_unsent: bool,
        sent: Arc<AtomicI64>,
    ) -> Result<Self, SqliteStoreError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("curlew-purge".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    let watermark = sent.load(Ordering::Acquire);
                    match store.purge_readings_by_age(age_hours, watermark, keep_unsent) {
                        Ok(result) => {
                            info!(
                                removed = result.removed,
                                retained = result.unsent_retained,
                                "retention cycle complete"
                            );
                        }
                        Err(err) => {
                            warn!(error = %err, "retention cycle failed");
                        }
                    }
                    let mut waited = Duration::ZERO;
                    while waited < interval && !stop_flag.load(Ordering::Acquire) {
                        let step = WRITE_WAIT_POLL.min(interval - waited);
                        thread::sleep(step);
                        waited += step;
                    }
                }
            })
            .map_err(|err| {
                SqliteStoreError::Io(format!("failed to spawn purge thread: {err}"))
            })?;
        Ok(Self {
            handle: Some(handle),
            stop,
        })
    }

    /// Stops the loop and joins the worker.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PurgeWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MAX_PURGE_BLOCK_SIZE;
    use crate::state::MIN_PURGE_BLOCK_SIZE;

    #[test]
    fn forced_slow_blocks_halve_the_size() {
        // ~300 ms per block against the 70 ms target hits the 0.5x clamp.
        let updated = recalculate_block_size(1_000, 300_000, 300_000);
        assert_eq!(updated, 500);
    }

    #[test]
    fn size_never_leaves_documented_bounds() {
        assert_eq!(recalculate_block_size(MIN_PURGE_BLOCK_SIZE, 300_000, 300_000), MIN_PURGE_BLOCK_SIZE);
        assert_eq!(recalculate_block_size(MAX_PURGE_BLOCK_SIZE, 1, 1), MAX_PURGE_BLOCK_SIZE);
    }

    #[test]
    fn fast_blocks_grow_capped_at_double() {
        // 20 us per block begs for a much larger block; growth caps at 2x.
        let updated = recalculate_block_size(100, 20_000, 20_000);
        assert_eq!(updated, 200);
    }

    #[test]
    fn near_target_average_leaves_size_alone() {
        let updated = recalculate_block_size(240, 72_000, 70_000);
        assert_eq!(updated, 240);
    }

    #[test]
    fn long_term_average_blends_equally() {
        // prev 20 ms, current 120 ms: blend is 70 ms, exactly on target.
        let updated = recalculate_block_size(300, 20_000, 120_000);
        assert_eq!(updated, 300);
    }
}
