// crates/curlew-store-sqlite/src/retry.rs
// ============================================================================
// Module: SQL Retry Executor
// Description: Bounded retry of BUSY/LOCKED statement executions.
// Purpose: Keep bulk writers, readers, and the purge loop alive under
//          file-level lock contention.
// Dependencies: rand, rusqlite, tracing
// ============================================================================

//! ## Overview
//! Every statement the store executes goes through one of two policies:
//! plain statements back off `retries × 100 µs` up to 40 attempts, while the
//! prepared bulk-INSERT path uses a larger 5 ms base plus up to 5 ms of
//! jitter and 20 attempts, so a deadlocked bulk writer yields long enough
//! for short read queries to drain. Only BUSY and LOCKED results are
//! retried; after exhaustion the last status is returned and the caller
//! rolls back its open transaction.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use rand::Rng;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::Params;
use rusqlite::Row;
use tracing::error;
use tracing::info;

use crate::engine::SqliteStoreError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum retries for plain statement execution.
pub const MAX_RETRIES: u32 = 40;
/// Backoff multiplier for plain statements, in microseconds.
pub const RETRY_BACKOFF_US: u64 = 100;
/// Maximum retries for the prepared bulk-INSERT path.
pub const PREP_CMD_MAX_RETRIES: u32 = 20;
/// Base sleep for the prepared bulk-INSERT path, in milliseconds.
pub const PREP_CMD_RETRY_BASE_MS: u64 = 5;
/// Jitter bound for the prepared bulk-INSERT path, in milliseconds.
pub const PREP_CMD_RETRY_BACKOFF_MS: u64 = 5;
/// Retry count past which individual retries are logged.
const RETRY_LOG_THRESHOLD: u32 = 5;

// ============================================================================
// SECTION: Policies
// ============================================================================

/// Retry policy selector.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RetryPolicy {
    /// Plain exec/step: `retries × 100 µs`, 40 attempts.
    Statement,
    /// Prepared bulk INSERT: 5 ms base + jitter, 20 attempts.
    PreparedInsert,
}

impl RetryPolicy {
    /// Maximum attempts for the policy.
    const fn max_retries(self) -> u32 {
        match self {
            Self::Statement => MAX_RETRIES,
            Self::PreparedInsert => PREP_CMD_MAX_RETRIES,
        }
    }

    /// Sleep duration before the given retry.
    fn backoff(self, retries: u32) -> Duration {
        match self {
            Self::Statement => Duration::from_micros(u64::from(retries) * RETRY_BACKOFF_US),
            Self::PreparedInsert => {
                let jitter = rand::thread_rng().gen_range(0 .. PREP_CMD_RETRY_BACKOFF_MS);
                Duration::from_millis(PREP_CMD_RETRY_BASE_MS + jitter)
            }
        }
    }
}

// ============================================================================
// SECTION: Counters
// ============================================================================

/// Cheap contention counters kept by the executor.
#[derive(Debug, Default)]
pub struct RetryCounters {
    /// Retries attributed to `SQLITE_BUSY`.
    busy: AtomicU64,
    /// Retries attributed to `SQLITE_LOCKED`.
    locked: AtomicU64,
    /// Operations that exhausted their retry budget.
    exhausted: AtomicU64,
}

impl RetryCounters {
    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            busy: self.busy.load(Ordering::Relaxed),
            locked: self.locked.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    fn record(&self, code: ErrorCode) {
        match code {
            ErrorCode::DatabaseBusy => {
                self.busy.fetch_add(1, Ordering::Relaxed);
            }
            ErrorCode::DatabaseLocked => {
                self.locked.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Snapshot of the executor's contention counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySnapshot {
    /// Retries attributed to `SQLITE_BUSY`.
    pub busy: u64,
    /// Retries attributed to `SQLITE_LOCKED`.
    pub locked: u64,
    /// Operations that exhausted their retry budget.
    pub exhausted: u64,
}

// ============================================================================
// SECTION: Executor
// ============================================================================

/// Returns the contention code when the error is retriable.
fn retriable_code(error: &rusqlite::Error) -> Option<ErrorCode> {
    match error.sqlite_error_code() {
        Some(code @ (ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)) => Some(code),
        _ => None,
    }
}

/// Runs an operation under a retry policy.
///
/// Retries BUSY/LOCKED with the policy's backoff; any other error is
/// returned immediately as [`SqliteStoreError::Db`]. Exhaustion is logged at
/// `error` level and surfaces as [`SqliteStoreError::Busy`].
pub(crate) fn with_retry<T>(
    policy: RetryPolicy,
    counters: &RetryCounters,
    what: &str,
    mut op: impl FnMut() -> Result<T, rusqlite::Error>,
) -> Result<T, SqliteStoreError> {
    let mut retries = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                let Some(code) = retriable_code(&err) else {
                    return Err(SqliteStoreError::Db(err.to_string()));
                };
                counters.record(code);
                retries += 1;
                if retries >= policy.max_retries() {
                    counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    error!(operation = what, retries, "database still {code:?} after maximum retries");
                    return Err(SqliteStoreError::Busy(err.to_string()));
                }
                let backoff = policy.backoff(retries);
                if retries > RETRY_LOG_THRESHOLD {
                    info!(
                        operation = what,
                        retries,
                        max = policy.max_retries(),
                        slept_us = backoff.as_micros() as u64,
                        "retrying contended statement"
                    );
                }
                thread::sleep(backoff);
            }
        }
    }
}

/// Executes SQL text (no result set) under the plain statement policy.
pub(crate) fn exec_with_retry(
    conn: &Connection,
    counters: &RetryCounters,
    sql: &str,
) -> Result<usize, SqliteStoreError> {
    with_retry(RetryPolicy::Statement, counters, "exec", || conn.execute(sql, []))
}

/// Executes a SQL batch under the plain statement policy.
pub(crate) fn exec_batch_with_retry(
    conn: &Connection,
    counters: &RetryCounters,
    sql: &str,
) -> Result<(), SqliteStoreError> {
    with_retry(RetryPolicy::Statement, counters, "exec_batch", || conn.execute_batch(sql))
}

/// Runs a single-row query under the plain statement policy, `None` when the
/// query yields no row.
pub(crate) fn query_row_with_retry<T, P, F>(
    conn: &Connection,
    counters: &RetryCounters,
    sql: &str,
    params: P,
    map: F,
) -> Result<Option<T>, SqliteStoreError>
where
    P: Params + Clone,
    F: Fn(&Row<'_>) -> Result<T, rusqlite::Error>,
{
    use rusqlite::OptionalExtension;
    with_retry(RetryPolicy::Statement, counters, "query_row", || {
        conn.query_row(sql, params.clone(), &map).optional()
    })
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use super::*;

    #[test]
    fn non_contention_errors_are_not_retried() {
        let conn = Connection::open_in_memory().unwrap();
        let counters = RetryCounters::default();
        let result = exec_with_retry(&conn, &counters, "SELECT * FROM missing_table");
        assert!(matches!(result, Err(SqliteStoreError::Db(_))));
        assert_eq!(counters.snapshot(), RetrySnapshot::default());
    }

    #[test]
    fn statement_backoff_grows_linearly() {
        let policy = RetryPolicy::Statement;
        assert_eq!(policy.backoff(1), Duration::from_micros(100));
        assert_eq!(policy.backoff(10), Duration::from_micros(1_000));
    }

    #[test]
    fn prepared_backoff_stays_within_jitter_window() {
        let policy = RetryPolicy::PreparedInsert;
        for _ in 0 .. 32 {
            let backoff = policy.backoff(1);
            assert!(backoff >= Duration::from_millis(PREP_CMD_RETRY_BASE_MS));
            assert!(
                backoff
                    < Duration::from_millis(PREP_CMD_RETRY_BASE_MS + PREP_CMD_RETRY_BACKOFF_MS)
            );
        }
    }

    #[test]
    fn query_row_maps_missing_rows_to_none() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER);").unwrap();
        let counters = RetryCounters::default();
        let row = query_row_with_retry(&conn, &counters, "SELECT v FROM t", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap();
        assert_eq!(row, None);
    }
}
