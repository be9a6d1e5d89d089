// crates/curlew-store-sqlite/src/engine.rs
// ============================================================================
// Module: Readings Storage Engine
// Description: Batched INSERT, stream ingest, fetch-by-ID, and retrieval.
// Purpose: Persist and query readings across the per-asset table catalogue.
// Dependencies: curlew-core, rusqlite, serde, serde_json, thiserror, tracing
// ============================================================================

//! ## Overview
//! The engine resolves each reading's target table through the catalogue,
//! then writes the whole batch inside one transaction with the global ID
//! bound into every row. Catalogue allocation happens before the
//! transaction opens, so a rollback never leaves the in-memory map ahead of
//! an attached database that was never expanded. Reads build a `UNION ALL`
//! over the catalogued tables with the asset code injected as a constant
//! column, since the per-asset layout stores no asset column.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use curlew_core::AppendOutcome;
use curlew_core::Reading;
use curlew_core::ReadingsAppender;
use curlew_core::RetrieveQuery;
use curlew_core::StatisticsSink;
use curlew_core::StorageError;
use curlew_core::StreamDecoder;
use rusqlite::params;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

use crate::catalogue::ReadingsCatalogue;
use crate::catalogue::TableRef;
use crate::pool::ConnectionPool;
use crate::query::build_aggregate_all_sql;
use crate::query::build_retrieve_sql;
use crate::query::escape_literal;
use crate::query::map_result_set;
use crate::retry::RetryPolicy;
use crate::retry::RetrySnapshot;
use crate::retry::exec_with_retry;
use crate::retry::with_retry;
use crate::state::StoreState;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Storage engine configuration.
///
/// # Invariants
/// - `pool_size` and `readings_to_allocate` are greater than zero.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStoreConfig {
    /// Directory holding the service and readings database files.
    pub data_dir: PathBuf,
    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Readings tables created in advance per database file.
    #[serde(default = "default_readings_to_allocate")]
    pub readings_to_allocate: usize,
    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Returns the default connection pool size.
const fn default_pool_size() -> usize {
    4
}

/// Returns the default number of pre-allocated readings tables.
const fn default_readings_to_allocate() -> usize {
    15
}

/// Returns the default busy timeout in milliseconds.
const fn default_busy_timeout_ms() -> u64 {
    5_000
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Storage engine errors.
#[derive(Debug, Error, Clone)]
pub enum SqliteStoreError {
    /// Filesystem or connection failure.
    #[error("readings store io error: {0}")]
    Io(String),
    /// SQLite engine error.
    #[error("readings store db error: {0}")]
    Db(String),
    /// Lock contention outlasted the retry budget.
    #[error("readings store busy: {0}")]
    Busy(String),
    /// Malformed request or payload.
    #[error("readings store invalid request: {0}")]
    Invalid(String),
}

impl From<SqliteStoreError> for StorageError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::Io(message) => Self::Io(message),
            SqliteStoreError::Db(message) => Self::Db(message),
            SqliteStoreError::Busy(message) => Self::Busy(message),
            SqliteStoreError::Invalid(message) => Self::Invalid(message),
        }
    }
}

// ============================================================================
// SECTION: Engine
// ============================================================================

/// SQLite-backed readings store.
#[derive(Clone)]
pub struct SqliteReadingsStore {
    /// Connection pool over the service and readings databases.
    pool: Arc<ConnectionPool>,
    /// Asset-to-table catalogue and global ID source.
    catalogue: Arc<ReadingsCatalogue>,
    /// Shared write-access counter, purge block size, and retry counters.
    state: Arc<StoreState>,
}

impl SqliteReadingsStore {
    /// Opens the store: pool, schema, catalogue, pre-allocation, and the
    /// global ID boot sequence.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the databases cannot be opened or
    /// initialized.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        if config.pool_size == 0 || config.readings_to_allocate == 0 {
            return Err(SqliteStoreError::Invalid(
                "pool_size and readings_to_allocate must be greater than zero".to_string(),
            ));
        }
        let pool = Arc::new(ConnectionPool::open(
            &config.data_dir,
            config.pool_size,
            config.busy_timeout_ms,
        )?);
        let state = Arc::new(StoreState::default());
        let catalogue = Arc::new(ReadingsCatalogue::new(config.readings_to_allocate));
        catalogue.load(&pool)?;
        catalogue.preallocate(&pool, state.retry())?;
        catalogue.boot_global_id(&pool, state.retry())?;
        Ok(Self {
            pool,
            catalogue,
            state,
        })
    }

    /// The catalogue backing this store.
    #[must_use]
    pub fn catalogue(&self) -> &ReadingsCatalogue {
        &self.catalogue
    }

    /// Shared store state (write counter, purge block size, retry stats).
    #[must_use]
    pub fn state(&self) -> &StoreState {
        &self.state
    }

    /// Connection pool, for sibling modules within the crate.
    pub(crate) fn pool_ref(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Contention counters accumulated by the retry executor.
    #[must_use]
    pub fn retry_stats(&self) -> RetrySnapshot {
        self.state.retry().snapshot()
    }

    /// Writes the global ID back for a clean restart.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the value cannot be persisted.
    pub fn shutdown(&self) -> Result<(), SqliteStoreError> {
        self.catalogue.persist_global_id(&self.pool, self.state.retry())
    }

    // ------------------------------------------------------------------
    // Append paths
    // ------------------------------------------------------------------

    /// Appends a JSON ingest document (`{"readings": [...]}`).
    ///
    /// Malformed readings are skipped and counted; a storage failure rolls
    /// the whole batch back.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError::Invalid`] for an unparseable envelope and
    /// other variants for storage failures.
    pub fn append_readings_json(&self, payload: &str) -> Result<AppendOutcome, SqliteStoreError> {
        let document: Value = serde_json::from_str(payload)
            .map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
        let Some(elements) = document.get("readings").and_then(Value::as_array) else {
            return Err(SqliteStoreError::Invalid(
                "payload is missing a readings array".to_string(),
            ));
        };
        let mut readings = Vec::with_capacity(elements.len());
        let mut skipped = 0;
        for element in elements {
            match Reading::from_json(element) {
                Ok(reading) => readings.push(reading),
                Err(err) => {
                    warn!(error = %err, "skipping malformed reading");
                    skipped += 1;
                }
            }
        }
        let mut outcome = self.append(&readings)?;
        outcome.skipped += skipped;
        Ok(outcome)
    }

    /// Appends a packed binary reading stream.
    ///
    /// The commit is unconditional: the connection goes back to the pool
    /// between calls, so no transaction may stay open.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the decoded batch cannot be
    /// persisted.
    pub fn reading_stream(&self, buffer: &[u8]) -> Result<AppendOutcome, SqliteStoreError> {
        let mut readings = Vec::new();
        let mut skipped = 0;
        for frame in StreamDecoder::new(buffer) {
            match frame {
                Ok(reading) => readings.push(reading),
                Err(err) => {
                    warn!(error = %err, "reading stream frame rejected");
                    skipped += 1;
                }
            }
        }
        let mut outcome = self.append(&readings)?;
        outcome.skipped += skipped;
        Ok(outcome)
    }

    /// Appends a batch of validated readings in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] after rolling back when any INSERT
    /// fails terminally.
    pub fn append(&self, readings: &[Reading]) -> Result<AppendOutcome, SqliteStoreError> {
        if readings.is_empty() {
            return Ok(AppendOutcome::default());
        }

        // Resolve every target table before the transaction opens; first
        // sight of an asset may attach a new database, which cannot happen
        // inside an open transaction.
        let mut rows = Vec::with_capacity(readings.len());
        let mut last_asset: Option<(&str, TableRef)> = None;
        for reading in readings {
            let table = match last_asset {
                Some((asset, table)) if asset == reading.asset_code => table,
                _ => {
                    let table = self.catalogue.reading_reference(
                        &self.pool,
                        self.state.retry(),
                        &reading.asset_code,
                    )?;
                    last_asset = Some((reading.asset_code.as_str(), table));
                    table
                }
            };
            rows.push((table, reading.user_ts.to_sqlite(), reading.payload.to_string()));
        }

        let counters = self.state.retry();
        let connection = self.pool.checkout();
        let guard = self.pool.lock(connection);
        let _write = self.state.enter_write();
        exec_with_retry(&guard, counters, "BEGIN TRANSACTION")?;
        let mut inserted = 0;
        for (table, user_ts, payload) in rows {
            let sql = insert_sql(table);
            let id = self.catalogue.next_id();
            let result = with_retry(RetryPolicy::PreparedInsert, counters, "append", || {
                let mut stmt = guard.prepare_cached(&sql)?;
                stmt.execute(params![id, user_ts, payload])
            });
            match result {
                Ok(_) => inserted += 1,
                Err(err) => {
                    warn!(table_id = table.table_id, error = %err, "insert failed, rolling back batch");
                    let _ = guard.execute_batch("ROLLBACK TRANSACTION");
                    return Err(err);
                }
            }
        }
        if let Err(err) = exec_with_retry(&guard, counters, "END TRANSACTION") {
            let _ = guard.execute_batch("ROLLBACK TRANSACTION");
            return Err(err);
        }
        debug!(inserted, "readings batch committed");
        Ok(AppendOutcome {
            inserted,
            skipped: 0,
        })
    }

    // ------------------------------------------------------------------
    // Read paths
    // ------------------------------------------------------------------

    /// Fetches up to `blk_size` rows with `id >= from_id`, ascending, with
    /// timestamps rendered in UTC. Used by north-side export pipelines.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the query fails.
    pub fn fetch_readings(&self, from_id: i64, blk_size: u32) -> Result<Value, SqliteStoreError> {
        let Some(union) = self.readings_union() else {
            return Ok(json!({"count": 0, "rows": []}));
        };
        let sql = format!(
            "SELECT id, asset_code, reading, \
             strftime('%Y-%m-%d %H:%M:%S', user_ts) || \
             substr(user_ts, instr(user_ts, '.'), 7) AS user_ts, \
             strftime('%Y-%m-%d %H:%M:%f', ts) AS ts \
             FROM ({union}) WHERE id >= {from_id} ORDER BY id ASC LIMIT {blk_size}"
        );
        self.run_result_set(&sql)
    }

    /// Runs a retrieval request; an empty condition dumps the readings.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError::Invalid`] for unparseable or unsupported
    /// payloads and other variants for storage failures.
    pub fn retrieve_readings(&self, condition: &str) -> Result<Value, SqliteStoreError> {
        let Some(union) = self.readings_union() else {
            return Ok(json!({"count": 0, "rows": []}));
        };
        let trimmed = condition.trim();
        let sql = if trimmed.is_empty() {
            build_retrieve_sql(&RetrieveQuery::default(), &union)?
        } else {
            let query: RetrieveQuery = serde_json::from_str(trimmed)
                .map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
            if query.is_aggregate_all() {
                build_aggregate_all_sql(&query, &union)?
            } else {
                build_retrieve_sql(&query, &union)?
            }
        };
        self.run_result_set(&sql)
    }

    /// `UNION ALL` of every catalogued readings table with the asset code
    /// as a constant column; `None` when no asset is catalogued yet.
    fn readings_union(&self) -> Option<String> {
        let entries = self.catalogue.entries();
        if entries.is_empty() {
            return None;
        }
        let mut union = String::new();
        for (index, entry) in entries.iter().enumerate() {
            if index > 0 {
                union.push_str(" UNION ALL ");
            }
            union.push_str(&format!(
                "SELECT id, {} AS asset_code, reading, user_ts, ts FROM {}",
                escape_literal(&entry.asset_code),
                entry.table.qualified_name()
            ));
        }
        Some(union)
    }

    /// Executes a SELECT and maps the rows into `{count, rows}`.
    fn run_result_set(&self, sql: &str) -> Result<Value, SqliteStoreError> {
        debug!(sql, "readings query");
        let connection = self.pool.checkout();
        let guard = self.pool.lock(connection);
        map_result_set(&guard, self.state.retry(), sql)
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Creates a statistics row when absent.
    fn ensure_statistic_row(&self, key: &str, description: &str) -> Result<(), SqliteStoreError> {
        let counters = self.state.retry();
        let connection = self.pool.checkout();
        let guard = self.pool.lock(connection);
        with_retry(RetryPolicy::Statement, counters, "ensure_statistic", || {
            let mut stmt = guard.prepare_cached(
                "INSERT INTO statistics (key, description, value, previous_value) \
                 VALUES (?1, ?2, 0, 0) ON CONFLICT(key) DO NOTHING",
            )?;
            stmt.execute(params![key, description])
        })
        .map(|_| ())
    }

    /// Adds each delta to its statistics row inside one transaction.
    fn bump_statistics_rows(&self, deltas: &[(String, i64)]) -> Result<(), SqliteStoreError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let counters = self.state.retry();
        let connection = self.pool.checkout();
        let guard = self.pool.lock(connection);
        exec_with_retry(&guard, counters, "BEGIN TRANSACTION")?;
        for (key, delta) in deltas {
            let result = with_retry(RetryPolicy::Statement, counters, "bump_statistic", || {
                let mut stmt = guard.prepare_cached(
                    "UPDATE statistics SET value = value + ?2 WHERE key = ?1",
                )?;
                stmt.execute(params![key, delta])
            });
            if let Err(err) = result {
                let _ = guard.execute_batch("ROLLBACK TRANSACTION");
                return Err(err);
            }
        }
        exec_with_retry(&guard, counters, "END TRANSACTION")?;
        Ok(())
    }
}

/// INSERT statement text for one readings table; the SQL string doubles as
/// the per-table key of the connection's prepared statement cache.
fn insert_sql(table: TableRef) -> String {
    format!(
        "INSERT INTO {} (id, user_ts, reading) VALUES (?1, ?2, ?3)",
        table.qualified_name()
    )
}

// ============================================================================
// SECTION: Seam Implementations
// ============================================================================

impl ReadingsAppender for SqliteReadingsStore {
    fn append_readings(&self, readings: &[Reading]) -> Result<AppendOutcome, StorageError> {
        self.append(readings).map_err(StorageError::from)
    }
}

impl StatisticsSink for SqliteReadingsStore {
    fn ensure_statistic(&self, key: &str, description: &str) -> Result<(), StorageError> {
        self.ensure_statistic_row(key, description).map_err(StorageError::from)
    }

    fn bump_statistics(&self, deltas: &[(String, i64)]) -> Result<(), StorageError> {
        self.bump_statistics_rows(deltas).map_err(StorageError::from)
    }
}
