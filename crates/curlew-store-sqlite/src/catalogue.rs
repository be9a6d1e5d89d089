// crates/curlew-store-sqlite/src/catalogue.rs
// ============================================================================
// Module: Readings Catalogue
// Description: Asset-to-table mapping, physical layout, and global IDs.
// Purpose: Resolve each asset to its own readings table, allocating tables
//          and database files on demand, and issue the monotonic global ID.
// Dependencies: rusqlite, tracing
// ============================================================================

//! ## Overview
//! The catalogue maps `asset_code → (table_id, db_id)`. Lookups take a read
//! lock and see a consistent snapshot; allocation of a new entry is
//! serialized under a separate mutex with a re-check, so two writers racing
//! on a new asset agree on one table. Tables are pre-allocated in blocks:
//! when the current database file has no free table left, a new
//! `readings_<d>.db` is created, attached on every pooled connection, and
//! populated with a fresh block of empty tables.
//!
//! The global ID is read from `configuration_readings` at startup, adopted
//! when it is a real value, recomputed from `max(id)` over every readings
//! table when it carries the `-1` crash marker, and immediately re-marked
//! `-1` so an ungraceful shutdown forces recomputation on the next boot.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use rusqlite::Connection;
use tracing::debug;
use tracing::info;

use crate::engine::SqliteStoreError;
use crate::pool::ConnectionPool;
use crate::pool::readings_db_alias;
use crate::pool::readings_db_file;
use crate::retry::RetryCounters;
use crate::retry::exec_with_retry;
use crate::retry::query_row_with_retry;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Crash marker stored in `configuration_readings` while the service runs.
const GLOBAL_ID_RECALC_MARKER: i64 = -1;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Physical location of one asset's readings table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    /// Table number within the catalogue (`readings_<table_id>`).
    pub table_id: u64,
    /// Database file number (`readings_<db_id>.db`).
    pub db_id: u64,
}

impl TableRef {
    /// Fully qualified SQL name of the table.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.readings_{}", readings_db_alias(self.db_id), self.table_id)
    }
}

/// One catalogue row, used when building cross-table queries.
#[derive(Debug, Clone)]
pub struct CatalogueEntry {
    /// Asset the table belongs to.
    pub asset_code: String,
    /// Physical table location.
    pub table: TableRef,
}

/// Allocation bookkeeping guarded by the catalogue mutex.
#[derive(Debug)]
struct AllocState {
    /// Database file currently receiving new tables.
    db_id: u64,
    /// Pre-allocated tables still unassigned in the current database.
    available: usize,
}

// ============================================================================
// SECTION: Catalogue
// ============================================================================

/// Asset-to-table catalogue with global ID issuance.
///
/// # Invariants
/// - Two asset codes never share a `table_id`.
/// - `table_id` values are dense and monotonic; gaps appear only after
///   operator intervention and are tolerated on read.
/// - The in-memory global ID is strictly monotonic for the store lifetime.
#[derive(Debug)]
pub struct ReadingsCatalogue {
    /// Asset map; reads take the read lock, allocation writes the map under
    /// both the allocation mutex and the write lock.
    assets: RwLock<HashMap<String, TableRef>>,
    /// Allocation state, serialized under its own mutex.
    alloc: Mutex<AllocState>,
    /// Next global reading ID.
    global_id: AtomicI64,
    /// Tables created in advance per database file.
    readings_to_allocate: usize,
}

impl ReadingsCatalogue {
    /// Creates an empty catalogue targeting database file 1.
    #[must_use]
    pub(crate) fn new(readings_to_allocate: usize) -> Self {
        Self {
            assets: RwLock::new(HashMap::new()),
            alloc: Mutex::new(AllocState {
                db_id: 1,
                available: 0,
            }),
            global_id: AtomicI64::new(1),
            readings_to_allocate,
        }
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Loads the persisted catalogue and attaches every known database.
    pub(crate) fn load(&self, pool: &ConnectionPool) -> Result<(), SqliteStoreError> {
        let rows = {
            let connection = pool.checkout();
            let guard = pool.lock(connection);
            let mut stmt = guard
                .prepare(&format!(
                    "SELECT table_id, db_id, asset_code FROM {}.asset_reading_catalogue \
                     ORDER BY table_id",
                    readings_db_alias(1)
                ))
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row.map_err(|err| SqliteStoreError::Db(err.to_string()))?);
            }
            rows
        };

        let mut max_db_id = 1;
        {
            let mut assets = self.write_assets();
            for (table_id, db_id, asset_code) in rows {
                let table = TableRef {
                    table_id: u64::try_from(table_id).unwrap_or(0),
                    db_id: u64::try_from(db_id).unwrap_or(1),
                };
                max_db_id = max_db_id.max(table.db_id);
                debug!(asset = %asset_code, table_id = table.table_id, db_id = table.db_id, "catalogue entry loaded");
                assets.insert(asset_code, table);
            }
        }
        for db_id in 2 ..= max_db_id {
            pool.attach_all(db_id)?;
        }
        let mut alloc = self.lock_alloc();
        alloc.db_id = max_db_id;
        Ok(())
    }

    /// Creates pre-allocated tables up to the configured count in the
    /// current database, then refreshes the availability counter.
    pub(crate) fn preallocate(
        &self,
        pool: &ConnectionPool,
        counters: &RetryCounters,
    ) -> Result<(), SqliteStoreError> {
        let (db_id, to_create, start_id) = {
            let alloc = self.lock_alloc();
            let (last_table, table_count) = self.scan_tables(pool, alloc.db_id)?;
            let to_create = self.readings_to_allocate.saturating_sub(table_count);
            (alloc.db_id, to_create, last_table + 1)
        };
        if to_create > 0 {
            self.create_tables(pool, counters, db_id, start_id, to_create)?;
        }
        let used = self.used_tables(db_id);
        let mut alloc = self.lock_alloc();
        alloc.available = self.readings_to_allocate.saturating_sub(used);
        Ok(())
    }

    /// Boots the global ID: adopt a stored real value, recompute from the
    /// data when the crash marker (or nothing) is stored, then write the
    /// crash marker back.
    pub(crate) fn boot_global_id(
        &self,
        pool: &ConnectionPool,
        counters: &RetryCounters,
    ) -> Result<(), SqliteStoreError> {
        let connection = pool.checkout();
        let guard = pool.lock(connection);
        let stored = query_row_with_retry(
            &guard,
            counters,
            &format!("SELECT global_id FROM {}.configuration_readings", readings_db_alias(1)),
            [],
            |row| row.get::<_, i64>(0),
        )?;
        let next = match stored {
            Some(value) if value >= 1 => value,
            Some(_) => self.calculate_global_id(&guard, counters)?,
            None => {
                exec_with_retry(
                    &guard,
                    counters,
                    &format!(
                        "INSERT INTO {}.configuration_readings VALUES (1)",
                        readings_db_alias(1)
                    ),
                )?;
                self.calculate_global_id(&guard, counters)?
            }
        };
        self.global_id.store(next, Ordering::SeqCst);
        info!(global_id = next, "global reading id adopted");
        // Mark for recomputation in case the service dies without a clean
        // shutdown; persist_global_id restores the real value.
        exec_with_retry(
            &guard,
            counters,
            &format!(
                "UPDATE {}.configuration_readings SET global_id = {GLOBAL_ID_RECALC_MARKER}",
                readings_db_alias(1)
            ),
        )?;
        Ok(())
    }

    /// Writes the current global ID back on graceful shutdown.
    pub(crate) fn persist_global_id(
        &self,
        pool: &ConnectionPool,
        counters: &RetryCounters,
    ) -> Result<(), SqliteStoreError> {
        let connection = pool.checkout();
        let guard = pool.lock(connection);
        exec_with_retry(
            &guard,
            counters,
            &format!(
                "UPDATE {}.configuration_readings SET global_id = {}",
                readings_db_alias(1),
                self.global_id.load(Ordering::SeqCst)
            ),
        )?;
        Ok(())
    }

    /// Computes `max(id) + 1` over every readings table.
    fn calculate_global_id(
        &self,
        connection: &Connection,
        counters: &RetryCounters,
    ) -> Result<i64, SqliteStoreError> {
        let assets = self.read_assets();
        let mut union = String::new();
        if assets.is_empty() {
            union.push_str(&format!(
                "SELECT max(id) id FROM {}.readings_1",
                readings_db_alias(1)
            ));
        } else {
            for (index, table) in assets.values().enumerate() {
                if index > 0 {
                    union.push_str(" UNION ");
                }
                union.push_str(&format!("SELECT max(id) id FROM {}", table.qualified_name()));
            }
        }
        drop(assets);
        let max_id = query_row_with_retry(
            connection,
            counters,
            &format!("SELECT max(id) id FROM ({union}) AS tb"),
            [],
            |row| row.get::<_, Option<i64>>(0),
        )?
        .flatten();
        Ok(max_id.map_or(1, |id| id + 1))
    }

    // ------------------------------------------------------------------
    // Issuance and resolution
    // ------------------------------------------------------------------

    /// Returns the next global reading ID.
    pub fn next_id(&self) -> i64 {
        self.global_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Next ID that would be issued, without consuming it.
    #[must_use]
    pub fn peek_next_id(&self) -> i64 {
        self.global_id.load(Ordering::SeqCst)
    }

    /// Resolves the readings table for an asset, allocating one on first
    /// sight.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when allocation of a table or a new
    /// database file fails.
    pub fn reading_reference(
        &self,
        pool: &ConnectionPool,
        counters: &RetryCounters,
        asset_code: &str,
    ) -> Result<TableRef, SqliteStoreError> {
        if let Some(table) = self.read_assets().get(asset_code) {
            return Ok(*table);
        }
        let mut alloc = self.lock_alloc();
        // Re-check under the allocation mutex: another writer may have won.
        if let Some(table) = self.read_assets().get(asset_code) {
            return Ok(*table);
        }
        if alloc.available == 0 {
            self.expand_new_db(pool, counters, &mut alloc)?;
        }
        let table = TableRef {
            table_id: self.max_readings_id() + 1,
            db_id: alloc.db_id,
        };
        {
            let connection = pool.checkout();
            let guard = pool.lock(connection);
            exec_with_retry(
                &guard,
                counters,
                &format!(
                    "INSERT INTO {}.asset_reading_catalogue (table_id, db_id, asset_code) \
                     VALUES ({}, {}, '{}')",
                    readings_db_alias(1),
                    table.table_id,
                    table.db_id,
                    asset_code.replace('\'', "''")
                ),
            )?;
        }
        alloc.available -= 1;
        self.write_assets().insert(asset_code.to_string(), table);
        info!(asset = asset_code, table_id = table.table_id, db_id = table.db_id, "asset assigned to readings table");
        Ok(table)
    }

    // ------------------------------------------------------------------
    // Physical layout
    // ------------------------------------------------------------------

    /// Creates a new readings database, attaches it pool-wide, and
    /// pre-allocates a fresh block of tables in it.
    fn expand_new_db(
        &self,
        pool: &ConnectionPool,
        counters: &RetryCounters,
        alloc: &mut AllocState,
    ) -> Result<(), SqliteStoreError> {
        alloc.db_id += 1;
        let path = pool.data_dir().join(readings_db_file(alloc.db_id));
        let pre_existing = path.exists();
        if pre_existing {
            info!(path = %path.display(), "readings database already present, creation skipped");
        } else {
            // Create the file before attaching so every pooled connection
            // sees the same database.
            let created = Connection::open(&path)
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            drop(created);
        }
        pool.attach_all(alloc.db_id)?;

        let (last_table, table_count) = if pre_existing {
            self.scan_tables(pool, alloc.db_id)?
        } else {
            (self.max_readings_id(), 0)
        };
        let to_create = self.readings_to_allocate.saturating_sub(table_count);
        if to_create > 0 {
            self.create_tables(pool, counters, alloc.db_id, last_table + 1, to_create)?;
        }
        alloc.available = self.readings_to_allocate;
        Ok(())
    }

    /// Creates `count` readings tables starting at `start_id`.
    fn create_tables(
        &self,
        pool: &ConnectionPool,
        counters: &RetryCounters,
        db_id: u64,
        start_id: u64,
        count: usize,
    ) -> Result<(), SqliteStoreError> {
        info!(count, db_id, "creating readings tables in advance");
        let alias = readings_db_alias(db_id);
        let connection = pool.checkout();
        let guard = pool.lock(connection);
        for offset in 0 .. count as u64 {
            let table_id = start_id + offset;
            exec_with_retry(
                &guard,
                counters,
                &format!(
                    "CREATE TABLE {alias}.readings_{table_id} (
                        id      INTEGER PRIMARY KEY AUTOINCREMENT,
                        reading JSON NOT NULL DEFAULT '{{}}',
                        user_ts DATETIME DEFAULT (STRFTIME('%Y-%m-%d %H:%M:%f+00:00', 'NOW')),
                        ts      DATETIME DEFAULT (STRFTIME('%Y-%m-%d %H:%M:%f+00:00', 'NOW'))
                    )"
                ),
            )?;
            exec_with_retry(
                &guard,
                counters,
                &format!(
                    "CREATE INDEX {alias}.readings_{table_id}_ix3 ON readings_{table_id} (user_ts)"
                ),
            )?;
        }
        Ok(())
    }

    /// Scans a database for existing `readings_%` tables, returning the
    /// highest table number and the count.
    fn scan_tables(&self, pool: &ConnectionPool, db_id: u64) -> Result<(u64, usize), SqliteStoreError> {
        let connection = pool.checkout();
        let guard = pool.lock(connection);
        let mut stmt = guard
            .prepare(&format!(
                "SELECT name FROM {}.sqlite_master WHERE type='table' AND name LIKE 'readings_%'",
                readings_db_alias(db_id)
            ))
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        let mut max_id = 0;
        let mut count = 0;
        for name in names {
            let name = name.map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            let Some(id) = name.rsplit('_').next().and_then(|raw| raw.parse::<u64>().ok()) else {
                continue;
            };
            max_id = max_id.max(id);
            count += 1;
        }
        // Start numbering after every table known anywhere, not just in
        // this file.
        Ok((max_id.max(self.max_readings_id()), count))
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Snapshot of the assigned tables, ordered by table number.
    #[must_use]
    pub fn entries(&self) -> Vec<CatalogueEntry> {
        let assets = self.read_assets();
        let mut entries: Vec<CatalogueEntry> = assets
            .iter()
            .map(|(asset_code, table)| CatalogueEntry {
                asset_code: asset_code.clone(),
                table: *table,
            })
            .collect();
        entries.sort_by_key(|entry| entry.table.table_id);
        entries
    }

    /// Number of assets currently catalogued.
    #[must_use]
    pub fn asset_count(&self) -> usize {
        self.read_assets().len()
    }

    /// Highest assigned table number.
    fn max_readings_id(&self) -> u64 {
        self.read_assets().values().map(|table| table.table_id).max().unwrap_or(0)
    }

    /// Number of catalogued tables living in the given database file.
    fn used_tables(&self, db_id: u64) -> usize {
        self.read_assets().values().filter(|table| table.db_id == db_id).count()
    }

    fn read_assets(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TableRef>> {
        self.assets.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_assets(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TableRef>> {
        self.assets.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_alloc(&self) -> std::sync::MutexGuard<'_, AllocState> {
        self.alloc.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
