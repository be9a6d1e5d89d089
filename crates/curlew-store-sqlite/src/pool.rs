// crates/curlew-store-sqlite/src/pool.rs
// ============================================================================
// Module: Connection Pool
// Description: Fixed pool of SQLite connections with readings attachments.
// Purpose: Give each worker a connection without sharing statement state.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! Every pooled connection opens the service database as `main` and attaches
//! the readings files under their `readings_<n>` aliases. Checkout is
//! round-robin; a caller holds the connection mutex only for the duration of
//! one operation. New readings databases created by catalogue expansion are
//! attached on every pooled connection before any table is created in them.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use rusqlite::Connection;
use rusqlite::OpenFlags;

use crate::engine::SqliteStoreError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Service database filename (statistics and service-local tables).
pub(crate) const SERVICE_DB_FILE: &str = "curlew.db";
/// Basename shared by readings database files and their aliases.
pub(crate) const READINGS_DB_BASE: &str = "readings";
/// Prepared statement cache capacity per connection.
const STATEMENT_CACHE_CAPACITY: usize = 128;

/// Filename of the readings database with the given id.
pub(crate) fn readings_db_file(db_id: u64) -> String {
    format!("{READINGS_DB_BASE}_{db_id}.db")
}

/// Attachment alias of the readings database with the given id.
pub(crate) fn readings_db_alias(db_id: u64) -> String {
    format!("{READINGS_DB_BASE}_{db_id}")
}

// ============================================================================
// SECTION: Pool
// ============================================================================

/// Fixed pool of connections over the service and readings databases.
#[derive(Debug)]
pub(crate) struct ConnectionPool {
    /// Pooled connections, each guarded by its own mutex.
    connections: Vec<Mutex<Connection>>,
    /// Round-robin checkout cursor.
    cursor: AtomicUsize,
    /// Directory holding the database files.
    data_dir: PathBuf,
}

impl ConnectionPool {
    /// Opens the pool, initializing the service schema and attaching the
    /// first readings database.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when a file cannot be opened or the
    /// schema cannot be initialized.
    pub(crate) fn open(
        data_dir: &Path,
        pool_size: usize,
        busy_timeout_ms: u64,
    ) -> Result<Self, SqliteStoreError> {
        std::fs::create_dir_all(data_dir).map_err(|err| SqliteStoreError::Io(err.to_string()))?;
        let mut connections = Vec::with_capacity(pool_size);
        for index in 0 .. pool_size {
            let connection = open_connection(data_dir, busy_timeout_ms)?;
            attach(&connection, &data_dir.join(readings_db_file(1)), &readings_db_alias(1))?;
            if index == 0 {
                initialize_schema(&connection)?;
            }
            connections.push(Mutex::new(connection));
        }
        Ok(Self {
            connections,
            cursor: AtomicUsize::new(0),
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Returns the next connection using round-robin selection.
    pub(crate) fn checkout(&self) -> &Mutex<Connection> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        &self.connections[index]
    }

    /// Locks a connection, recovering from poisoning (connections carry no
    /// invariants a panicked holder could break mid-statement).
    pub(crate) fn lock<'pool>(
        &'pool self,
        connection: &'pool Mutex<Connection>,
    ) -> std::sync::MutexGuard<'pool, Connection> {
        connection.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Attaches a readings database on every pooled connection.
    ///
    /// The caller must not hold any pooled connection while calling this.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when an ATTACH fails; earlier
    /// attachments are left in place (re-attachment is idempotent per
    /// alias).
    pub(crate) fn attach_all(&self, db_id: u64) -> Result<(), SqliteStoreError> {
        let path = self.data_dir.join(readings_db_file(db_id));
        let alias = readings_db_alias(db_id);
        for connection in &self.connections {
            let guard = self.lock(connection);
            attach(&guard, &path, &alias)?;
        }
        Ok(())
    }

    /// Directory holding the database files.
    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

// ============================================================================
// SECTION: Connection Setup
// ============================================================================

/// Opens one service connection with the store's pragmas applied.
fn open_connection(data_dir: &Path, busy_timeout_ms: u64) -> Result<Connection, SqliteStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(data_dir.join(SERVICE_DB_FILE), flags)
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    connection
        .execute_batch("PRAGMA journal_mode = wal;")
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(connection)
}

/// Attaches a database file under an alias, creating the file on demand.
/// Re-attachment of an existing alias is treated as success.
pub(crate) fn attach(
    connection: &Connection,
    path: &Path,
    alias: &str,
) -> Result<(), SqliteStoreError> {
    let escaped = path.to_string_lossy().replace('\'', "''");
    let sql = format!("ATTACH DATABASE '{escaped}' AS {alias};");
    match connection.execute_batch(&sql) {
        Ok(()) => {
            connection
                .execute_batch(&format!("PRAGMA {alias}.journal_mode = wal;"))
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            Ok(())
        }
        Err(err) if err.to_string().contains("already in use") => Ok(()),
        Err(err) => Err(SqliteStoreError::Db(err.to_string())),
    }
}

/// Creates the service-side and readings-side metadata tables.
fn initialize_schema(connection: &Connection) -> Result<(), SqliteStoreError> {
    let readings = readings_db_alias(1);
    connection
        .execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS statistics (
                key            TEXT PRIMARY KEY,
                description    TEXT NOT NULL,
                value          INTEGER NOT NULL DEFAULT 0,
                previous_value INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS {readings}.configuration_readings (
                global_id INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {readings}.asset_reading_catalogue (
                table_id   INTEGER NOT NULL PRIMARY KEY,
                db_id      INTEGER NOT NULL,
                asset_code TEXT    NOT NULL
            );"
        ))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(())
}
