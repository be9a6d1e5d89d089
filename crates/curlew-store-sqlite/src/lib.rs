// crates/curlew-store-sqlite/src/lib.rs
// ============================================================================
// Module: Curlew SQLite Store Library
// Description: Readings catalogue, storage engine, and adaptive purge.
// Purpose: Persist readings into per-asset tables spread across attached
//          SQLite database files.
// Dependencies: curlew-core, rusqlite, rand, serde, serde_json, thiserror,
//               tracing
// ============================================================================

//! ## Overview
//! The store owns a pool of SQLite connections over one service database
//! plus a family of readings database files (`readings_1.db`,
//! `readings_2.db`, …) attached under matching aliases. The
//! [`ReadingsCatalogue`] maps each asset to its own `readings_<k>` table and
//! issues the monotonic global ID bound into every INSERT. The
//! [`SqliteReadingsStore`] engine appends batches transactionally, answers
//! fetch/retrieve queries across all tables, and hosts the adaptive purge.
//! Every statement execution goes through the bounded BUSY/LOCKED retry
//! executor.
//! Invariants:
//! - Global IDs are strictly monotonic across all readings tables.
//! - Two asset codes never share a readings table.
//! - The purge block size stays within `[20, 1500]`.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod catalogue;
pub mod engine;
pub mod pool;
pub mod purge;
pub mod query;
pub mod retry;
pub mod state;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use catalogue::CatalogueEntry;
pub use catalogue::ReadingsCatalogue;
pub use catalogue::TableRef;
pub use engine::SqliteReadingsStore;
pub use engine::SqliteStoreConfig;
pub use engine::SqliteStoreError;
pub use purge::PurgeResult;
pub use purge::PurgeWorker;
pub use retry::MAX_RETRIES;
pub use retry::PREP_CMD_MAX_RETRIES;
pub use retry::RetrySnapshot;
pub use state::MAX_PURGE_BLOCK_SIZE;
pub use state::MIN_PURGE_BLOCK_SIZE;
pub use state::StoreState;
