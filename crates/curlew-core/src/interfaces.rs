// crates/curlew-core/src/interfaces.rs
// ============================================================================
// Module: Subsystem Seams
// Description: Traits decoupling ingest workers from storage and management.
// Purpose: Let the scheduler and statistics workers run against mocks.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! The flush worker persists batches through [`ReadingsAppender`]; the
//! statistics worker flushes counters through [`StatisticsSink`] and
//! registers asset-tracking tuples through [`AssetTrackerApi`]. The sqlite
//! engine implements the first two, the management client the third. Tests
//! substitute in-memory fakes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::reading::Reading;

// ============================================================================
// SECTION: Storage Seam
// ============================================================================

/// Storage-side failure visible to ingest.
///
/// # Invariants
/// - `Busy` means the retry executor exhausted its budget; the batch is
///   re-queueable.
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    /// Database engine error.
    #[error("storage db error: {0}")]
    Db(String),
    /// Filesystem or connection error.
    #[error("storage io error: {0}")]
    Io(String),
    /// Lock contention outlasted the retry budget.
    #[error("storage busy: {0}")]
    Busy(String),
    /// Malformed request or payload.
    #[error("storage invalid request: {0}")]
    Invalid(String),
}

/// Outcome of a batch append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Rows written.
    pub inserted: usize,
    /// Readings skipped for malformed timestamps or payloads.
    pub skipped: usize,
}

/// Batch persistence seam between the flush worker and the storage engine.
pub trait ReadingsAppender: Send + Sync {
    /// Appends a batch; all-or-nothing for the insertable readings.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the transaction rolled back; the caller
    /// decides whether to re-queue the batch.
    fn append_readings(&self, readings: &[Reading]) -> Result<AppendOutcome, StorageError>;
}

/// Statistics table seam used by the stats worker.
pub trait StatisticsSink: Send + Sync {
    /// Creates the counter row when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the row cannot be created.
    fn ensure_statistic(&self, key: &str, description: &str) -> Result<(), StorageError>;

    /// Adds each delta to its counter row in one batch.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the update fails; the caller retains
    /// the pending deltas and retries on the next tick.
    fn bump_statistics(&self, deltas: &[(String, i64)]) -> Result<(), StorageError>;
}

// ============================================================================
// SECTION: Management Seam
// ============================================================================

/// Management API failure. Never blocks the data path; callers log and
/// retry on their next tick.
#[derive(Debug, Error, Clone)]
pub enum ManagementError {
    /// Transport-level failure.
    #[error("management http error: {0}")]
    Http(String),
    /// The service answered with a non-success payload.
    #[error("management api error: {0}")]
    Api(String),
    /// Bearer token rejected or expired.
    #[error("management token error: {0}")]
    Token(String),
}

/// One asset-tracking record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetTrackingTuple {
    /// Service that observed the asset.
    pub service: String,
    /// Plugin that produced the readings.
    pub plugin: String,
    /// Asset code.
    pub asset: String,
    /// Event name, `Ingest` for the south side.
    pub event: String,
}

impl AssetTrackingTuple {
    /// Builds an `Ingest` tuple for the given names.
    #[must_use]
    pub fn ingest(service: &str, plugin: &str, asset: &str) -> Self {
        Self {
            service: service.to_string(),
            plugin: plugin.to_string(),
            asset: asset.to_string(),
            event: "Ingest".to_string(),
        }
    }
}

/// Asset-tracker seam between the flush worker and the management client.
pub trait AssetTrackerApi: Send + Sync {
    /// Fetches known tuples to pre-populate the dedup cache.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError`] on transport or API failure.
    fn tuples(
        &self,
        service: &str,
        event: &str,
    ) -> Result<Vec<AssetTrackingTuple>, ManagementError>;

    /// Records a tuple on first sight.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError`] on transport or API failure.
    fn record_tuple(&self, tuple: &AssetTrackingTuple) -> Result<(), ManagementError>;
}
