// crates/curlew-store-sqlite/src/state.rs
// ============================================================================
// Module: Store Shared State
// Description: Process-wide mutable store state in one owning object.
// Purpose: Make the write-access counter and purge block size testable
//          instead of hiding them in statics.
// Dependencies: none beyond std
// ============================================================================

//! ## Overview
//! Bulk writers hold the write-access counter for the duration of their
//! INSERT transaction; the purge worker refuses to start a DELETE block
//! while it is non-zero. The purge block size is mutated only by the purge
//! worker, between blocks, and is clamped to `[20, 1500]` at every update.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::retry::RetryCounters;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Initial purge delete block size, in rows.
pub const INITIAL_PURGE_BLOCK_SIZE: usize = 20;
/// Lower clamp for the purge delete block size.
pub const MIN_PURGE_BLOCK_SIZE: usize = 20;
/// Upper clamp for the purge delete block size.
pub const MAX_PURGE_BLOCK_SIZE: usize = 1_500;

// ============================================================================
// SECTION: State
// ============================================================================

/// Shared mutable state of one store instance.
#[derive(Debug)]
pub struct StoreState {
    /// Number of bulk-write transactions currently in flight.
    write_access: AtomicU32,
    /// Purge delete block size, in rows.
    purge_block_size: AtomicUsize,
    /// Retry executor contention counters.
    retry: RetryCounters,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            write_access: AtomicU32::new(0),
            purge_block_size: AtomicUsize::new(INITIAL_PURGE_BLOCK_SIZE),
            retry: RetryCounters::default(),
        }
    }
}

impl StoreState {
    /// Current purge delete block size.
    #[must_use]
    pub fn purge_block_size(&self) -> usize {
        self.purge_block_size.load(Ordering::Relaxed)
    }

    /// Installs a recomputed block size, clamped to the documented range.
    pub(crate) fn set_purge_block_size(&self, size: usize) {
        let clamped = size.clamp(MIN_PURGE_BLOCK_SIZE, MAX_PURGE_BLOCK_SIZE);
        self.purge_block_size.store(clamped, Ordering::Relaxed);
    }

    /// True while a bulk-write transaction is in flight.
    #[must_use]
    pub fn write_access_ongoing(&self) -> bool {
        self.write_access.load(Ordering::Acquire) > 0
    }

    /// Marks a bulk-write transaction; the guard releases it on drop.
    pub(crate) fn enter_write(&self) -> WriteAccessGuard<'_> {
        self.write_access.fetch_add(1, Ordering::AcqRel);
        WriteAccessGuard {
            state: self,
        }
    }

    /// Retry executor counters.
    pub(crate) fn retry(&self) -> &RetryCounters {
        &self.retry
    }
}

/// Releases the write-access counter when the bulk write completes.
#[derive(Debug)]
pub(crate) struct WriteAccessGuard<'state> {
    /// Owning state.
    state: &'state StoreState,
}

impl Drop for WriteAccessGuard<'_> {
    fn drop(&mut self) {
        self.state.write_access.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
