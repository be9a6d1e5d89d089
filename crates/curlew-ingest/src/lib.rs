// crates/curlew-ingest/src/lib.rs
// ============================================================================
// Module: Curlew Ingest Library
// Description: Ingest queue, flush scheduler, filter pipeline, statistics.
// Purpose: Move readings from producers to storage with bounded latency,
//          back-pressure, and per-asset accounting.
// Dependencies: curlew-core, serde_json, thiserror, tracing
// ============================================================================

//! ## Overview
//! Producers hand readings to the [`Ingest`] scheduler, which batches them
//! by threshold and age, runs each batch through the configured
//! [`FilterPipeline`], and persists the survivors through the storage seam.
//! Failed batches back up on a resend queue with a poison-drop escape
//! hatch. A statistics worker mirrors throughput into the statistics table
//! and an asset tracker announces each asset to the management service on
//! first sight.
//! Invariants:
//! - Every accepted reading is eventually persisted or counted as
//!   discarded, exactly once.
//! - A reading is owned by exactly one queue at any time.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod pipeline;
pub mod scheduler;
pub mod stats;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use pipeline::Filter;
pub use pipeline::FilterFactory;
pub use pipeline::FilterPipeline;
pub use pipeline::FilterRegistry;
pub use pipeline::PipelineError;
pub use scheduler::Ingest;
pub use scheduler::IngestError;
pub use scheduler::IngestOptions;
pub use stats::StatsSnapshot;
