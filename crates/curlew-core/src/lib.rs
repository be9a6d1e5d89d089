// crates/curlew-core/src/lib.rs
// ============================================================================
// Module: Curlew Core Library
// Description: Reading model, timestamps, query model, and seam traits.
// Purpose: Shared vocabulary between the ingest scheduler, the storage
//          engine, and the management client.
// Dependencies: serde, serde_json, thiserror, time
// ============================================================================

//! ## Overview
//! Curlew Core carries the types every other crate agrees on: the immutable
//! [`Reading`] record and the [`ReadingSet`] batch container, the accepted
//! `user_ts` timestamp forms, the serde model of the retrieve JSON query
//! schema, the packed binary reading-stream format, and the traits that
//! decouple the ingest workers from the storage engine and the management
//! service.
//! Invariants:
//! - A `Reading` payload is always a JSON object.
//! - Timestamps are canonicalized to UTC before persistence.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod interfaces;
pub mod query;
pub mod reading;
pub mod stream;
pub mod timestamp;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use interfaces::AppendOutcome;
pub use interfaces::AssetTrackerApi;
pub use interfaces::AssetTrackingTuple;
pub use interfaces::ManagementError;
pub use interfaces::ReadingsAppender;
pub use interfaces::StatisticsSink;
pub use interfaces::StorageError;
pub use query::Aggregate;
pub use query::AggregateSpec;
pub use query::JsonSelector;
pub use query::RetrieveQuery;
pub use query::ReturnColumn;
pub use query::ReturnSpec;
pub use query::Timebucket;
pub use query::WhereClause;
pub use reading::Reading;
pub use reading::ReadingError;
pub use reading::ReadingSet;
pub use stream::StreamDecodeError;
pub use stream::StreamDecoder;
pub use timestamp::TimestampError;
pub use timestamp::UserTimestamp;
pub use timestamp::format_sqlite;
