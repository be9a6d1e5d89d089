// crates/curlew-core/src/reading.rs
// ============================================================================
// Module: Reading Model
// Description: Immutable reading record and the batch container.
// Purpose: Carry tagged sensor data points from producers through the filter
//          pipeline to the storage engine.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! A [`Reading`] is one tagged data point: an asset code, a device
//! timestamp, and a JSON-object payload. The server timestamp and the global
//! ID are assigned by the storage engine at persistence, so they do not
//! appear here. A [`ReadingSet`] owns a batch while it traverses the filter
//! pipeline; ownership transfers all the way through and the final output
//! repopulates the scheduler's batch.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::timestamp::TimestampError;
use crate::timestamp::UserTimestamp;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Invalid reading payload.
#[derive(Debug, Error, Clone)]
pub enum ReadingError {
    /// The `asset_code` field is missing or not a string.
    #[error("reading is missing an asset_code")]
    MissingAssetCode,
    /// The `user_ts` field is missing or unparseable.
    #[error("reading has an invalid user_ts: {0}")]
    InvalidTimestamp(#[from] TimestampError),
    /// The `reading` field is missing or not a JSON object.
    #[error("reading payload must be a JSON object")]
    PayloadNotObject,
}

// ============================================================================
// SECTION: Reading
// ============================================================================

/// Serde surface of the ingest JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawReading {
    /// Asset the data point belongs to.
    asset_code: String,
    /// Device timestamp, ISO-like or `now()`.
    user_ts: String,
    /// JSON-object payload.
    reading: Value,
}

/// One tagged data point from a sensor.
///
/// # Invariants
/// - `payload` is a JSON object.
/// - The record is immutable after construction; filters produce new
///   readings rather than mutating persisted ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawReading", into = "RawReading")]
pub struct Reading {
    /// Asset the data point belongs to.
    pub asset_code: String,
    /// Device timestamp.
    pub user_ts: UserTimestamp,
    /// JSON-object payload.
    pub payload: Value,
}

impl Reading {
    /// Builds a reading, validating that the payload is a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`ReadingError::PayloadNotObject`] for non-object payloads.
    pub fn new(
        asset_code: impl Into<String>,
        user_ts: UserTimestamp,
        payload: Value,
    ) -> Result<Self, ReadingError> {
        if !payload.is_object() {
            return Err(ReadingError::PayloadNotObject);
        }
        Ok(Self {
            asset_code: asset_code.into(),
            user_ts,
            payload,
        })
    }

    /// Builds a reading from one element of the ingest `readings` array.
    ///
    /// # Errors
    ///
    /// Returns [`ReadingError`] when a field is missing or malformed; the
    /// caller skips the reading and counts it as discarded.
    pub fn from_json(value: &Value) -> Result<Self, ReadingError> {
        let object = value.as_object().ok_or(ReadingError::PayloadNotObject)?;
        let asset_code = object
            .get("asset_code")
            .and_then(Value::as_str)
            .ok_or(ReadingError::MissingAssetCode)?;
        let user_ts = object
            .get("user_ts")
            .and_then(Value::as_str)
            .ok_or(TimestampError::InvalidDate(String::new()))
            .and_then(UserTimestamp::parse)?;
        let payload = object.get("reading").cloned().ok_or(ReadingError::PayloadNotObject)?;
        Self::new(asset_code, user_ts, payload)
    }
}

impl TryFrom<RawReading> for Reading {
    type Error = ReadingError;

    fn try_from(raw: RawReading) -> Result<Self, Self::Error> {
        let user_ts = UserTimestamp::parse(&raw.user_ts)?;
        Self::new(raw.asset_code, user_ts, raw.reading)
    }
}

impl From<Reading> for RawReading {
    fn from(reading: Reading) -> Self {
        Self {
            asset_code: reading.asset_code,
            user_ts: String::from(reading.user_ts),
            reading: reading.payload,
        }
    }
}

// ============================================================================
// SECTION: Reading Set
// ============================================================================

/// Owned batch of readings handed through the filter pipeline.
#[derive(Debug, Default)]
pub struct ReadingSet {
    /// Batch contents, in ingest order.
    readings: Vec<Reading>,
}

impl ReadingSet {
    /// Wraps a batch for pipeline traversal.
    #[must_use]
    pub fn new(readings: Vec<Reading>) -> Self {
        Self {
            readings,
        }
    }

    /// Number of readings in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// True when the set holds no readings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Read-only view of the batch.
    #[must_use]
    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    /// Appends a reading, preserving ingest order.
    pub fn push(&mut self, reading: Reading) {
        self.readings.push(reading);
    }

    /// Consumes the set, returning the batch.
    #[must_use]
    pub fn into_readings(self) -> Vec<Reading> {
        self.readings
    }
}

impl FromIterator<Reading> for ReadingSet {
    fn from_iter<I: IntoIterator<Item = Reading>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
