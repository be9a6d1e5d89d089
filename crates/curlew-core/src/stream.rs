// crates/curlew-core/src/stream.rs
// ============================================================================
// Module: Reading Stream Wire Format
// Description: Packed binary framing for bulk reading ingest.
// Purpose: Decode high-rate south-side streams without JSON envelope cost.
// Dependencies: serde_json, thiserror
// ============================================================================

//! ## Overview
//! A reading stream is a byte sequence of frames, each carrying one reading:
//!
//! ```text
//! u64 LE  user_ts seconds (unix epoch, UTC)
//! u32 LE  user_ts microseconds
//! u16 LE  asset code length in bytes
//! u32 LE  payload length in bytes
//! [u8]    asset code (UTF-8)
//! [u8]    payload (JSON object)
//! ```
//!
//! Decoding is strict: a truncated frame, a non-UTF-8 asset code, or a
//! non-object payload fails that frame. The storage engine skips failed
//! frames and counts them, matching the discard semantics of the JSON path.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::reading::Reading;
use crate::reading::ReadingError;
use crate::timestamp::UserTimestamp;

/// Fixed frame header length in bytes.
const HEADER_LEN: usize = 8 + 4 + 2 + 4;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Reading-stream decode failure.
#[derive(Debug, Error, Clone)]
pub enum StreamDecodeError {
    /// The buffer ended inside a frame.
    #[error("reading stream truncated at offset {0}")]
    Truncated(usize),
    /// The asset code was not valid UTF-8.
    #[error("reading stream asset code is not utf-8 at offset {0}")]
    AssetCode(usize),
    /// The frame timestamp was out of range.
    #[error("reading stream timestamp out of range at offset {0}")]
    Timestamp(usize),
    /// The payload was not a JSON object.
    #[error("reading stream payload rejected at offset {0}: {1}")]
    Payload(usize, String),
}

// ============================================================================
// SECTION: Decoder
// ============================================================================

/// Iterator over the frames of a packed reading stream.
pub struct StreamDecoder<'buf> {
    /// Remaining undecoded bytes.
    buffer: &'buf [u8],
    /// Offset of the next frame, for diagnostics.
    offset: usize,
}

impl<'buf> StreamDecoder<'buf> {
    /// Wraps a buffer for frame-by-frame decoding.
    #[must_use]
    pub fn new(buffer: &'buf [u8]) -> Self {
        Self {
            buffer,
            offset: 0,
        }
    }

    /// Decodes the next frame.
    fn decode_frame(&mut self) -> Result<Reading, StreamDecodeError> {
        let start = self.offset;
        let buffer = self.buffer;
        if buffer.len() < HEADER_LEN {
            return Err(StreamDecodeError::Truncated(start));
        }
        let seconds = u64::from_le_bytes(
            buffer[0 .. 8].try_into().map_err(|_| StreamDecodeError::Truncated(start))?,
        );
        let micros = u32::from_le_bytes(
            buffer[8 .. 12].try_into().map_err(|_| StreamDecodeError::Truncated(start))?,
        );
        let asset_len = u16::from_le_bytes(
            buffer[12 .. 14].try_into().map_err(|_| StreamDecodeError::Truncated(start))?,
        ) as usize;
        let payload_len = u32::from_le_bytes(
            buffer[14 .. HEADER_LEN]
                .try_into()
                .map_err(|_| StreamDecodeError::Truncated(start))?,
        ) as usize;
        let frame_len = HEADER_LEN + asset_len + payload_len;
        if buffer.len() < frame_len {
            return Err(StreamDecodeError::Truncated(start));
        }
        let asset_bytes = &buffer[HEADER_LEN .. HEADER_LEN + asset_len];
        let payload_bytes = &buffer[HEADER_LEN + asset_len .. frame_len];
        self.buffer = &buffer[frame_len ..];
        self.offset += frame_len;

        let asset_code = std::str::from_utf8(asset_bytes)
            .map_err(|_| StreamDecodeError::AssetCode(start))?
            .to_string();
        let nanos = i128::from(seconds) * 1_000_000_000 + i128::from(micros) * 1_000;
        let instant = OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map_err(|_| StreamDecodeError::Timestamp(start))?;
        let payload: Value = serde_json::from_slice(payload_bytes)
            .map_err(|err| StreamDecodeError::Payload(start, err.to_string()))?;
        Reading::new(asset_code, UserTimestamp::At(instant), payload).map_err(
            |err: ReadingError| StreamDecodeError::Payload(start, err.to_string()),
        )
    }
}

impl Iterator for StreamDecoder<'_> {
    type Item = Result<Reading, StreamDecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            return None;
        }
        let frame = self.decode_frame();
        if frame.is_err() {
            // A failed frame desynchronizes the stream; stop after reporting.
            self.buffer = &[];
        }
        Some(frame)
    }
}

/// Encodes one reading as a stream frame (used by producers and tests).
#[must_use]
pub fn encode_frame(reading: &Reading) -> Vec<u8> {
    let instant = reading.user_ts.resolve();
    let seconds = u64::try_from(instant.unix_timestamp()).unwrap_or(0);
    let micros = instant.microsecond();
    let asset = reading.asset_code.as_bytes();
    let payload = reading.payload.to_string().into_bytes();
    let mut frame = Vec::with_capacity(HEADER_LEN + asset.len() + payload.len());
    frame.extend_from_slice(&seconds.to_le_bytes());
    frame.extend_from_slice(&micros.to_le_bytes());
    frame.extend_from_slice(&u16::try_from(asset.len()).unwrap_or(u16::MAX).to_le_bytes());
    frame.extend_from_slice(&u32::try_from(payload.len()).unwrap_or(u32::MAX).to_le_bytes());
    frame.extend_from_slice(asset);
    frame.extend_from_slice(&payload);
    frame
}

// ============================================================================
// SECTION: Tests
// ============================================================================
