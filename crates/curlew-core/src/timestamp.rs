// crates/curlew-core/src/timestamp.rs
// ============================================================================
// Module: Reading Timestamps
// Description: Accepted `user_ts` forms and SQLite datetime rendering.
// Purpose: Canonicalize device timestamps to UTC with microsecond precision.
// Dependencies: serde, thiserror, time
// ============================================================================

//! ## Overview
//! Devices report `user_ts` either as the literal string `now()` or as an
//! ISO-like datetime `YYYY-MM-DD HH:MM:SS[.ffffff][±HH:MM]`. The `now()`
//! form is substituted with the current UTC time at persistence. All stored
//! values are rendered as `YYYY-MM-DD HH:MM:SS.ffffff` in UTC so that
//! `substr(user_ts, instr(user_ts, '.'), 7)` always yields the six-digit
//! fraction the retrieval SQL re-attaches after `strftime`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

// ============================================================================
// SECTION: Formats
// ============================================================================

/// Literal `user_ts` value substituted with the current time at persistence.
pub const NOW_LITERAL: &str = "now()";

/// `YYYY-MM-DD HH:MM:SS.ffffff±HH:MM`.
const FMT_FRAC_OFFSET: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond][offset_hour \
     sign:mandatory]:[offset_minute]"
);
/// `YYYY-MM-DD HH:MM:SS±HH:MM`.
const FMT_OFFSET: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]"
);
/// `YYYY-MM-DD HH:MM:SS.ffffff`, assumed UTC.
const FMT_FRAC: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");
/// `YYYY-MM-DD HH:MM:SS`, assumed UTC.
const FMT_BARE: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
/// Canonical storage rendering: UTC, six-digit microsecond fraction.
const FMT_SQLITE: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]");

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Timestamp parse failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimestampError {
    /// The value matched none of the accepted datetime forms.
    #[error("invalid date |{0}|")]
    InvalidDate(String),
}

// ============================================================================
// SECTION: User Timestamp
// ============================================================================

/// A device-supplied reading timestamp.
///
/// # Invariants
/// - `At` values are canonicalized to UTC on construction.
/// - `Now` is resolved against the wall clock only at persistence time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UserTimestamp {
    /// The literal `now()` marker.
    Now,
    /// An explicit instant.
    At(OffsetDateTime),
}

impl UserTimestamp {
    /// Parses one of the accepted `user_ts` forms.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError::InvalidDate`] when the value is neither
    /// `now()` nor a recognized datetime.
    pub fn parse(raw: &str) -> Result<Self, TimestampError> {
        let trimmed = raw.trim();
        if trimmed == NOW_LITERAL {
            return Ok(Self::Now);
        }
        if let Ok(parsed) = OffsetDateTime::parse(trimmed, FMT_FRAC_OFFSET) {
            return Ok(Self::At(parsed.to_offset(time::UtcOffset::UTC)));
        }
        if let Ok(parsed) = OffsetDateTime::parse(trimmed, FMT_OFFSET) {
            return Ok(Self::At(parsed.to_offset(time::UtcOffset::UTC)));
        }
        if let Ok(parsed) = PrimitiveDateTime::parse(trimmed, FMT_FRAC) {
            return Ok(Self::At(parsed.assume_utc()));
        }
        if let Ok(parsed) = PrimitiveDateTime::parse(trimmed, FMT_BARE) {
            return Ok(Self::At(parsed.assume_utc()));
        }
        Err(TimestampError::InvalidDate(raw.to_string()))
    }

    /// Resolves the timestamp to a concrete UTC instant.
    #[must_use]
    pub fn resolve(&self) -> OffsetDateTime {
        match self {
            Self::Now => OffsetDateTime::now_utc(),
            Self::At(instant) => *instant,
        }
    }

    /// Renders the resolved instant in the canonical storage form.
    #[must_use]
    pub fn to_sqlite(&self) -> String {
        format_sqlite(self.resolve())
    }

    /// Age of the timestamp in milliseconds, zero for `now()` and for
    /// timestamps in the future.
    #[must_use]
    pub fn age_millis(&self) -> u64 {
        match self {
            Self::Now => 0,
            Self::At(instant) => {
                let elapsed = OffsetDateTime::now_utc() - *instant;
                u64::try_from(elapsed.whole_milliseconds()).unwrap_or(0)
            }
        }
    }
}

impl TryFrom<String> for UserTimestamp {
    type Error = TimestampError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<UserTimestamp> for String {
    fn from(value: UserTimestamp) -> Self {
        match value {
            UserTimestamp::Now => NOW_LITERAL.to_string(),
            UserTimestamp::At(instant) => format_sqlite(instant),
        }
    }
}

/// Renders an instant as `YYYY-MM-DD HH:MM:SS.ffffff` in UTC.
#[must_use]
pub fn format_sqlite(instant: OffsetDateTime) -> String {
    let utc = instant.to_offset(time::UtcOffset::UTC);
    // The format items cover every field, so formatting cannot fail.
    utc.format(FMT_SQLITE).unwrap_or_else(|_| String::new())
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use super::*;

    #[test]
    fn parses_now_literal() {
        assert_eq!(UserTimestamp::parse("now()").unwrap(), UserTimestamp::Now);
    }

    #[test]
    fn parses_bare_datetime_as_utc() {
        let ts = UserTimestamp::parse("2024-01-01 00:00:00").unwrap();
        assert_eq!(ts.to_sqlite(), "2024-01-01 00:00:00.000000");
    }

    #[test]
    fn parses_microsecond_fraction() {
        let ts = UserTimestamp::parse("2024-01-01 12:30:45.123456").unwrap();
        assert_eq!(ts.to_sqlite(), "2024-01-01 12:30:45.123456");
    }

    #[test]
    fn normalizes_offset_to_utc() {
        let ts = UserTimestamp::parse("2019-01-11 15:45:01.123456+01:00").unwrap();
        assert_eq!(ts.to_sqlite(), "2019-01-11 14:45:01.123456");
    }

    #[test]
    fn parses_offset_without_fraction() {
        let ts = UserTimestamp::parse("2019-01-11 15:45:01-02:30").unwrap();
        assert_eq!(ts.to_sqlite(), "2019-01-11 18:15:01.000000");
    }

    #[test]
    fn rejects_malformed_dates() {
        assert!(UserTimestamp::parse("yesterday").is_err());
        assert!(UserTimestamp::parse("2024-13-01 00:00:00").is_err());
        assert!(UserTimestamp::parse("").is_err());
    }

    #[test]
    fn serde_round_trip() {
        let ts: UserTimestamp = serde_json::from_str("\"2024-01-01 00:00:00.000001\"").unwrap();
        let rendered = serde_json::to_string(&ts).unwrap();
        assert_eq!(rendered, "\"2024-01-01 00:00:00.000001\"");
        let now: UserTimestamp = serde_json::from_str("\"now()\"").unwrap();
        assert_eq!(now, UserTimestamp::Now);
    }
}
