//! Time parsing for the TIME request dimension.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a TIME request: an instant or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeSelection {
    Instant(DateTime<Utc>),
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl TimeSelection {
    /// Parse a TIME parameter value.
    ///
    /// Supports:
    /// - Single time: "2024-01-15T12:00:00Z"
    /// - Time range: "2024-01-15T00:00:00Z/2024-01-16T00:00:00Z"
    /// - Time list: "2024-01-15T00:00:00Z,2024-01-15T06:00:00Z"
    pub fn parse_list(s: &str) -> Result<Vec<TimeSelection>, TimeParseError> {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Self::parse_one)
            .collect()
    }

    fn parse_one(s: &str) -> Result<TimeSelection, TimeParseError> {
        if let Some((start, end)) = s.split_once('/') {
            let start = parse_iso8601(start)?;
            let end = parse_iso8601(end)?;
            if end < start {
                return Err(TimeParseError::InvertedRange(s.to_string()));
            }
            return Ok(TimeSelection::Range { start, end });
        }
        Ok(TimeSelection::Instant(parse_iso8601(s)?))
    }

    pub fn contains(&self, dt: &DateTime<Utc>) -> bool {
        match self {
            TimeSelection::Instant(t) => t == dt,
            TimeSelection::Range { start, end } => dt >= start && dt <= end,
        }
    }
}

/// Parse an ISO 8601 timestamp, assuming UTC when no offset is given.
pub fn parse_iso8601(s: &str) -> Result<DateTime<Utc>, TimeParseError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }

    // Date only
    if let Ok(ndt) = NaiveDateTime::parse_from_str(&format!("{}T00:00:00", s), "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }

    Err(TimeParseError::InvalidFormat(s.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum TimeParseError {
    #[error("Invalid time format: {0}")]
    InvalidFormat(String),

    #[error("Time range ends before it starts: {0}")]
    InvertedRange(String),
}
