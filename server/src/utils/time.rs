//! Time utility functions

use chrono::{DateTime, TimeZone, Utc};

/// Convert nanoseconds since Unix epoch to DateTime<Utc>
pub fn nanos_to_datetime(nanos: u64) -> DateTime<Utc> {
    let secs = (nanos / 1_000_000_000) as i64;
    let nsecs = (nanos % 1_000_000_000) as u32;
    Utc.timestamp_opt(secs, nsecs).single().unwrap_or_else(|| {
        tracing::warn!(nanos, "Invalid timestamp, using epoch");
        DateTime::UNIX_EPOCH
    })
}

/// Parse ISO 8601 / RFC 3339 timestamp string to DateTime<Utc>
pub fn parse_iso_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
