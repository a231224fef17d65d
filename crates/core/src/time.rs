use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{Result, TraceLiteError};

/// ClickHouse DateTime64(3) literal, e.g. `2026-02-01 00:00:00.120`.
pub fn format_ch_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// ClickHouse DateTime literal floored to the minute.
pub fn format_ch_minute(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:00").to_string()
}

/// Parses the formats the store hands back: DateTime64(3), DateTime, or
/// RFC3339 when a client echoes timestamps through.
pub fn parse_ch_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.3f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub fn parse_rfc3339(input: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(input)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TraceLiteError::Parse(format!("invalid timestamp {input:?}: {e}")))
}
