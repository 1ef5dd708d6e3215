//! Shared timestamp and id helpers.

use chrono::{DateTime, Utc};
use ulid::Ulid;

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    format!("{}Z", Utc::now().timestamp())
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Compact UTC stamp used in derived dataset ids (`20240131235959`).
pub fn dataset_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

/// Parse a timestamp as found in log records: RFC 3339, or unix epoch
/// seconds / milliseconds (numeric or numeric text).
pub fn parse_log_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let n = raw.parse::<f64>().ok()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    // Anything past year ~2286 in seconds is assumed to be milliseconds.
    let millis = if n >= 1e10 { n } else { n * 1000.0 };
    DateTime::from_timestamp_millis(millis as i64)
}
