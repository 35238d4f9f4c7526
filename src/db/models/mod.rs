mod credential;
mod usage_event;

pub use credential::*;
pub use usage_event::*;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Canonical on-disk timestamp format: RFC 3339, millisecond precision, `Z` suffix.
/// Sorts lexicographically in time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp. Accepts RFC 3339 as well as the naive
/// `YYYY-MM-DD HH:MM:SS` / ISO forms older rows were written in (read as UTC).
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
