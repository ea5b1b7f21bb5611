//! Wall-clock helpers.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current time as RFC 3339 with millisecond precision and a `Z` suffix.
#[must_use]
pub fn now_rfc3339() -> String {
    format_rfc3339(Utc::now())
}

/// Format a UTC timestamp the way every persisted record stores it.
#[must_use]
pub fn format_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Current time in whole seconds since the Unix epoch.
#[must_use]
pub fn unix_secs() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}
