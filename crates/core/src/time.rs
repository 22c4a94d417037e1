//! Elapsed-time helpers over RFC 3339 timestamps.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Absolute difference in whole seconds, rounded.
pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    let ms = (end - start).num_milliseconds().unsigned_abs();
    (ms + 500) / 1000
}

pub fn seconds_diff(start: &str, end: &str) -> Option<u64> {
    Some(seconds_between(parse_rfc3339(start)?, parse_rfc3339(end)?))
}

/// ISO-8601 UTC with second precision, e.g. `2024-05-01T10:00:00Z`.
pub fn now_rfc3339() -> String { Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true) }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elapsed {
    /// Suggested refresh interval in seconds for a live display.
    pub diff: u64,
    pub label: String,
}

/// Compact label for a duration: `45s`, `3m20s`, `95m`, `5h10m`, `9h`, `2d4h`.
/// Zero yields `None`.
pub fn elapsed_time(seconds: u64) -> Option<Elapsed> {
    if seconds == 0 {
        return None;
    }
    if seconds < 120 {
        return Some(Elapsed { diff: 1, label: format!("{seconds}s") });
    }
    let minutes = seconds / 60;
    if minutes < 10 {
        return Some(Elapsed { diff: 1, label: format!("{}m{}s", minutes, seconds - minutes * 60) });
    }
    let hours = seconds / 3600;
    if hours < 3 {
        return Some(Elapsed { diff: 60, label: format!("{minutes}m") });
    }
    let days = seconds / 86_400;
    let label = if days > 1 {
        format!("{}d{}h", days, hours - days * 24)
    } else if hours > 7 {
        format!("{hours}h")
    } else {
        format!("{}h{}m", hours, minutes - hours * 60)
    };
    Some(Elapsed { diff: 60, label })
}
