use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed time window over which a counter is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateWindow {
    Second,
    Minute,
    Hour,
    Day,
}

impl RateWindow {
    /// Return the window duration in seconds.
    #[must_use]
    pub fn duration_seconds(&self) -> u64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    /// Return the window duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds())
    }

    /// Return a short label for counter key generation.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Parse a window label. Labels are lowercased and a trailing `s` is
    /// trimmed before matching, so `"seconds"`, `"second"`, and `"sec"` are
    /// equivalent.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        let lower = label.trim().to_ascii_lowercase();
        let trimmed = lower.strip_suffix('s').unwrap_or(&lower);
        match trimmed {
            "sec" | "second" => Some(Self::Second),
            "min" | "minute" => Some(Self::Minute),
            "hour" | "hr" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }
}

impl std::fmt::Display for RateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Compute the index of the bucket containing `now` for a window of
/// `window_seconds`. Buckets are epoch-aligned so all gateway instances
/// agree on boundaries and never overlap.
///
/// # Panics
///
/// Panics if `window_seconds` is zero.
#[must_use]
pub fn bucket_index(window_seconds: u64, now: &DateTime<Utc>) -> i64 {
    assert!(window_seconds > 0, "window duration must be greater than 0");
    let elapsed = now.signed_duration_since(DateTime::UNIX_EPOCH);
    elapsed.num_seconds().div_euclid(window_seconds.cast_signed())
}

/// Compute the start of the bucket containing `now`.
///
/// # Panics
///
/// Panics if `window_seconds` is zero.
#[must_use]
pub fn bucket_start(window_seconds: u64, now: &DateTime<Utc>) -> DateTime<Utc> {
    let index = bucket_index(window_seconds, now);
    DateTime::UNIX_EPOCH + chrono::Duration::seconds(index * window_seconds.cast_signed())
}
