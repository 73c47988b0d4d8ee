use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::window::RateWindow;

/// Request limits carried by a tier. Each limit is optional; the gateway
/// enforces the strictest finite window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TierLimits {
    #[serde(default)]
    pub requests_per_second: Option<u64>,
    #[serde(default)]
    pub requests_per_minute: Option<u64>,
    #[serde(default)]
    pub requests_per_hour: Option<u64>,
    #[serde(default)]
    pub requests_per_day: Option<u64>,
    /// Whether the tier also applies throttling behavior.
    #[serde(default)]
    pub throttling: bool,
    /// Maximum queueing delay when throttling, in milliseconds.
    #[serde(default)]
    pub max_queue_ms: u64,
}

impl TierLimits {
    /// Return `(limit, window)` pairs for every configured limit, strictest
    /// (shortest) window first.
    #[must_use]
    pub fn windows(&self) -> Vec<(u64, RateWindow)> {
        [
            (self.requests_per_second, RateWindow::Second),
            (self.requests_per_minute, RateWindow::Minute),
            (self.requests_per_hour, RateWindow::Hour),
            (self.requests_per_day, RateWindow::Day),
        ]
        .into_iter()
        .filter_map(|(limit, window)| limit.map(|l| (l, window)))
        .collect()
    }
}

/// A named bundle of rate limits assignable to users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier {
    pub tier_id: String,
    pub name: String,
    #[serde(default)]
    pub limits: TierLimits,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_default: bool,
}

fn default_true() -> bool {
    true
}

/// Binding of a user to a tier, optionally time-boxed. At most one per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTierAssignment {
    pub user_id: String,
    pub tier_id: String,
    #[serde(default)]
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub effective_until: Option<DateTime<Utc>>,
    /// Per-user overrides applied on top of the tier's limits.
    #[serde(default)]
    pub override_limits: Option<TierLimits>,
}

impl UserTierAssignment {
    /// Whether the assignment is in effect at `now`.
    #[must_use]
    pub fn is_effective(&self, now: &DateTime<Utc>) -> bool {
        if let Some(from) = &self.effective_from
            && now < from
        {
            return false;
        }
        if let Some(until) = &self.effective_until
            && now > until
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        chrono::DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn windows_returns_configured_limits_shortest_first() {
        let limits = TierLimits {
            requests_per_minute: Some(100),
            requests_per_day: Some(5_000),
            ..TierLimits::default()
        };
        let windows = limits.windows();
        assert_eq!(
            windows,
            vec![(100, RateWindow::Minute), (5_000, RateWindow::Day)]
        );
    }

    #[test]
    fn assignment_effectivity_bounds() {
        let assignment = UserTierAssignment {
            user_id: "u1".into(),
            tier_id: "t1".into(),
            effective_from: Some(at("2026-01-01T00:00:00Z")),
            effective_until: Some(at("2026-02-01T00:00:00Z")),
            override_limits: None,
        };
        assert!(!assignment.is_effective(&at("2025-12-31T23:59:59Z")));
        assert!(assignment.is_effective(&at("2026-01-15T12:00:00Z")));
        assert!(!assignment.is_effective(&at("2026-02-01T00:00:01Z")));
    }

    #[test]
    fn open_ended_assignment_is_always_effective() {
        let assignment = UserTierAssignment {
            user_id: "u1".into(),
            tier_id: "t1".into(),
            effective_from: None,
            effective_until: None,
            override_limits: None,
        };
        assert!(assignment.is_effective(&Utc::now()));
    }
}
