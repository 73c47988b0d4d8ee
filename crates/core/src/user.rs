use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::window::RateWindow;

/// Fixed-window request quota.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateQuota {
    /// Maximum requests admitted per window.
    pub count: u64,
    /// Window the counter is bucketed by.
    pub window: RateWindow,
}

/// Burst-smoothing quota layered on top of the rate limit.
///
/// Requests beyond `count` per window land in a queue of at most
/// `queue_limit`; queued requests sleep before proceeding, bounded by
/// `wait * wait_window`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThrottleQuota {
    /// Requests per window that pass without queuing.
    pub count: u64,
    /// Window the burst counter is bucketed by.
    pub window: RateWindow,
    /// Maximum queued requests per window beyond `count`.
    pub queue_limit: u64,
    /// Wait multiplier; the maximum sleep is `wait * wait_window`.
    pub wait: f64,
    /// Unit for the wait multiplier.
    pub wait_window: RateWindow,
}

impl ThrottleQuota {
    /// Maximum cumulative sleep a queued request may incur.
    #[must_use]
    pub fn max_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(
            (self.wait * self.wait_window.duration().as_secs_f64()).max(0.0),
        )
    }
}

/// Byte-volume quota bucketed by window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BandwidthQuota {
    /// Whether bandwidth accounting applies to this user.
    pub enabled: bool,
    /// Maximum bytes (request plus response) per window.
    pub limit_bytes: u64,
    /// Window the byte counter is bucketed by.
    pub window: RateWindow,
}

/// Maximum entries allowed in [`User::custom_attributes`].
pub const MAX_CUSTOM_ATTRIBUTES: usize = 10;

/// A registered caller. Identity: `username` and `email` are unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub email: String,
    /// Role name resolved against the role registry.
    pub role: String,
    /// Groups the user belongs to, intersected with API group allowlists.
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Per-user request quota. `None` means unlimited.
    #[serde(default)]
    pub rate_limit: Option<RateQuota>,
    /// Per-user burst quota. `None` disables throttling.
    #[serde(default)]
    pub throttle: Option<ThrottleQuota>,
    /// Per-user byte quota. `None` disables bandwidth accounting.
    #[serde(default)]
    pub bandwidth: Option<BandwidthQuota>,
    /// Free-form attributes, capped at [`MAX_CUSTOM_ATTRIBUTES`].
    #[serde(default)]
    pub custom_attributes: HashMap<String, String>,
}

impl User {
    /// Validate structural invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.username.is_empty() {
            return Err("username must not be empty".into());
        }
        if self.custom_attributes.len() > MAX_CUSTOM_ATTRIBUTES {
            return Err(format!(
                "custom_attributes exceeds the {MAX_CUSTOM_ATTRIBUTES}-entry limit"
            ));
        }
        Ok(())
    }
}
