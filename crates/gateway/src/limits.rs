use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use gatehouse_core::{
    BandwidthQuota, ErrorCode, RateQuota, ThrottleQuota, TierLimits, bucket_index,
};
use gatehouse_state::{KeyKind, StateKey, StateStore};

use crate::error::{Denial, GatewayError};

/// A counter increment that may need to be undone when a later limiter
/// refuses the request.
#[derive(Debug, Clone)]
pub struct Charge {
    key: StateKey,
}

/// Outcome of one limiter check.
#[derive(Debug)]
pub enum LimitDecision {
    /// Admitted; the charge must be rolled back if a later limiter denies.
    Admitted {
        charge: Charge,
        /// Throttle queue delay the caller must sleep before proceeding.
        wait: Option<Duration>,
    },
    Denied(Denial),
}

/// Windowed counters for rate limiting, throttling, tier limits, and
/// bandwidth, all backed by atomic increments on the state store.
///
/// Buckets are epoch-aligned per window so concurrent gateway instances
/// sharing an external store agree on boundaries.
pub struct LimitEngine {
    store: Arc<dyn StateStore>,
}

impl LimitEngine {
    /// Create an engine over the given store.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn counter_key(kind: KeyKind, subject: &str, label: &str, window_seconds: u64) -> StateKey {
        let bucket = bucket_index(window_seconds, &Utc::now());
        StateKey::new(kind, format!("{subject}:{label}:{bucket}"))
    }

    /// Atomically increment a counter; if the result exceeds `limit`, undo
    /// the increment and report refusal.
    async fn increment_if_below(
        &self,
        key: &StateKey,
        limit: u64,
        window: Duration,
    ) -> Result<bool, GatewayError> {
        let value = self.store.increment(key, 1, Some(window)).await?;
        if value > i64::try_from(limit).unwrap_or(i64::MAX) {
            self.store.increment(key, -1, None).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Undo a previously admitted charge.
    pub async fn rollback(&self, charges: &[Charge]) -> Result<(), GatewayError> {
        for charge in charges {
            self.store.increment(&charge.key, -1, None).await?;
        }
        Ok(())
    }

    /// Fixed-window user rate limit.
    pub async fn check_rate(
        &self,
        subject: &str,
        quota: &RateQuota,
    ) -> Result<LimitDecision, GatewayError> {
        let window = quota.window.duration();
        let key = Self::counter_key(
            KeyKind::RateCounter,
            subject,
            quota.window.label(),
            quota.window.duration_seconds(),
        );

        if self.increment_if_below(&key, quota.count, window).await? {
            Ok(LimitDecision::Admitted {
                charge: Charge { key },
                wait: None,
            })
        } else {
            debug!(subject, "rate limit exceeded");
            Ok(LimitDecision::Denied(Denial::new(
                ErrorCode::RateLimited,
                "Rate limit exceeded",
            )))
        }
    }

    /// Burst throttle: requests beyond the per-window count queue up to
    /// `queue_limit`; queued requests are delayed proportionally to their
    /// queue position, never beyond the quota's maximum wait.
    pub async fn check_throttle(
        &self,
        subject: &str,
        quota: &ThrottleQuota,
    ) -> Result<LimitDecision, GatewayError> {
        let window = quota.window.duration();
        let key = Self::counter_key(
            KeyKind::ThrottleCounter,
            subject,
            quota.window.label(),
            quota.window.duration_seconds(),
        );

        let value = self.store.increment(&key, 1, Some(window)).await?;
        let position = value.saturating_sub(i64::try_from(quota.count).unwrap_or(i64::MAX));

        if position <= 0 {
            return Ok(LimitDecision::Admitted {
                charge: Charge { key },
                wait: None,
            });
        }

        if position > i64::try_from(quota.queue_limit).unwrap_or(i64::MAX) {
            self.store.increment(&key, -1, None).await?;
            debug!(subject, "throttle queue full");
            return Ok(LimitDecision::Denied(Denial::new(
                ErrorCode::RateLimited,
                "Throttle limit exceeded",
            )));
        }

        // Queue position determines the delay share; cumulative sleep per
        // request never exceeds max_wait.
        let max_wait = quota.max_wait();
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
        let wait = if quota.queue_limit == 0 || max_wait.is_zero() {
            None
        } else {
            Some(max_wait.mul_f64((position as f64 / quota.queue_limit as f64).min(1.0)))
        };

        Ok(LimitDecision::Admitted {
            charge: Charge { key },
            wait,
        })
    }

    /// Tier limits: enforce every configured window, strictest first.
    /// Charges accumulate across windows; on refusal the already-admitted
    /// tier windows are rolled back before returning.
    pub async fn check_tier(
        &self,
        user_id: &str,
        limits: &TierLimits,
    ) -> Result<(Vec<Charge>, Option<Denial>), GatewayError> {
        let mut charges = Vec::new();

        for (limit, window) in limits.windows() {
            let key = Self::counter_key(
                KeyKind::TierCounter,
                user_id,
                window.label(),
                window.duration_seconds(),
            );
            if self
                .increment_if_below(&key, limit, window.duration())
                .await?
            {
                charges.push(Charge { key });
            } else {
                self.rollback(&charges).await?;
                debug!(user_id, window = window.label(), "tier rate limit exceeded");
                return Ok((
                    Vec::new(),
                    Some(Denial::new(
                        ErrorCode::RateLimited,
                        "Tier rate limit exceeded",
                    )),
                ));
            }
        }

        Ok((charges, None))
    }

    /// Bandwidth pre-check: refuse when the current bucket plus the incoming
    /// body would exceed the byte limit. Does not consume anything.
    pub async fn check_bandwidth(
        &self,
        subject: &str,
        quota: &BandwidthQuota,
        content_length: u64,
    ) -> Result<Option<Denial>, GatewayError> {
        if !quota.enabled {
            return Ok(None);
        }

        let key = Self::counter_key(
            KeyKind::BandwidthCounter,
            subject,
            quota.window.label(),
            quota.window.duration_seconds(),
        );
        let used = self
            .store
            .get(&key)
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        if used.saturating_add(content_length) > quota.limit_bytes {
            debug!(subject, used, content_length, "bandwidth limit exceeded");
            return Ok(Some(Denial::new(
                ErrorCode::RateLimited,
                "Bandwidth limit exceeded",
            )));
        }
        Ok(None)
    }

    /// Post-response bandwidth accounting: add request and response bytes to
    /// the current bucket.
    pub async fn record_bandwidth(
        &self,
        subject: &str,
        quota: &BandwidthQuota,
        bytes: u64,
    ) -> Result<(), GatewayError> {
        if !quota.enabled || bytes == 0 {
            return Ok(());
        }

        let key = Self::counter_key(
            KeyKind::BandwidthCounter,
            subject,
            quota.window.label(),
            quota.window.duration_seconds(),
        );
        self.store
            .increment(
                &key,
                i64::try_from(bytes).unwrap_or(i64::MAX),
                Some(quota.window.duration()),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use gatehouse_core::RateWindow;
    use gatehouse_state_memory::MemoryStateStore;

    use super::*;

    fn engine() -> LimitEngine {
        LimitEngine::new(Arc::new(MemoryStateStore::new()))
    }

    #[tokio::test]
    async fn rate_limit_denies_past_count() {
        let engine = engine();
        let quota = RateQuota {
            count: 1,
            window: RateWindow::Hour,
        };

        assert!(matches!(
            engine.check_rate("alice", &quota).await.unwrap(),
            LimitDecision::Admitted { .. }
        ));
        assert!(matches!(
            engine.check_rate("alice", &quota).await.unwrap(),
            LimitDecision::Denied(d) if d.code == ErrorCode::RateLimited
        ));
        // Independent subject is unaffected.
        assert!(matches!(
            engine.check_rate("bob", &quota).await.unwrap(),
            LimitDecision::Admitted { .. }
        ));
    }

    #[tokio::test]
    async fn denied_rate_check_does_not_consume() {
        let engine = engine();
        let quota = RateQuota {
            count: 1,
            window: RateWindow::Hour,
        };

        let LimitDecision::Admitted { charge, .. } =
            engine.check_rate("alice", &quota).await.unwrap()
        else {
            panic!("first call should be admitted");
        };
        // Refusals must not grow the counter.
        for _ in 0..3 {
            assert!(matches!(
                engine.check_rate("alice", &quota).await.unwrap(),
                LimitDecision::Denied(_)
            ));
        }
        // After rollback the slot is free again.
        engine.rollback(&[charge]).await.unwrap();
        assert!(matches!(
            engine.check_rate("alice", &quota).await.unwrap(),
            LimitDecision::Admitted { .. }
        ));
    }

    #[tokio::test]
    async fn throttle_queues_then_denies() {
        let engine = engine();
        let quota = ThrottleQuota {
            count: 1,
            window: RateWindow::Hour,
            queue_limit: 1,
            wait: 0.0,
            wait_window: RateWindow::Second,
        };

        // First passes without queueing.
        let decision = engine.check_throttle("alice", &quota).await.unwrap();
        assert!(matches!(
            decision,
            LimitDecision::Admitted { wait: None, .. }
        ));
        // Second lands in the queue (zero wait configured).
        assert!(matches!(
            engine.check_throttle("alice", &quota).await.unwrap(),
            LimitDecision::Admitted { .. }
        ));
        // Third exceeds the queue.
        assert!(matches!(
            engine.check_throttle("alice", &quota).await.unwrap(),
            LimitDecision::Denied(_)
        ));
    }

    #[tokio::test]
    async fn throttle_wait_is_bounded() {
        let engine = engine();
        let quota = ThrottleQuota {
            count: 1,
            window: RateWindow::Hour,
            queue_limit: 2,
            wait: 1.0,
            wait_window: RateWindow::Second,
        };

        engine.check_throttle("alice", &quota).await.unwrap();
        let LimitDecision::Admitted {
            wait: Some(first), ..
        } = engine.check_throttle("alice", &quota).await.unwrap()
        else {
            panic!("queued request should carry a wait");
        };
        let LimitDecision::Admitted {
            wait: Some(second), ..
        } = engine.check_throttle("alice", &quota).await.unwrap()
        else {
            panic!("queued request should carry a wait");
        };

        assert!(first <= quota.max_wait());
        assert!(second <= quota.max_wait());
        assert!(first < second);
    }

    #[tokio::test]
    async fn tier_denial_rolls_back_earlier_windows() {
        let engine = engine();
        let limits = TierLimits {
            requests_per_hour: Some(10),
            requests_per_day: Some(1),
            ..TierLimits::default()
        };

        let (charges, denial) = engine.check_tier("alice", &limits).await.unwrap();
        assert!(denial.is_none());
        assert_eq!(charges.len(), 2);

        let (_, denial) = engine.check_tier("alice", &limits).await.unwrap();
        assert!(denial.is_some());

        // The hour window must have been rolled back by the day refusal:
        // freeing the day window admits the next request.
        engine.rollback(&charges).await.unwrap();
        let (charges, denial) = engine.check_tier("alice", &limits).await.unwrap();
        assert!(denial.is_none());
        assert_eq!(charges.len(), 2);
    }

    #[tokio::test]
    async fn bandwidth_precheck_and_accounting() {
        let engine = engine();
        let quota = BandwidthQuota {
            enabled: true,
            limit_bytes: 100,
            window: RateWindow::Hour,
        };

        assert!(
            engine
                .check_bandwidth("alice", &quota, 80)
                .await
                .unwrap()
                .is_none()
        );
        engine.record_bandwidth("alice", &quota, 80).await.unwrap();

        // 80 consumed + 30 incoming > 100.
        assert!(
            engine
                .check_bandwidth("alice", &quota, 30)
                .await
                .unwrap()
                .is_some()
        );
        // Exactly at the limit passes.
        assert!(
            engine
                .check_bandwidth("alice", &quota, 20)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn disabled_bandwidth_never_denies() {
        let engine = engine();
        let quota = BandwidthQuota {
            enabled: false,
            limit_bytes: 1,
            window: RateWindow::Second,
        };
        assert!(
            engine
                .check_bandwidth("alice", &quota, u64::MAX)
                .await
                .unwrap()
                .is_none()
        );
    }
}
