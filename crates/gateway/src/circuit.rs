use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gatehouse_state::{DistributedLock, KeyKind, StateKey, StateStore};

/// Maximum time (ms) a probe can be in flight before it is considered stale.
/// If a probe request crashes without calling `record_success` or
/// `record_failure`, the probe slot is freed after this interval.
const PROBE_TIMEOUT_MS: i64 = 30_000;

/// TTL for the short-lived mutation lock.
const MUTATION_LOCK_TTL: Duration = Duration::from_secs(5);

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls flow through.
    Closed,
    /// Upstream is failing, calls are rejected immediately.
    Open,
    /// Recovery probe: a single request is allowed to test upstream health.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration shared by all per-API circuit breakers.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long to stay open before admitting a probe.
    pub open_duration: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_millis(30_000),
        }
    }
}

/// Mutable state for a single circuit, stored as JSON in the [`StateStore`]
/// so multiple gateway instances share the same view of upstream health.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CircuitData {
    state: CircuitState,
    consecutive_failures: u32,
    /// Wall-clock time of last failure (ms since Unix epoch).
    #[serde(default)]
    last_failure_time_ms: Option<i64>,
    /// When the current half-open probe started (ms since Unix epoch).
    /// Only one probe is admitted at a time; stale probes expire after
    /// [`PROBE_TIMEOUT_MS`].
    #[serde(default)]
    probe_started_at_ms: Option<i64>,
}

impl Default for CircuitData {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time_ms: None,
            probe_started_at_ms: None,
        }
    }
}

/// Circuit breaker for a single API key.
///
/// Transitions: `Closed` -> `Open` when consecutive failures reach the
/// threshold; `Open` -> `HalfOpen` after `open_duration`; `HalfOpen` ->
/// `Closed` on the first probe success, `HalfOpen` -> `Open` on probe
/// failure. A [`DistributedLock`] serialises mutations per key.
pub struct CircuitBreaker {
    api_key: String,
    config: CircuitConfig,
    store: Arc<dyn StateStore>,
    lock: Arc<dyn DistributedLock>,
}

impl CircuitBreaker {
    fn new(
        api_key: impl Into<String>,
        config: CircuitConfig,
        store: Arc<dyn StateStore>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            config,
            store,
            lock,
        }
    }

    fn state_key(&self) -> StateKey {
        StateKey::new(KeyKind::Circuit, &self.api_key)
    }

    fn lock_name(&self) -> String {
        format!("cb:{}", self.api_key)
    }

    /// Idle circuit records expire well after the open interval has passed.
    fn state_ttl(&self) -> Duration {
        self.config.open_duration * 10
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Load state from the store. Missing keys and read errors yield the
    /// default (closed) state so the breaker fails open.
    async fn load_state(&self) -> CircuitData {
        match self.store.get(&self.state_key()).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
            Ok(None) => CircuitData::default(),
            Err(e) => {
                warn!(api_key = %self.api_key, error = %e, "failed to load circuit state");
                CircuitData::default()
            }
        }
    }

    /// Persist state. Errors are logged but not propagated (fail-open).
    async fn save_state(&self, data: &CircuitData) {
        let json = match serde_json::to_string(data) {
            Ok(j) => j,
            Err(e) => {
                warn!(api_key = %self.api_key, error = %e, "failed to serialize circuit state");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set(&self.state_key(), &json, Some(self.state_ttl()))
            .await
        {
            warn!(api_key = %self.api_key, error = %e, "failed to save circuit state");
        }
    }

    async fn acquire_mutation_lock(&self) -> Option<Box<dyn gatehouse_state::LockGuard>> {
        match self.lock.try_acquire(&self.lock_name(), MUTATION_LOCK_TTL).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(api_key = %self.api_key, error = %e, "failed to acquire circuit lock");
                None
            }
        }
    }

    fn is_probe_active(data: &CircuitData) -> bool {
        data.probe_started_at_ms
            .is_some_and(|t| (Self::now_ms() - t) < PROBE_TIMEOUT_MS)
    }

    /// Acquire permission to call the upstream.
    ///
    /// May transition `Open` -> `HalfOpen` when the open interval has
    /// elapsed; in half-open only one probe is admitted at a time. A caller
    /// granted `HalfOpen` must follow up with [`record_success`] or
    /// [`record_failure`] to release the probe slot.
    ///
    /// [`record_success`]: Self::record_success
    /// [`record_failure`]: Self::record_failure
    pub async fn try_acquire_permit(&self) -> CircuitState {
        let Some(guard) = self.acquire_mutation_lock().await else {
            // No lock: read-only view. Treat HalfOpen as Open to avoid
            // concurrent probes.
            let data = self.load_state().await;
            if data.state == CircuitState::HalfOpen {
                return CircuitState::Open;
            }
            return data.state;
        };

        let mut data = self.load_state().await;
        let result = match data.state {
            CircuitState::Open => {
                let now = Self::now_ms();
                let elapsed_ms = data
                    .last_failure_time_ms
                    .map_or(i64::MAX, |t| (now - t).max(0));
                #[allow(clippy::cast_possible_truncation)]
                let open_ms = self.config.open_duration.as_millis() as i64;

                if elapsed_ms >= open_ms {
                    debug!(api_key = %self.api_key, "circuit transitioning open -> half-open");
                    data.state = CircuitState::HalfOpen;
                    data.probe_started_at_ms = Some(now);
                    self.save_state(&data).await;
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            CircuitState::HalfOpen => {
                if Self::is_probe_active(&data) {
                    CircuitState::Open
                } else {
                    data.probe_started_at_ms = Some(Self::now_ms());
                    self.save_state(&data).await;
                    CircuitState::HalfOpen
                }
            }
            CircuitState::Closed => CircuitState::Closed,
        };

        if let Err(e) = guard.release().await {
            warn!(api_key = %self.api_key, error = %e, "circuit lock release failed");
        }
        result
    }

    /// Record a successful upstream call. The first success in half-open
    /// closes the circuit and resets the failure counter.
    pub async fn record_success(&self) {
        let Some(guard) = self.acquire_mutation_lock().await else {
            return;
        };

        let mut data = self.load_state().await;
        match data.state {
            CircuitState::HalfOpen => {
                info!(api_key = %self.api_key, "circuit closing after successful probe");
                data = CircuitData::default();
                self.save_state(&data).await;
            }
            CircuitState::Closed => {
                if data.consecutive_failures > 0 {
                    data.consecutive_failures = 0;
                    self.save_state(&data).await;
                }
            }
            CircuitState::Open => {}
        }

        if let Err(e) = guard.release().await {
            warn!(api_key = %self.api_key, error = %e, "circuit lock release failed");
        }
    }

    /// Record a failed upstream call (5xx, timeout, or network error).
    pub async fn record_failure(&self) {
        let Some(guard) = self.acquire_mutation_lock().await else {
            return;
        };

        let mut data = self.load_state().await;
        let now = Self::now_ms();
        match data.state {
            CircuitState::Closed => {
                data.consecutive_failures += 1;
                data.last_failure_time_ms = Some(now);
                if data.consecutive_failures >= self.config.failure_threshold {
                    info!(
                        api_key = %self.api_key,
                        failures = data.consecutive_failures,
                        "circuit opening"
                    );
                    data.state = CircuitState::Open;
                }
                self.save_state(&data).await;
            }
            CircuitState::HalfOpen => {
                info!(api_key = %self.api_key, "circuit re-opening after probe failure");
                data.state = CircuitState::Open;
                data.last_failure_time_ms = Some(now);
                data.probe_started_at_ms = None;
                self.save_state(&data).await;
            }
            CircuitState::Open => {
                data.last_failure_time_ms = Some(now);
                self.save_state(&data).await;
            }
        }

        if let Err(e) = guard.release().await {
            warn!(api_key = %self.api_key, error = %e, "circuit lock release failed");
        }
    }

    /// Current state without triggering transitions.
    pub async fn state(&self) -> CircuitState {
        self.load_state().await.state
    }

    /// Administrative reset to closed.
    pub async fn reset(&self) {
        if let Some(guard) = self.acquire_mutation_lock().await {
            if let Err(e) = self.store.delete(&self.state_key()).await {
                warn!(api_key = %self.api_key, error = %e, "circuit reset failed");
            }
            if let Err(e) = guard.release().await {
                warn!(api_key = %self.api_key, error = %e, "circuit lock release failed");
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("api_key", &self.api_key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Lazily-populated registry of per-API circuit breakers.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitConfig,
    store: Arc<dyn StateStore>,
    lock: Arc<dyn DistributedLock>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry backed by the given store and lock.
    pub fn new(
        config: CircuitConfig,
        store: Arc<dyn StateStore>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            store,
            lock,
        }
    }

    /// Fetch (or create) the breaker for an API key.
    pub fn get(&self, api_key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(api_key) {
            return Arc::clone(&existing);
        }
        self.breakers
            .entry(api_key.to_owned())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    api_key,
                    self.config.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.lock),
                ))
            })
            .clone()
    }

    /// Reset every known breaker. Used by the administrative cache clear.
    pub async fn reset_all(&self) {
        let keys: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.get(&key).reset().await;
        }
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use gatehouse_state_memory::{MemoryDistributedLock, MemoryStateStore};

    use super::*;

    fn breaker(config: CircuitConfig) -> CircuitBreaker {
        CircuitBreaker::new(
            "demo/v1",
            config,
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemoryDistributedLock::new()),
        )
    }

    fn fast_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            open_duration: Duration::from_millis(0),
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = breaker(CircuitConfig {
            failure_threshold: 3,
            open_duration: Duration::from_secs(60),
        });

        for _ in 0..2 {
            cb.record_failure().await;
            assert_eq!(cb.state().await, CircuitState::Closed);
        }
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert_eq!(cb.try_acquire_permit().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let cb = breaker(CircuitConfig {
            failure_threshold: 2,
            open_duration: Duration::from_secs(60),
        });

        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_single_probe() {
        let cb = breaker(fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }

        // Zero open-duration: the next permit becomes the probe.
        assert_eq!(cb.try_acquire_permit().await, CircuitState::HalfOpen);
        // A second caller is rejected while the probe is in flight.
        assert_eq!(cb.try_acquire_permit().await, CircuitState::Open);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.try_acquire_permit().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let cb = breaker(fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert_eq!(cb.try_acquire_permit().await, CircuitState::HalfOpen);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let cb = breaker(fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
        cb.reset().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_isolates_api_keys() {
        let registry = CircuitBreakerRegistry::new(
            CircuitConfig {
                failure_threshold: 1,
                open_duration: Duration::from_secs(60),
            },
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemoryDistributedLock::new()),
        );

        registry.get("a").record_failure().await;
        assert_eq!(registry.get("a").state().await, CircuitState::Open);
        assert_eq!(registry.get("b").state().await, CircuitState::Closed);

        registry.reset_all().await;
        assert_eq!(registry.get("a").state().await, CircuitState::Closed);
    }
}
