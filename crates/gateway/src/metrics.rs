use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic counters for the request pipeline.
///
/// All counters use relaxed ordering: they are monitoring data, not
/// synchronization. `snapshot` gives a consistent-enough view for the status
/// endpoint.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    requests: AtomicU64,
    admitted: AtomicU64,
    denied: AtomicU64,
    upstream_errors: AtomicU64,
    upstream_timeouts: AtomicU64,
    retries: AtomicU64,
    circuit_open_rejections: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latency_ms_total: AtomicU64,
}

/// Point-in-time view of [`GatewayMetrics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub admitted: u64,
    pub denied: u64,
    pub upstream_errors: u64,
    pub upstream_timeouts: u64,
    pub retries: u64,
    pub circuit_open_rejections: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub latency_ms_total: u64,
}

impl GatewayMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed request with its transfer sizes and latency.
    pub fn observe_request(&self, bytes_in: u64, bytes_out: u64, status: u16, latency_ms: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        self.latency_ms_total.fetch_add(latency_ms, Ordering::Relaxed);
        if status >= 500 {
            self.upstream_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an admitted request.
    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an admission denial.
    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one upstream retry attempt.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upstream timeout.
    pub fn record_upstream_timeout(&self) {
        self.upstream_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call rejected by an open circuit.
    pub fn record_circuit_open(&self) {
        self.circuit_open_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Capture the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            upstream_timeouts: self.upstream_timeouts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            circuit_open_rejections: self.circuit_open_rejections.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            latency_ms_total: self.latency_ms_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = GatewayMetrics::new();
        metrics.observe_request(100, 200, 200, 12);
        metrics.observe_request(50, 10, 502, 3);
        metrics.record_retry();
        metrics.record_upstream_timeout();
        metrics.record_circuit_open();
        metrics.record_admitted();
        metrics.record_denied();

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.bytes_in, 150);
        assert_eq!(snap.bytes_out, 210);
        assert_eq!(snap.upstream_errors, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.upstream_timeouts, 1);
        assert_eq!(snap.circuit_open_rejections, 1);
        assert_eq!(snap.admitted, 1);
        assert_eq!(snap.denied, 1);
        assert_eq!(snap.latency_ms_total, 15);
    }
}
