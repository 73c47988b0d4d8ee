use bytes::Bytes;
use http::HeaderMap;
use tracing::{debug, warn};

use gatehouse_core::ErrorCode;

use crate::circuit::{CircuitBreaker, CircuitState};
use crate::config::HttpClientConfig;
use crate::error::{Denial, GatewayError};
use crate::metrics::GatewayMetrics;

/// Upstream statuses that consume the retry budget.
const RETRYABLE_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// What the upstream sent back, after the retry loop settled.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Total attempts made; retries performed = `attempts - 1`.
    pub attempts: u32,
}

impl UpstreamResponse {
    /// Retries performed beyond the first attempt.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Shared pooled HTTP client for REST and SOAP upstreams.
///
/// One client is built at gateway construction and reused by every request;
/// per-call state is limited to connection checkout.
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    /// Build the pooled client from configuration.
    pub fn new(config: &HttpClientConfig) -> Result<Self, GatewayError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .read_timeout(config.read_timeout)
            .pool_max_idle_per_host(config.max_keepalive)
            .pool_idle_timeout(config.keepalive_expiry);

        if !config.enable_http2 {
            builder = builder.http1_only();
        }

        let client = builder
            .build()
            .map_err(|e| GatewayError::Configuration(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    /// Dispatch one request with a bounded retry loop.
    ///
    /// Retries fire only on upstream {500, 502, 503, 504}; 4xx and network
    /// errors do not consume the budget. Each retry resends the exact same
    /// headers and body.
    pub async fn call(
        &self,
        method: &str,
        url: &str,
        headers: &HeaderMap,
        body: Option<&Bytes>,
        retries: u32,
        metrics: &GatewayMetrics,
    ) -> Result<UpstreamResponse, GatewayError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| GatewayError::Configuration(format!("invalid method: {e}")))?;

        let mut attempts = 0u32;
        loop {
            attempts += 1;

            let mut request = self
                .client
                .request(method.clone(), url)
                .headers(headers.clone());
            if let Some(bytes) = body {
                request = request.body(bytes.clone());
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    metrics.record_upstream_timeout();
                    return Err(GatewayError::UpstreamTimeout(e.to_string()));
                }
                Err(e) => {
                    warn!(url, error = %e, "upstream request failed");
                    return Err(GatewayError::UpstreamUnreachable(e.to_string()));
                }
            };

            let status = response.status().as_u16();
            if RETRYABLE_STATUSES.contains(&status) && attempts <= retries {
                debug!(url, status, attempt = attempts, "retrying upstream call");
                metrics.record_retry();
                continue;
            }

            let headers = response.headers().clone();
            let body = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) if e.is_timeout() => {
                    metrics.record_upstream_timeout();
                    return Err(GatewayError::UpstreamTimeout(e.to_string()));
                }
                Err(e) => return Err(GatewayError::UpstreamUnreachable(e.to_string())),
            };

            return Ok(UpstreamResponse {
                status,
                headers,
                body,
                attempts,
            });
        }
    }
}

/// Run `attempt` under the API's circuit breaker.
///
/// An open circuit rejects the call with `GTW999 503` before any network
/// activity. Otherwise the attempt runs and its outcome feeds the breaker:
/// 5xx, timeouts, and network errors count as failures; everything else
/// (4xx included) counts as success.
pub async fn call_with_resilience<T, F, Fut>(
    breaker: &CircuitBreaker,
    metrics: &GatewayMetrics,
    is_failure: impl Fn(&T) -> bool,
    attempt: F,
) -> Result<Result<T, GatewayError>, Denial>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    if breaker.try_acquire_permit().await == CircuitState::Open {
        metrics.record_circuit_open();
        return Err(Denial::new(
            ErrorCode::GatewayFault,
            "Upstream temporarily unavailable (circuit open)",
        ));
    }

    let result = attempt().await;
    match &result {
        Ok(value) if !is_failure(value) => breaker.record_success().await,
        _ => breaker.record_failure().await,
    }

    Ok(result)
}
