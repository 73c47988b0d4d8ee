use std::str::FromStr;
use std::time::Duration;

use gatehouse_core::{RateQuota, RateWindow};

/// Read an environment variable, falling back to `default` when unset or
/// unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().map_or(default, |raw| {
        matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

fn env_secs_f64(key: &str, default: f64) -> Duration {
    Duration::from_secs_f64(env_or(key, default).max(0.0))
}

/// Connection pool and timeout settings for the shared upstream HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub total_timeout: Duration,
    pub max_connections: usize,
    pub max_keepalive: usize,
    pub keepalive_expiry: Duration,
    pub enable_http2: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(30),
            max_connections: 100,
            max_keepalive: 50,
            keepalive_expiry: Duration::from_secs(30),
            enable_http2: false,
        }
    }
}

/// Gateway configuration, sourced from the environment.
///
/// Every field has a documented default; unset or malformed variables fall
/// back silently so a bare environment always yields a runnable gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http: HttpClientConfig,
    /// Maximum request body size in bytes; larger bodies get `REQ001 413`.
    pub max_body_size: usize,
    /// Wrap payloads in the `{status_code, response_headers, ...}` envelope.
    pub strict_envelope: bool,
    /// Return 405 instead of 204 for OPTIONS requests matching no endpoint.
    pub strict_options_405: bool,
    pub grpc_max_retries: u32,
    pub grpc_retry_base: Duration,
    pub grpc_retry_max: Duration,
    /// Consecutive failures before a circuit opens.
    pub circuit_failure_threshold: u32,
    /// How long an open circuit rejects calls before probing.
    pub circuit_open_duration: Duration,
    /// Only emit CORS headers for origins on the API's allowlist.
    pub cors_strict: bool,
    /// Emit HSTS on every response.
    pub https_only: bool,
    /// `Content-Security-Policy` header value; empty disables the header.
    pub content_security_policy: String,
    /// Per-remote-IP quota applied to public APIs when configured.
    pub public_default_rate: Option<RateQuota>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http: HttpClientConfig::default(),
            max_body_size: 10_485_760,
            strict_envelope: false,
            strict_options_405: false,
            grpc_max_retries: 0,
            grpc_retry_base: Duration::from_millis(100),
            grpc_retry_max: Duration::from_millis(1_000),
            circuit_failure_threshold: 5,
            circuit_open_duration: Duration::from_millis(30_000),
            cors_strict: false,
            https_only: false,
            content_security_policy: "default-src 'none'; connect-src 'self'".to_owned(),
            public_default_rate: None,
        }
    }
}

impl GatewayConfig {
    /// Build the configuration from recognized environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let public_default_rate = std::env::var("PUBLIC_DEFAULT_RATE_LIMIT")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(|count| RateQuota {
                count,
                window: std::env::var("PUBLIC_DEFAULT_RATE_WINDOW")
                    .ok()
                    .and_then(|w| RateWindow::parse(&w))
                    .unwrap_or(RateWindow::Minute),
            });

        Self {
            http: HttpClientConfig {
                connect_timeout: env_secs_f64("HTTP_CONNECT_TIMEOUT", 5.0),
                read_timeout: env_secs_f64("HTTP_READ_TIMEOUT", 30.0),
                write_timeout: env_secs_f64("HTTP_WRITE_TIMEOUT", 30.0),
                total_timeout: env_secs_f64("HTTP_TIMEOUT", 30.0),
                max_connections: env_or("HTTP_MAX_CONNECTIONS", 100),
                max_keepalive: env_or("HTTP_MAX_KEEPALIVE", 50),
                keepalive_expiry: env_secs_f64("HTTP_KEEPALIVE_EXPIRY", 30.0),
                enable_http2: env_bool("HTTP_ENABLE_HTTP2", false),
            },
            max_body_size: env_or("MAX_BODY_SIZE_BYTES", defaults.max_body_size),
            strict_envelope: env_bool("STRICT_RESPONSE_ENVELOPE", false),
            strict_options_405: env_bool("STRICT_OPTIONS_405", false),
            grpc_max_retries: env_or("GRPC_MAX_RETRIES", 0),
            grpc_retry_base: Duration::from_millis(env_or("GRPC_RETRY_BASE_MS", 100)),
            grpc_retry_max: Duration::from_millis(env_or("GRPC_RETRY_MAX_MS", 1_000)),
            circuit_failure_threshold: env_or("CIRCUIT_FAILURE_THRESHOLD", 5),
            circuit_open_duration: Duration::from_millis(env_or(
                "CIRCUIT_OPEN_DURATION_MS",
                30_000,
            )),
            cors_strict: env_bool("CORS_STRICT", false),
            https_only: env_bool("HTTPS_ONLY", false),
            content_security_policy: std::env::var("CONTENT_SECURITY_POLICY")
                .unwrap_or(defaults.content_security_policy),
            public_default_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.http.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.http.total_timeout, Duration::from_secs(30));
        assert_eq!(config.http.max_connections, 100);
        assert_eq!(config.http.max_keepalive, 50);
        assert!(!config.http.enable_http2);
        assert_eq!(config.max_body_size, 10_485_760);
        assert!(!config.strict_envelope);
        assert_eq!(config.grpc_max_retries, 0);
        assert_eq!(config.circuit_failure_threshold, 5);
        assert_eq!(config.circuit_open_duration, Duration::from_millis(30_000));
        assert!(config.public_default_rate.is_none());
    }
}
