use thiserror::Error;

use gatehouse_core::ErrorCode;

/// A refused request: stable code, HTTP status, and caller-facing message.
///
/// Denials are expected control flow, not errors; the pipeline converts them
/// into the wire-level error body without logging at error level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub code: ErrorCode,
    pub status: u16,
    pub message: String,
}

impl Denial {
    /// Create a denial with the code's default status.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status: code.status(),
            message: message.into(),
        }
    }

    /// Create a denial with an explicit status (e.g. upstream-derived 5xx).
    #[must_use]
    pub fn with_status(code: ErrorCode, status: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

/// Errors that can occur during gateway dispatch operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// An error occurred in the state store.
    #[error("state error: {0}")]
    State(#[from] gatehouse_state::StateError),

    /// An error occurred in the metadata store.
    #[error("metadata error: {0}")]
    Metadata(#[from] gatehouse_metadata::MetadataError),

    /// The upstream did not respond within the configured deadline.
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// The upstream could not be reached (connect/DNS/TLS failure).
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The upstream URL is malformed.
    #[error("invalid upstream url: {0}")]
    InvalidUpstreamUrl(String),

    /// The gateway was misconfigured (e.g. missing required components).
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_defaults_to_code_status() {
        let denial = Denial::new(ErrorCode::RateLimited, "rate limit exceeded");
        assert_eq!(denial.status, 429);

        let denial = Denial::with_status(ErrorCode::UpstreamError, 502, "bad gateway");
        assert_eq!(denial.status, 502);
        assert_eq!(denial.code, ErrorCode::UpstreamError);
    }
}
