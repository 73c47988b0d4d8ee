use serde::{Deserialize, Serialize};

/// Stable gateway error codes surfaced to callers.
///
/// Each code maps to a default HTTP status; the pipeline may override the
/// status where the taxonomy allows a range (e.g. unexpected internal errors
/// carry the upstream's 5xx).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// API not found / no upstream configured.
    ApiNotFound,
    /// API has no registered endpoints.
    NoEndpoints,
    /// Endpoint not registered for the API.
    EndpointNotFound,
    /// Method not supported by the matched endpoint set.
    MethodNotSupported,
    /// Upstream returned 404.
    UpstreamNotFound,
    /// Unexpected upstream or internal error.
    UpstreamError,
    /// Credits exhausted.
    CreditsExhausted,
    /// Upstream timeout.
    UpstreamTimeout,
    /// Request validation failure.
    ValidationFailed,
    /// API disabled.
    ApiDisabled,
    /// gRPC target not allowed or IP policy violation.
    TargetNotAllowed,
    /// Caller's role not allowed for the API.
    RoleNotAllowed,
    /// Circuit open (503) or unhandled internal failure (500).
    GatewayFault,
    /// Request body exceeds the size limit.
    BodyTooLarge,
    /// No subscription for the requested API.
    SubscriptionRequired,
    /// Caller's groups do not intersect the API allowlist.
    GroupNotAllowed,
    /// Rate, throttle, or bandwidth quota exceeded.
    RateLimited,
    /// Missing or invalid credential.
    AuthRequired,
    /// Insufficient role permission on an administrative route.
    PermissionDenied,
}

impl ErrorCode {
    /// Wire representation of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiNotFound => "GTW001",
            Self::NoEndpoints => "GTW002",
            Self::EndpointNotFound => "GTW003",
            Self::MethodNotSupported => "GTW004",
            Self::UpstreamNotFound => "GTW005",
            Self::UpstreamError => "GTW006",
            Self::CreditsExhausted => "GTW008",
            Self::UpstreamTimeout => "GTW010",
            Self::ValidationFailed => "GTW011",
            Self::ApiDisabled => "GTW012",
            Self::TargetNotAllowed => "GTW013",
            Self::RoleNotAllowed => "GTW014",
            Self::GatewayFault => "GTW999",
            Self::BodyTooLarge => "REQ001",
            Self::SubscriptionRequired => "SUB_REQ",
            Self::GroupNotAllowed => "GRP_REQ",
            Self::RateLimited => "RL429",
            Self::AuthRequired => "AUTH401",
            Self::PermissionDenied => "AUTHZ001",
        }
    }

    /// Default HTTP status for the code.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::ApiNotFound
            | Self::NoEndpoints
            | Self::EndpointNotFound
            | Self::UpstreamNotFound => 404,
            Self::MethodNotSupported => 405,
            Self::UpstreamError => 500,
            Self::CreditsExhausted | Self::AuthRequired => 401,
            Self::UpstreamTimeout => 504,
            Self::ValidationFailed => 400,
            Self::ApiDisabled
            | Self::TargetNotAllowed
            | Self::RoleNotAllowed
            | Self::GroupNotAllowed
            | Self::PermissionDenied => 403,
            Self::GatewayFault => 503,
            Self::BodyTooLarge => 413,
            Self::SubscriptionRequired => 403,
            Self::RateLimited => 429,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON error body returned by every non-success gateway response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_code: String,
    pub error_message: String,
    pub request_id: String,
}

impl ErrorBody {
    /// Build an error body for the given code.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            error_code: code.as_str().to_owned(),
            error_message: message.into(),
            request_id: request_id.into(),
        }
    }
}
