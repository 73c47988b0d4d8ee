use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use gatehouse_core::{ErrorBody, ErrorCode};

/// Errors surfaced by the server's own routes (admin surface, startup).
#[derive(Debug, Error)]
pub enum ServerError {
    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error (e.g. binding the listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A gateway-level error surfaced through an admin route.
    #[error("gateway error: {0}")]
    Gateway(#[from] gatehouse_gateway::GatewayError),

    /// Authentication failed on an admin route.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller lacks the permission the route requires.
    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl ServerError {
    fn wire(&self) -> (StatusCode, ErrorCode, String) {
        match self {
            Self::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, ErrorCode::AuthRequired, msg.clone())
            }
            Self::Forbidden(msg) => {
                (StatusCode::FORBIDDEN, ErrorCode::PermissionDenied, msg.clone())
            }
            Self::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::GatewayFault,
                msg.clone(),
            ),
            Self::Io(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::GatewayFault,
                e.to_string(),
            ),
            Self::Gateway(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::GatewayFault,
                e.to_string(),
            ),
        }
    }

    /// Attach a request id and render the standard error body.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let (status, code, message) = self.wire();
        let body = ErrorBody::new(code, message, request_id);
        (status, axum::Json(body)).into_response()
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        self.into_response_with_id("")
    }
}
