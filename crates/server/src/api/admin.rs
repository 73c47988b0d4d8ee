use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use gatehouse_core::Principal;
use gatehouse_gateway::PrincipalResolver as _;

use super::AppState;
use crate::error::ServerError;

/// Permission gating the administrative surface.
const MANAGE_GATEWAY: &str = "manage_gateway";

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), ToOwned::to_owned)
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    Some(
        value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .unwrap_or(value)
            .trim()
            .to_owned(),
    )
}

/// Verify the caller and require the `manage_gateway` permission.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Principal, ServerError> {
    let credential =
        bearer(headers).ok_or_else(|| ServerError::Unauthorized("missing credential".into()))?;
    let principal = state
        .resolver
        .verify(&credential)
        .await
        .map_err(|e| ServerError::Unauthorized(e.to_string()))?;

    let role = state
        .gateway
        .metadata()
        .get_role(&principal.role)
        .await
        .map_err(|e| ServerError::Gateway(e.into()))?;
    if role.is_some_and(|r| r.has_permission(MANAGE_GATEWAY)) {
        Ok(principal)
    } else {
        Err(ServerError::Forbidden(format!(
            "role '{}' lacks the {MANAGE_GATEWAY} permission",
            principal.role
        )))
    }
}

/// `DELETE /api/caches` — clear every cache keyspace, counters and circuit
/// state included. Idempotent.
pub async fn clear_caches(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);

    let principal = match authorize(&state, &headers).await {
        Ok(principal) => principal,
        Err(e) => return e.into_response_with_id(&request_id),
    };

    if let Err(e) = state
        .gateway
        .clear_caches(Some(&principal.subject), &request_id)
        .await
    {
        return ServerError::Gateway(e).into_response_with_id(&request_id);
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "message": "All caches cleared",
            "request_id": request_id,
        })),
    )
        .into_response()
}

/// `OPTIONS /api/caches` — preflight, no auth required.
pub async fn caches_preflight() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// `GET /api/status` — uptime, backend, pool configuration, and a metrics
/// snapshot. Requires `manage_gateway`.
pub async fn status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);

    if let Err(e) = authorize(&state, &headers).await {
        return e.into_response_with_id(&request_id);
    }

    let config = state.gateway.config();
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds()
        .max(0);

    let body = serde_json::json!({
        "status": "ok",
        "uptime_seconds": uptime,
        "state_backend": state.state_backend,
        "upstream_pool": {
            "max_connections": config.http.max_connections,
            "max_keepalive": config.http.max_keepalive,
            "keepalive_expiry_seconds": config.http.keepalive_expiry.as_secs(),
            "http2": config.http.enable_http2,
        },
        "metrics": state.gateway.metrics().snapshot(),
        "request_id": request_id,
    });
    (StatusCode::OK, Json(body)).into_response()
}
