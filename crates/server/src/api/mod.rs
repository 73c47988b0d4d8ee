pub mod admin;
pub mod health;
pub mod proxy;

use std::sync::Arc;

use axum::Router;
use axum::routing::{any, delete, get, post};
use chrono::{DateTime, Utc};
use tower_http::trace::TraceLayer;

use gatehouse_gateway::{Gateway, PrincipalResolver};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The gateway pipeline.
    pub gateway: Arc<Gateway>,
    /// Principal resolver, reused by the admin routes.
    pub resolver: Arc<dyn PrincipalResolver>,
    /// Process start time, for the status endpoint.
    pub started_at: DateTime<Utc>,
    /// Human-readable state backend name.
    pub state_backend: String,
}

/// Build the Axum router with the public proxy surface and the admin routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Public liveness.
        .route("/api/health", get(health::health))
        // Admin surface (requires the manage_gateway permission).
        .route("/api/status", get(admin::status))
        .route(
            "/api/caches",
            delete(admin::clear_caches).options(admin::caches_preflight),
        )
        // Protocol adapters.
        .route("/api/rest/{*path}", any(proxy::rest))
        .route("/api/soap/{*path}", post(proxy::soap).options(proxy::soap))
        .route(
            "/api/graphql/{name}",
            post(proxy::graphql).options(proxy::graphql),
        )
        .route("/api/grpc/{name}", post(proxy::grpc).options(proxy::grpc))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
