use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A fire-and-forget audit record emitted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Acting subject, when known.
    pub actor: Option<String>,
    /// Action performed, e.g. `gateway.clear_caches`, `gateway.denied`.
    pub action: String,
    /// Target of the action (API key, cache name, ...).
    pub target: String,
    /// `success` or `denied`.
    pub status: String,
    pub request_id: String,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(
        actor: Option<String>,
        action: impl Into<String>,
        target: impl Into<String>,
        status: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            actor,
            action: action.into(),
            target: target.into(),
            status: status.into(),
            request_id: request_id.into(),
            at: Utc::now(),
        }
    }
}

/// Sink for audit events. Emission must never block or fail the request.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Default sink: structured log lines at info level.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            actor = event.actor.as_deref().unwrap_or("-"),
            action = %event.action,
            target = %event.target,
            status = %event.status,
            request_id = %event.request_id,
            "audit"
        );
    }
}
