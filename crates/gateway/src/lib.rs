pub mod admission;
pub mod audit;
pub mod auth;
pub mod builder;
pub mod cache;
pub mod circuit;
pub mod config;
pub mod context;
pub mod credits;
pub mod error;
pub mod gateway;
pub mod grpc;
pub mod limits;
pub mod metrics;
pub mod normalize;
pub mod router;
pub mod upstream;
pub mod validation;

pub use admission::{Admission, AdmissionEngine, Grant};
pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use auth::{AuthError, PrincipalResolver};
pub use builder::GatewayBuilder;
pub use cache::GatewayCache;
pub use circuit::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use config::GatewayConfig;
pub use context::{GatewayRequest, GatewayResponse};
pub use error::{Denial, GatewayError};
pub use gateway::Gateway;
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use upstream::{HttpUpstream, UpstreamResponse};
