use std::sync::Arc;

use gatehouse_metadata::MetadataStore;
use gatehouse_state::{DistributedLock, StateStore};

use crate::admission::AdmissionEngine;
use crate::audit::{AuditSink, TracingAuditSink};
use crate::auth::PrincipalResolver;
use crate::cache::GatewayCache;
use crate::circuit::{CircuitBreakerRegistry, CircuitConfig};
use crate::config::GatewayConfig;
use crate::credits::CreditEngine;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::grpc::GrpcUpstream;
use crate::limits::LimitEngine;
use crate::metrics::GatewayMetrics;
use crate::router::Router;
use crate::upstream::HttpUpstream;
use crate::validation::ValidationEngine;

/// Builder for [`Gateway`].
///
/// A state store, a lock, a metadata store, and a principal resolver are
/// required; everything else has defaults.
#[derive(Default)]
pub struct GatewayBuilder {
    config: Option<GatewayConfig>,
    store: Option<Arc<dyn StateStore>>,
    lock: Option<Arc<dyn DistributedLock>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    resolver: Option<Arc<dyn PrincipalResolver>>,
    audit: Option<Arc<dyn AuditSink>>,
    validator: ValidationEngine,
}

impl GatewayBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gateway configuration (defaults to `GatewayConfig::default()`).
    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the state store backing caches, counters, and circuit state.
    #[must_use]
    pub fn state(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the lock serialising circuit breaker mutations.
    #[must_use]
    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Set the metadata store.
    #[must_use]
    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the principal resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn PrincipalResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the audit sink (defaults to structured log lines).
    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register a named custom payload validator.
    #[must_use]
    pub fn custom_validator(
        mut self,
        name: impl Into<String>,
        validator: impl Fn(&serde_json::Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator.register_custom(name, validator);
        self
    }

    /// Assemble the gateway.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let config = Arc::new(self.config.unwrap_or_default());
        let store = self
            .store
            .ok_or_else(|| GatewayError::Configuration("state store is required".into()))?;
        let lock = self
            .lock
            .ok_or_else(|| GatewayError::Configuration("lock is required".into()))?;
        let metadata = self
            .metadata
            .ok_or_else(|| GatewayError::Configuration("metadata store is required".into()))?;
        let resolver = self
            .resolver
            .ok_or_else(|| GatewayError::Configuration("principal resolver is required".into()))?;
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));

        let cache = Arc::new(GatewayCache::new(Arc::clone(&store), Arc::clone(&metadata)));
        let limits = Arc::new(LimitEngine::new(Arc::clone(&store)));
        let admission = AdmissionEngine::new(
            Arc::clone(&cache),
            Arc::clone(&metadata),
            Arc::clone(&limits),
            resolver,
            Arc::clone(&config),
        );
        let circuits = CircuitBreakerRegistry::new(
            CircuitConfig {
                failure_threshold: config.circuit_failure_threshold,
                open_duration: config.circuit_open_duration,
            },
            Arc::clone(&store),
            lock,
        );
        let http = HttpUpstream::new(&config.http)?;
        let grpc = GrpcUpstream::new(&config);
        let router = Router::new(Arc::clone(&store), Arc::clone(&metadata));
        let credits = CreditEngine::new(Arc::clone(&metadata));

        Ok(Gateway {
            config,
            cache,
            metadata,
            admission,
            limits,
            credits,
            router,
            circuits,
            http,
            grpc,
            validator: self.validator,
            metrics: Arc::new(GatewayMetrics::new()),
            audit,
        })
    }
}
