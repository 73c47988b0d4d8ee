use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use regex::Regex;
use serde_json::json;
use tracing::{debug, error, info};

use gatehouse_core::{Api, ApiType, Endpoint, ErrorCode, GrpcCode};
use gatehouse_metadata::MetadataStore;

use crate::admission::{Admission, AdmissionEngine, Grant};
use crate::audit::{AuditEvent, AuditSink};
use crate::cache::GatewayCache;
use crate::circuit::CircuitBreakerRegistry;
use crate::config::GatewayConfig;
use crate::context::{GatewayRequest, GatewayResponse};
use crate::credits::{CreditEngine, CreditTicket};
use crate::error::{Denial, GatewayError};
use crate::grpc::{GrpcCallSpec, GrpcUpstream};
use crate::limits::LimitEngine;
use crate::metrics::GatewayMetrics;
use crate::normalize;
use crate::router::{Router, UpstreamScheme, UpstreamTarget};
use crate::upstream::{HttpUpstream, UpstreamResponse, call_with_resilience};
use crate::validation::{ValidationEngine, ValidationError};

/// Request headers never forwarded to the upstream.
const SKIP_FORWARD: [&str; 6] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
];

/// An API resolved from the request path, plus the remaining endpoint URI.
struct Resolved {
    api: Api,
    /// URI below the API prefix, always starting with `/`.
    endpoint_uri: String,
}

enum Step<T> {
    Go(T),
    Stop(GatewayResponse),
}

macro_rules! go {
    ($step:expr) => {
        match $step {
            Step::Go(value) => value,
            Step::Stop(response) => return Ok(response),
        }
    };
}

/// The gateway pipeline: resolution, admission, validation, credits,
/// routing, resilient dispatch, and response normalization for the four
/// protocol adapters.
///
/// One `Gateway` value is built at process startup and shared by every
/// request; all interior state lives in the state store, the circuit
/// registry, and the connection pools.
pub struct Gateway {
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) cache: Arc<GatewayCache>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) admission: AdmissionEngine,
    pub(crate) limits: Arc<LimitEngine>,
    pub(crate) credits: CreditEngine,
    pub(crate) router: Router,
    pub(crate) circuits: CircuitBreakerRegistry,
    pub(crate) http: HttpUpstream,
    pub(crate) grpc: GrpcUpstream,
    pub(crate) validator: ValidationEngine,
    pub(crate) metrics: Arc<GatewayMetrics>,
    pub(crate) audit: Arc<dyn AuditSink>,
}

impl Gateway {
    /// Shared metrics handle.
    #[must_use]
    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Metadata store handle (used by the server's auth layer).
    #[must_use]
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Clear every cache keyspace, reset counters and circuit state.
    /// Idempotent; repeated calls observe the same result.
    pub async fn clear_caches(
        &self,
        actor: Option<&str>,
        request_id: &str,
    ) -> Result<(), GatewayError> {
        self.cache.clear_all().await?;
        self.circuits.reset_all().await;
        self.audit.emit(AuditEvent::new(
            actor.map(ToOwned::to_owned),
            "gateway.clear_caches",
            "all",
            "success",
            request_id,
        ));
        info!(request_id, "all caches cleared");
        Ok(())
    }

    /// Dispatch one request through the protocol adapter for `protocol`.
    /// Never fails: internal errors become `GTW999 500` responses.
    pub async fn dispatch(&self, protocol: ApiType, request: GatewayRequest) -> GatewayResponse {
        let bytes_in = request.body.len() as u64;
        let result = match protocol {
            ApiType::Rest | ApiType::Soap => self.dispatch_http(protocol, &request).await,
            ApiType::Graphql => self.dispatch_graphql(&request).await,
            ApiType::Grpc => self.dispatch_grpc(&request).await,
        };

        let response = result.unwrap_or_else(|e| {
            error!(request_id = %request.request_id, error = %e, "gateway dispatch failed");
            normalize::error_response(
                &self.config,
                protocol,
                None,
                &request,
                &Denial::with_status(
                    ErrorCode::GatewayFault,
                    500,
                    "An unexpected error occurred",
                ),
            )
        });

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        #[allow(clippy::cast_precision_loss)]
        let latency_ms = ((chrono::Utc::now().timestamp_micros() as f64 / 1_000.0)
            - request.received_at_ms)
            .max(0.0) as u64;
        self.metrics.observe_request(
            bytes_in,
            response.body.len() as u64,
            response.status,
            latency_ms,
        );
        response
    }

    // -- Resolution -------------------------------------------------------

    /// REST/SOAP resolution: `/{name}/{vN}/...`, else `/{name}/...` with the
    /// `X-API-Version` header.
    async fn resolve_versioned_path(
        &self,
        request: &GatewayRequest,
    ) -> Result<Option<Resolved>, GatewayError> {
        let segments = request.segments();

        let (name, version, rest) = if segments.len() >= 2 && is_version(segments[1]) {
            (segments[0], segments[1].to_owned(), &segments[2..])
        } else if !segments.is_empty()
            && let Some(header) = request.header("x-api-version")
        {
            (segments[0], header.to_owned(), &segments[1..])
        } else {
            return Ok(None);
        };

        let Some(api) = self.cache.get_api(name, &version).await? else {
            return Ok(None);
        };

        let endpoint_uri = if rest.is_empty() {
            "/".to_owned()
        } else {
            format!("/{}", rest.join("/"))
        };
        Ok(Some(Resolved { api, endpoint_uri }))
    }

    /// GraphQL/gRPC resolution: the last path segment is the API name, the
    /// version comes from the `X-API-Version` header.
    async fn resolve_named(
        &self,
        request: &GatewayRequest,
        version: &str,
    ) -> Result<Option<Resolved>, GatewayError> {
        let Some(name) = request.segments().last().copied() else {
            return Ok(None);
        };
        let Some(api) = self.cache.get_api(name, version).await? else {
            return Ok(None);
        };
        Ok(Some(Resolved {
            api,
            endpoint_uri: "/".to_owned(),
        }))
    }

    /// Gate checks shared by every adapter once the API is known: active
    /// flag, then IP policy.
    fn gate(&self, api: &Api, request: &GatewayRequest) -> Option<Denial> {
        if !api.active {
            return Some(Denial::new(ErrorCode::ApiDisabled, "API is disabled"));
        }
        if let Some(policy) = &api.ip_policy
            && !policy.permits(request.remote_ip)
        {
            debug!(ip = %request.remote_ip, api = %api.api_id, "IP policy block");
            return Some(Denial::new(ErrorCode::TargetNotAllowed, "IP restricted"));
        }
        None
    }

    // -- Shared pipeline pieces -------------------------------------------

    async fn run_admission(
        &self,
        protocol: ApiType,
        api: &Api,
        request: &GatewayRequest,
    ) -> Result<Step<Box<Grant>>, GatewayError> {
        let credential = extract_credential(api, request);
        match self.admission.admit(api, request, credential.as_deref()).await? {
            Admission::Admitted(grant) => {
                self.metrics.record_admitted();
                Ok(Step::Go(grant))
            }
            Admission::Denied(denial) => {
                self.metrics.record_denied();
                self.audit.emit(AuditEvent::new(
                    None,
                    "gateway.denied",
                    api.subscription_key(),
                    denial.code.as_str().to_owned(),
                    request.request_id.clone(),
                ));
                Ok(Step::Stop(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(api),
                    request,
                    &denial,
                )))
            }
        }
    }

    async fn deduct_credits(
        &self,
        protocol: ApiType,
        api: &Api,
        grant: &Grant,
        request: &GatewayRequest,
    ) -> Result<Step<Option<CreditTicket>>, GatewayError> {
        if api.public || !api.credits_enabled {
            return Ok(Step::Go(None));
        }
        let Some(subject) = grant.subject.as_deref() else {
            return Ok(Step::Go(None));
        };

        match self.credits.deduct(api, subject).await? {
            Ok(ticket) => Ok(Step::Go(Some(ticket))),
            Err(denial) => Ok(Step::Stop(normalize::error_response(
                &self.config,
                protocol,
                Some(api),
                request,
                &denial,
            ))),
        }
    }

    async fn refund_if_charged(&self, grant: &Grant, ticket: Option<&CreditTicket>) {
        if let (Some(subject), Some(ticket)) = (grant.subject.as_deref(), ticket) {
            self.credits.refund(subject, ticket).await;
        }
    }

    async fn select_target(
        &self,
        protocol: ApiType,
        api: &Api,
        endpoint: Option<&Endpoint>,
        grant: &Grant,
        ticket: Option<&CreditTicket>,
        request: &GatewayRequest,
    ) -> Result<Step<UpstreamTarget>, GatewayError> {
        let client_key = request.header("client-key");
        if let Some(target) = self.router.select(api, endpoint, client_key).await? {
            return Ok(Step::Go(target));
        }

        // Fail closed, returning the credit that was never spent upstream.
        self.refund_if_charged(grant, ticket).await;
        Ok(Step::Stop(normalize::error_response(
            &self.config,
            protocol,
            Some(api),
            request,
            &Denial::new(ErrorCode::ApiNotFound, "No upstream servers configured"),
        )))
    }

    /// Validate the request payload when the matched endpoint carries an
    /// enabled schema. `payload` supplies the protocol-specific document.
    async fn run_validation(
        &self,
        protocol: ApiType,
        api: &Api,
        endpoint: Option<&Endpoint>,
        request: &GatewayRequest,
    ) -> Result<Step<()>, GatewayError> {
        let Some(endpoint) = endpoint else {
            return Ok(Step::Go(()));
        };
        let Some(validation) = self.cache.get_validation(&endpoint.endpoint_id).await? else {
            return Ok(Step::Go(()));
        };
        if !validation.enabled {
            return Ok(Step::Go(()));
        }

        let outcome = match protocol {
            ApiType::Soap => self.validator.validate_soap(&validation.schema, &request.body),
            ApiType::Graphql => {
                match parse_json_body(&request.body)
                    .and_then(|body| {
                        body.get("query")
                            .and_then(|q| q.as_str())
                            .map(ToOwned::to_owned)
                            .ok_or_else(|| {
                                Denial::new(ErrorCode::ValidationFailed, "Missing GraphQL query")
                            })
                    }) {
                    Ok(query) => self.validator.validate_graphql(&validation.schema, &query),
                    Err(denial) => {
                        return Ok(Step::Stop(normalize::error_response(
                            &self.config,
                            protocol,
                            Some(api),
                            request,
                            &denial,
                        )));
                    }
                }
            }
            ApiType::Rest | ApiType::Grpc => {
                let document = if protocol == ApiType::Grpc {
                    match parse_json_body(&request.body) {
                        Ok(body) => body.get("message").cloned().unwrap_or(json!({})),
                        Err(_) => json!({}),
                    }
                } else {
                    match parse_json_body(&request.body) {
                        Ok(body) => body,
                        Err(denial) => {
                            return Ok(Step::Stop(normalize::error_response(
                                &self.config,
                                protocol,
                                Some(api),
                                request,
                                &denial,
                            )));
                        }
                    }
                };
                self.validator.validate(&validation.schema, &document)
            }
        };

        match outcome {
            Ok(()) => Ok(Step::Go(())),
            Err(e) => {
                let message = match &e {
                    ValidationError::Schema(_) | ValidationError::Payload(_) => e.to_string(),
                };
                Ok(Step::Stop(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(api),
                    request,
                    &Denial::new(ErrorCode::ValidationFailed, message),
                )))
            }
        }
    }

    async fn record_bandwidth(&self, grant: &Grant, request: &GatewayRequest, bytes_out: usize) {
        if let (Some(subject), Some(quota)) = (grant.subject.as_deref(), &grant.bandwidth) {
            let total = request.body.len() as u64 + bytes_out as u64;
            if let Err(e) = self.limits.record_bandwidth(subject, quota, total).await {
                error!(subject, error = %e, "bandwidth accounting failed");
            }
        }
    }

    // -- REST / SOAP ------------------------------------------------------

    async fn dispatch_http(
        &self,
        protocol: ApiType,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        if protocol == ApiType::Soap
            && request.method != "OPTIONS"
            && !soap_content_type_ok(request)
        {
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                None,
                request,
                &Denial::with_status(
                    ErrorCode::ValidationFailed,
                    415,
                    "Unsupported content type for SOAP",
                ),
            ));
        }

        let Some(resolved) = self.resolve_versioned_path(request).await? else {
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                None,
                request,
                &Denial::new(
                    ErrorCode::ApiNotFound,
                    "API does not exist for the requested name and version",
                ),
            ));
        };
        let Resolved { api, endpoint_uri } = resolved;

        if let Some(denial) = self.gate(&api, request) {
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                Some(&api),
                request,
                &denial,
            ));
        }

        // Endpoint existence; HEAD matches as GET.
        let composites = self.cache.get_endpoint_composites(&api.api_id).await?;
        if request.method == "OPTIONS" {
            let matched = find_matching_template(&composites, "OPTIONS", &endpoint_uri);
            if self.config.strict_options_405 && matched.is_none() {
                return Ok(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(&api),
                    request,
                    &Denial::new(ErrorCode::MethodNotSupported, "Method not supported"),
                ));
            }
            return Ok(normalize::preflight_response(&self.config, &api, request));
        }
        if composites.is_empty() {
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                Some(&api),
                request,
                &Denial::new(ErrorCode::NoEndpoints, "No endpoints found for the requested API"),
            ));
        }
        let match_method = if request.method == "HEAD" {
            "GET"
        } else {
            request.method.as_str()
        };
        let Some(template) = find_matching_template(&composites, match_method, &endpoint_uri)
        else {
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                Some(&api),
                request,
                &Denial::new(
                    ErrorCode::EndpointNotFound,
                    "Endpoint does not exist for the requested API",
                ),
            ));
        };

        let grant = go!(self.run_admission(protocol, &api, request).await?);

        // Hydrate the endpoint record for validation and server overrides.
        let template_uri = template
            .strip_prefix(match_method)
            .unwrap_or(&endpoint_uri)
            .to_owned();
        let endpoint = self.cache.get_endpoint(&api, match_method, &template_uri).await?;

        go!(self.run_validation(protocol, &api, endpoint.as_ref(), request).await?);

        let ticket = go!(self.deduct_credits(protocol, &api, &grant, request).await?);

        let target = go!(
            self.select_target(protocol, &api, endpoint.as_ref(), &grant, ticket.as_ref(), request)
                .await?
        );

        // Assemble the upstream request; the query string passes through
        // verbatim.
        let url = match &request.raw_query {
            Some(query) => format!("{}{}?{}", target.url, endpoint_uri, query),
            None => format!("{}{}", target.url, endpoint_uri),
        };
        let headers = build_upstream_headers(&api, request, ticket.as_ref());
        let body = (!request.body.is_empty()).then(|| request.body.clone());

        let api_key = api.subscription_key();
        let breaker = self.circuits.get(&api_key);
        let backend_started = std::time::Instant::now();
        let outcome = call_with_resilience(
            &breaker,
            &self.metrics,
            |response: &UpstreamResponse| response.status >= 500,
            || {
                self.http.call(
                    &request.method,
                    &url,
                    &headers,
                    body.as_ref(),
                    api.retry_count,
                    &self.metrics,
                )
            },
        )
        .await;

        let result = match outcome {
            Err(denial) => {
                // Rejected before any upstream contact.
                self.refund_if_charged(&grant, ticket.as_ref()).await;
                return Ok(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(&api),
                    request,
                    &denial,
                ));
            }
            Ok(result) => result,
        };

        #[allow(clippy::cast_possible_truncation)]
        let backend_ms = backend_started.elapsed().as_millis() as u64;

        let upstream = match result {
            Ok(upstream) => upstream,
            Err(GatewayError::UpstreamTimeout(_)) => {
                return Ok(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(&api),
                    request,
                    &Denial::new(ErrorCode::UpstreamTimeout, "Upstream request timed out"),
                ));
            }
            Err(GatewayError::UpstreamUnreachable(_)) => {
                // The upstream was never reached; the credit goes back.
                self.refund_if_charged(&grant, ticket.as_ref()).await;
                return Ok(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(&api),
                    request,
                    &Denial::with_status(ErrorCode::UpstreamError, 500, "Internal server error"),
                ));
            }
            Err(e) => return Err(e),
        };

        self.record_bandwidth(&grant, request, upstream.body.len()).await;

        if upstream.status == 404 {
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                Some(&api),
                request,
                &Denial::new(
                    ErrorCode::UpstreamNotFound,
                    "Endpoint does not exist in backend service",
                ),
            ));
        }

        Ok(normalize::success_response(
            &self.config,
            &api,
            request,
            &upstream,
            backend_ms,
        ))
    }

    // -- GraphQL ----------------------------------------------------------

    async fn dispatch_graphql(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let protocol = ApiType::Graphql;

        // Preflight cannot carry custom headers; resolve with the default
        // version and fall back to a bare 204 when the API is unknown.
        if request.method == "OPTIONS" {
            let version = request.header("x-api-version").unwrap_or("v1").to_owned();
            if let Some(resolved) = self.resolve_named(request, &version).await? {
                return Ok(normalize::preflight_response(
                    &self.config,
                    &resolved.api,
                    request,
                ));
            }
            return Ok(GatewayResponse::new(204, Bytes::new()));
        }

        let Some(version) = request.header("x-api-version").map(ToOwned::to_owned) else {
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                None,
                request,
                &Denial::new(ErrorCode::ValidationFailed, "X-API-Version header required"),
            ));
        };

        let Some(resolved) = self.resolve_named(request, &version).await? else {
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                None,
                request,
                &Denial::new(ErrorCode::ApiNotFound, "API does not exist for the requested name and version"),
            ));
        };
        let api = resolved.api;

        if let Some(denial) = self.gate(&api, request) {
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                Some(&api),
                request,
                &denial,
            ));
        }
        let grant = go!(self.run_admission(protocol, &api, request).await?);

        let endpoint = self.cache.get_endpoint(&api, "POST", "/").await?;
        go!(self.run_validation(protocol, &api, endpoint.as_ref(), request).await?);

        let ticket = go!(self.deduct_credits(protocol, &api, &grant, request).await?);
        let target = go!(
            self.select_target(protocol, &api, endpoint.as_ref(), &grant, ticket.as_ref(), request)
                .await?
        );

        let mut headers = build_upstream_headers(&api, request, ticket.as_ref());
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );

        let api_key = api.subscription_key();
        let breaker = self.circuits.get(&api_key);
        let backend_started = std::time::Instant::now();
        let outcome = call_with_resilience(
            &breaker,
            &self.metrics,
            |response: &UpstreamResponse| response.status >= 500,
            || {
                self.http.call(
                    "POST",
                    &target.url,
                    &headers,
                    Some(&request.body),
                    api.retry_count,
                    &self.metrics,
                )
            },
        )
        .await;

        let result = match outcome {
            Err(denial) => {
                self.refund_if_charged(&grant, ticket.as_ref()).await;
                return Ok(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(&api),
                    request,
                    &denial,
                ));
            }
            Ok(result) => result,
        };

        #[allow(clippy::cast_possible_truncation)]
        let backend_ms = backend_started.elapsed().as_millis() as u64;

        let upstream = match result {
            Ok(upstream) => upstream,
            Err(GatewayError::UpstreamTimeout(_)) => {
                return Ok(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(&api),
                    request,
                    &Denial::new(ErrorCode::UpstreamTimeout, "Upstream request timed out"),
                ));
            }
            Err(GatewayError::UpstreamUnreachable(_)) => {
                self.refund_if_charged(&grant, ticket.as_ref()).await;
                return Ok(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(&api),
                    request,
                    &Denial::with_status(ErrorCode::UpstreamError, 500, "Internal server error"),
                ));
            }
            Err(e) => return Err(e),
        };

        self.record_bandwidth(&grant, request, upstream.body.len()).await;

        Ok(normalize::success_response(
            &self.config,
            &api,
            request,
            &upstream,
            backend_ms,
        ))
    }

    // -- gRPC -------------------------------------------------------------

    async fn dispatch_grpc(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let protocol = ApiType::Grpc;
        let version = request
            .header("x-api-version")
            .unwrap_or("v1")
            .to_owned();

        let Some(resolved) = self.resolve_named(request, &version).await? else {
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                None,
                request,
                &Denial::new(ErrorCode::ApiNotFound, "API does not exist for the requested name and version"),
            ));
        };
        let api = resolved.api;

        if let Some(denial) = self.gate(&api, request) {
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                Some(&api),
                request,
                &denial,
            ));
        }
        if request.method == "OPTIONS" {
            return Ok(normalize::preflight_response(&self.config, &api, request));
        }

        let grant = go!(self.run_admission(protocol, &api, request).await?);

        // Protocol-specific validation: body shape, method spec, allowlists.
        let spec: GrpcCallSpec = match parse_json_body(&request.body).and_then(|body| {
            serde_json::from_value(body).map_err(|_| {
                Denial::new(ErrorCode::ValidationFailed, "Invalid request body format")
            })
        }) {
            Ok(spec) => spec,
            Err(denial) => {
                return Ok(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(&api),
                    request,
                    &denial,
                ));
            }
        };

        let path = match GrpcUpstream::authorize(&api, &spec) {
            Ok(path) => path,
            Err(denial) => {
                return Ok(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(&api),
                    request,
                    &denial,
                ));
            }
        };

        let endpoint = self.cache.get_endpoint(&api, "POST", "/").await?;
        go!(self.run_validation(protocol, &api, endpoint.as_ref(), request).await?);

        let ticket = go!(self.deduct_credits(protocol, &api, &grant, request).await?);
        let target = go!(
            self.select_target(protocol, &api, endpoint.as_ref(), &grant, ticket.as_ref(), request)
                .await?
        );

        let (authority, tls) = match target.scheme {
            UpstreamScheme::Grpc { tls } => (target.url.clone(), tls),
            UpstreamScheme::Http => {
                if let Some(rest) = target.url.strip_prefix("https://") {
                    (rest.trim_end_matches('/').to_owned(), true)
                } else if let Some(rest) = target.url.strip_prefix("http://") {
                    (rest.trim_end_matches('/').to_owned(), false)
                } else {
                    (target.url.clone(), false)
                }
            }
        };

        let headers = build_upstream_headers(&api, request, ticket.as_ref());
        let api_key = api.subscription_key();
        let breaker = self.circuits.get(&api_key);
        let backend_started = std::time::Instant::now();

        // Circuit check runs before any network activity; gRPC denials from
        // channel setup are pre-contact failures and skip circuit feedback.
        if breaker.try_acquire_permit().await == crate::circuit::CircuitState::Open {
            self.metrics.record_circuit_open();
            self.refund_if_charged(&grant, ticket.as_ref()).await;
            return Ok(normalize::error_response(
                &self.config,
                protocol,
                Some(&api),
                request,
                &Denial::new(
                    ErrorCode::GatewayFault,
                    "Upstream temporarily unavailable (circuit open)",
                ),
            ));
        }

        let call_result = self
            .grpc
            .call(&authority, tls, &path, &spec, &headers, &self.metrics)
            .await;

        #[allow(clippy::cast_possible_truncation)]
        let backend_ms = backend_started.elapsed().as_millis() as u64;

        let grpc_outcome = match call_result {
            Ok(outcome) => {
                if outcome.http_status >= 500 {
                    breaker.record_failure().await;
                } else {
                    breaker.record_success().await;
                }
                outcome
            }
            Err(denial) => {
                // The upstream was never contacted; the credit goes back.
                self.refund_if_charged(&grant, ticket.as_ref()).await;
                return Ok(normalize::error_response(
                    &self.config,
                    protocol,
                    Some(&api),
                    request,
                    &denial,
                ));
            }
        };

        let retry_count = grpc_outcome.attempts.saturating_sub(1);

        if grpc_outcome.code == GrpcCode::Ok {
            let body = grpc_outcome
                .payload
                .unwrap_or_else(|| json!({}))
                .to_string();
            self.record_bandwidth(&grant, request, body.len()).await;

            let synthetic = UpstreamResponse {
                status: 200,
                headers: HeaderMap::new(),
                body: Bytes::from(body),
                attempts: grpc_outcome.attempts,
            };
            let mut response = normalize::success_response(
                &self.config,
                &api,
                request,
                &synthetic,
                backend_ms,
            );
            if !self.config.strict_envelope {
                response.push_header("Content-Type", "application/json");
            }
            response.push_header("X-GRPC-Status", GrpcCode::Ok.name());
            response.push_header("X-GRPC-Code", GrpcCode::Ok.as_i32().to_string());
            Ok(response)
        } else {
            let code = if grpc_outcome.code == GrpcCode::DeadlineExceeded {
                ErrorCode::UpstreamTimeout
            } else {
                ErrorCode::UpstreamError
            };
            let denial = Denial::with_status(
                code,
                grpc_outcome.http_status,
                format!(
                    "gRPC call failed with {}: {}",
                    grpc_outcome.code, grpc_outcome.message
                ),
            );
            let mut response =
                normalize::error_response(&self.config, protocol, Some(&api), request, &denial);
            response.push_header("X-GRPC-Status", grpc_outcome.code.name());
            response.push_header("X-GRPC-Code", grpc_outcome.code.as_i32().to_string());
            if retry_count > 0 {
                response.push_header("X-Retry-Count", retry_count.to_string());
            }
            Ok(response)
        }
    }
}

// -- Free helpers ---------------------------------------------------------

fn is_version(segment: &str) -> bool {
    segment
        .strip_prefix('v')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Compile an endpoint composite template into an anchored regex:
/// literal text is escaped, each `{placeholder}` matches one non-`/` run.
fn template_regex(template: &str) -> Option<Regex> {
    let mut pattern = String::from("^");
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close_rel) = rest[open..].find('}') else {
            // Unbalanced brace: treat the remainder as literal.
            pattern.push_str(&regex::escape(rest));
            rest = "";
            break;
        };
        pattern.push_str(&regex::escape(&rest[..open]));
        pattern.push_str("([^/]+)");
        rest = &rest[open + close_rel + 1..];
    }
    pattern.push_str(&regex::escape(rest));
    pattern.push('$');
    Regex::new(&pattern).ok()
}

/// Find the first registered composite matching `"{METHOD}{uri}"`.
fn find_matching_template<'a>(
    composites: &'a [String],
    method: &str,
    uri: &str,
) -> Option<&'a String> {
    let candidate = format!("{method}{uri}");
    composites.iter().find(|template| {
        template_regex(template).is_some_and(|regex| regex.is_match(&candidate))
    })
}

/// Pull the opaque credential off the request: the swap header when the API
/// configures one, else `Authorization` (with any `Bearer ` prefix
/// stripped), else the auth cookie.
fn extract_credential(api: &Api, request: &GatewayRequest) -> Option<String> {
    if let Some(swap) = api.authorization_field_swap.as_deref()
        && let Some(value) = request.header(swap)
    {
        return Some(strip_bearer(value).to_owned());
    }
    if let Some(value) = request.header("authorization") {
        return Some(strip_bearer(value).to_owned());
    }
    // Cookie fallback for browser clients.
    request.header("cookie").and_then(|cookies| {
        cookies.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == "access_token_cookie").then(|| value.to_owned())
        })
    })
}

fn strip_bearer(value: &str) -> &str {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim()
}

fn parse_json_body(body: &Bytes) -> Result<serde_json::Value, Denial> {
    if body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|_| Denial::new(ErrorCode::ValidationFailed, "Invalid JSON in request body"))
}

fn soap_content_type_ok(request: &GatewayRequest) -> bool {
    let Some(content_type) = request.header("content-type") else {
        return false;
    };
    let base = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(
        base.as_str(),
        "text/xml" | "application/xml" | "application/soap+xml"
    )
}

/// Copy request headers for the upstream call: hop-by-hop headers dropped,
/// the authorization swap applied, and the credit key header injected.
fn build_upstream_headers(
    api: &Api,
    request: &GatewayRequest,
    ticket: Option<&CreditTicket>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        let lower = name.as_str().to_ascii_lowercase();
        if SKIP_FORWARD.contains(&lower.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(swap) = api.authorization_field_swap.as_deref()
        && let Some(value) = request.headers.get(swap).cloned()
    {
        let lower = swap.to_ascii_lowercase();
        if let Ok(name) = http::HeaderName::try_from(lower) {
            headers.remove(&name);
        }
        headers.insert(http::header::AUTHORIZATION, value);
    }

    if let Some(ticket) = ticket
        && let Ok(name) = http::HeaderName::try_from(ticket.key_header.to_ascii_lowercase())
        && let Ok(value) = http::HeaderValue::try_from(ticket.header_value.as_str())
    {
        headers.insert(name, value);
    }

    headers
}
