use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gatehouse_gateway::{GatewayBuilder, GatewayConfig};
use gatehouse_metadata::{MemoryMetadataStore, MetadataSeed, MetadataStore};
use gatehouse_server::api::{AppState, router};
use gatehouse_server::auth::TokenPrincipalResolver;
use gatehouse_server::config::TokenEntry;
use gatehouse_state_memory::{MemoryDistributedLock, MemoryStateStore};

// -- Helpers --------------------------------------------------------------

fn build_app(seed: serde_json::Value, tokens: &[(&str, &str)], config: GatewayConfig) -> Router {
    let seed = MetadataSeed::from_json(&seed.to_string()).expect("seed should parse");
    let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::from_seed(seed));
    let store = Arc::new(MemoryStateStore::new());
    let lock = Arc::new(MemoryDistributedLock::new());

    let entries: Vec<TokenEntry> = tokens
        .iter()
        .map(|(token, username)| TokenEntry {
            token: (*token).to_owned(),
            username: (*username).to_owned(),
        })
        .collect();
    let resolver = Arc::new(TokenPrincipalResolver::new(
        &entries,
        Arc::clone(&metadata),
        store.clone(),
        Duration::from_secs(60),
    ));

    let gateway = Arc::new(
        GatewayBuilder::new()
            .config(config)
            .state(store)
            .lock(lock)
            .metadata(metadata)
            .resolver(resolver.clone())
            .build()
            .expect("gateway should build"),
    );

    router(AppState {
        gateway,
        resolver,
        started_at: chrono::Utc::now(),
        state_backend: "memory".into(),
    })
}

fn public_rest_seed(upstream: &str) -> serde_json::Value {
    serde_json::json!({
        "apis": [{
            "api_id": "a1", "name": "demo", "version": "v1", "api_type": "REST",
            "public": true, "servers": [upstream],
        }],
        "endpoints": [
            {"endpoint_id": "e1", "api_id": "a1", "method": "GET", "uri": "/p"}
        ],
    })
}

fn protected_rest_seed(upstream: &str, api_extra: serde_json::Value) -> serde_json::Value {
    let mut api = serde_json::json!({
        "api_id": "a1", "name": "demo", "version": "v1", "api_type": "REST",
        "servers": [upstream],
    });
    api.as_object_mut()
        .unwrap()
        .extend(api_extra.as_object().unwrap().clone());
    serde_json::json!({
        "apis": [api],
        "endpoints": [
            {"endpoint_id": "e1", "api_id": "a1", "method": "GET", "uri": "/p"}
        ],
        "users": [{
            "username": "alice", "email": "alice@example.com",
            "role": "developer", "groups": ["dev"],
        }],
        "subscriptions": [{"username": "alice", "apis": ["demo/v1"]}],
    })
}

async fn get(app: &Router, uri: &str, headers: &[(&str, &str)]) -> (StatusCode, serde_json::Value, axum::http::HeaderMap) {
    send(app, "GET", uri, headers, Body::empty()).await
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Body,
) -> (StatusCode, serde_json::Value, axum::http::HeaderMap) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let response_headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| serde_json::json!(String::from_utf8_lossy(&bytes)));
    (status, json, response_headers)
}

// -- Scenario: public REST happy path -------------------------------------

#[tokio::test]
async fn public_rest_happy_path() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&upstream)
        .await;

    let app = build_app(public_rest_seed(&upstream.uri()), &[], GatewayConfig::default());
    let (status, body, headers) = get(&app, "/api/rest/demo/v1/p", &[]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert!(!headers.get("x-request-id").unwrap().is_empty());
    assert!(headers.get("x-gateway-time").is_some());
}

#[tokio::test]
async fn request_id_is_echoed() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&upstream)
        .await;

    let app = build_app(public_rest_seed(&upstream.uri()), &[], GatewayConfig::default());
    let (_, _, headers) = get(&app, "/api/rest/demo/v1/p", &[("X-Request-ID", "req-7")]).await;
    assert_eq!(headers.get("x-request-id").unwrap(), "req-7");
}

// -- Scenario: resolution failures -----------------------------------------

#[tokio::test]
async fn unknown_api_is_gtw001() {
    let app = build_app(serde_json::json!({}), &[], GatewayConfig::default());
    let (status, body, _) = get(&app, "/api/rest/nope/v1/p", &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "GTW001");
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn unregistered_endpoint_is_gtw003() {
    let upstream = MockServer::start().await;
    let app = build_app(public_rest_seed(&upstream.uri()), &[], GatewayConfig::default());
    let (status, body, _) = get(&app, "/api/rest/demo/v1/other", &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "GTW003");
}

#[tokio::test]
async fn disabled_api_is_gtw012() {
    let upstream = MockServer::start().await;
    let mut seed = public_rest_seed(&upstream.uri());
    seed["apis"][0]["active"] = serde_json::json!(false);
    let app = build_app(seed, &[], GatewayConfig::default());

    let (status, body, _) = get(&app, "/api/rest/demo/v1/p", &[]).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "GTW012");
}

#[tokio::test]
async fn head_matches_get_endpoints() {
    let upstream = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/p"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let app = build_app(public_rest_seed(&upstream.uri()), &[], GatewayConfig::default());
    let (status, _, _) = send(&app, "HEAD", "/api/rest/demo/v1/p", &[], Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
}

// -- Scenario: admission ----------------------------------------------------

#[tokio::test]
async fn protected_api_requires_credential() {
    let upstream = MockServer::start().await;
    let app = build_app(
        protected_rest_seed(&upstream.uri(), serde_json::json!({})),
        &[("tok-alice", "alice")],
        GatewayConfig::default(),
    );

    let (status, body, _) = get(&app, "/api/rest/demo/v1/p", &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "AUTH401");
}

#[tokio::test]
async fn subscription_required_is_403() {
    let upstream = MockServer::start().await;
    let mut seed = protected_rest_seed(&upstream.uri(), serde_json::json!({}));
    seed["subscriptions"] = serde_json::json!([]);
    let app = build_app(seed, &[("tok-alice", "alice")], GatewayConfig::default());

    let (status, body, _) = get(
        &app,
        "/api/rest/demo/v1/p",
        &[("Authorization", "Bearer tok-alice")],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "SUB_REQ");
}

#[tokio::test]
async fn role_allowlist_is_enforced() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&upstream)
        .await;

    let app = build_app(
        protected_rest_seed(&upstream.uri(), serde_json::json!({"allowed_roles": ["admin"]})),
        &[("tok-alice", "alice")],
        GatewayConfig::default(),
    );
    let (status, body, _) = get(
        &app,
        "/api/rest/demo/v1/p",
        &[("Authorization", "Bearer tok-alice")],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "GTW014");
}

// -- Scenario: rate limit ---------------------------------------------------

#[tokio::test]
async fn rate_limit_second_call_within_window_is_429() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&upstream)
        .await;

    let mut seed = protected_rest_seed(&upstream.uri(), serde_json::json!({}));
    seed["users"][0]["rate_limit"] = serde_json::json!({"count": 1, "window": "second"});
    let app = build_app(seed, &[("tok-alice", "alice")], GatewayConfig::default());
    let auth = [("Authorization", "Bearer tok-alice")];

    let (first, _, _) = get(&app, "/api/rest/demo/v1/p", &auth).await;
    assert_eq!(first, StatusCode::OK);

    let (second, body, _) = get(&app, "/api/rest/demo/v1/p", &auth).await;
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error_code"], "RL429");

    // The next window admits again.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let (third, _, _) = get(&app, "/api/rest/demo/v1/p", &auth).await;
    assert_eq!(third, StatusCode::OK);
}

// -- Scenario: credits ------------------------------------------------------

fn credits_seed(upstream: &str) -> serde_json::Value {
    serde_json::json!({
        "apis": [{
            "api_id": "a1", "name": "cr", "version": "v1", "api_type": "REST",
            "servers": [upstream], "credits_enabled": true, "credit_group": "g",
        }],
        "endpoints": [
            {"endpoint_id": "e1", "api_id": "a1", "method": "GET", "uri": "/p"}
        ],
        "users": [{
            "username": "alice", "email": "alice@example.com", "role": "developer",
        }],
        "subscriptions": [{"username": "alice", "apis": ["cr/v1"]}],
        "credit_defs": [{"group": "g", "key_header": "x-api-key", "key_value": "shared"}],
        "user_credits": [{
            "username": "alice",
            "credits": {"g": {"tier_name": "basic", "available_credits": 1}}
        }],
    })
}

#[tokio::test]
async fn credit_exhaustion_returns_gtw008() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("x-api-key", "shared"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&upstream)
        .await;

    let app = build_app(
        credits_seed(&upstream.uri()),
        &[("tok-alice", "alice")],
        GatewayConfig::default(),
    );
    let auth = [("Authorization", "Bearer tok-alice")];

    let (first, _, _) = get(&app, "/api/rest/cr/v1/p", &auth).await;
    assert_eq!(first, StatusCode::OK);

    let (second, body, _) = get(&app, "/api/rest/cr/v1/p", &auth).await;
    assert_eq!(second, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "GTW008");
}

// -- Scenario: retries ------------------------------------------------------

#[tokio::test]
async fn retry_then_success_emits_retry_count() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/p"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut seed = public_rest_seed(&upstream.uri());
    seed["apis"][0]["retry_count"] = serde_json::json!(1);
    let app = build_app(seed, &[], GatewayConfig::default());

    let (status, body, headers) = get(&app, "/api/rest/demo/v1/p", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(headers.get("x-retry-count").unwrap(), "1");
}

#[tokio::test]
async fn retries_exhausted_return_upstream_status() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&upstream)
        .await;

    let mut seed = public_rest_seed(&upstream.uri());
    seed["apis"][0]["retry_count"] = serde_json::json!(1);
    let app = build_app(seed, &[], GatewayConfig::default());

    let (status, _, _) = get(&app, "/api/rest/demo/v1/p", &[]).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

// -- Scenario: circuit breaker ----------------------------------------------

#[tokio::test]
async fn circuit_opens_after_consecutive_failures() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&upstream)
        .await;

    let app = build_app(public_rest_seed(&upstream.uri()), &[], GatewayConfig::default());

    for _ in 0..5 {
        let (status, _, _) = get(&app, "/api/rest/demo/v1/p", &[]).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    // The sixth call fails fast without touching the upstream; the mock's
    // expect(5) verifies no sixth request arrived.
    let (status, body, _) = get(&app, "/api/rest/demo/v1/p", &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_code"], "GTW999");
}

// -- Scenario: header allowlist ----------------------------------------------

#[tokio::test]
async fn allowed_headers_filter_upstream_headers() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({}))
                .insert_header("X-Keep", "kept")
                .insert_header("X-Secret", "leaky"),
        )
        .mount(&upstream)
        .await;

    let mut seed = public_rest_seed(&upstream.uri());
    seed["apis"][0]["allowed_headers"] = serde_json::json!(["X-Keep"]);
    let app = build_app(seed, &[], GatewayConfig::default());

    let (_, _, headers) = get(&app, "/api/rest/demo/v1/p", &[]).await;
    assert_eq!(headers.get("x-keep").unwrap(), "kept");
    assert!(headers.get("x-secret").is_none());
}

// -- Scenario: body size limit ------------------------------------------------

#[tokio::test]
async fn oversized_body_is_req001() {
    let app = build_app(
        serde_json::json!({}),
        &[],
        GatewayConfig {
            max_body_size: 16,
            ..GatewayConfig::default()
        },
    );

    let (status, body, _) = send(
        &app,
        "POST",
        "/api/rest/demo/v1/p",
        &[],
        Body::from(vec![b'x'; 17]),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error_code"], "REQ001");

    // Exactly at the limit the request passes the size gate (and then fails
    // resolution, proving the gate did not fire).
    let (status, body, _) = send(
        &app,
        "POST",
        "/api/rest/demo/v1/p",
        &[],
        Body::from(vec![b'x'; 16]),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "GTW001");
}

// -- Scenario: validation -----------------------------------------------------

#[tokio::test]
async fn enabled_schema_rejects_bad_payloads() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&upstream)
        .await;

    let mut seed = public_rest_seed(&upstream.uri());
    seed["endpoints"] = serde_json::json!([
        {"endpoint_id": "e1", "api_id": "a1", "method": "POST", "uri": "/p"}
    ]);
    seed["validations"] = serde_json::json!([{
        "endpoint_id": "e1",
        "enabled": true,
        "schema": {"name": {"required": true, "field_type": "string"}}
    }]);
    let app = build_app(seed, &[], GatewayConfig::default());

    let (status, body, _) = send(
        &app,
        "POST",
        "/api/rest/demo/v1/p",
        &[("content-type", "application/json")],
        Body::from(r#"{"name": "ada"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body, _) = send(
        &app,
        "POST",
        "/api/rest/demo/v1/p",
        &[("content-type", "application/json")],
        Body::from(r"{}"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "GTW011");
}

// -- Scenario: GraphQL ---------------------------------------------------------

#[tokio::test]
async fn graphql_requires_version_header() {
    let app = build_app(serde_json::json!({}), &[], GatewayConfig::default());
    let (status, body, _) = send(
        &app,
        "POST",
        "/api/graphql/demo",
        &[],
        Body::from(r#"{"query": "{ hello }"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "GTW011");
}

#[tokio::test]
async fn graphql_proxies_with_version_header() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": {"hello": "hi"}})),
        )
        .mount(&upstream)
        .await;

    let seed = serde_json::json!({
        "apis": [{
            "api_id": "g1", "name": "graph", "version": "v1", "api_type": "GRAPHQL",
            "public": true, "servers": [upstream.uri()],
        }],
    });
    let app = build_app(seed, &[], GatewayConfig::default());

    let (status, body, _) = send(
        &app,
        "POST",
        "/api/graphql/graph",
        &[("X-API-Version", "v1"), ("content-type", "application/json")],
        Body::from(r#"{"query": "{ hello }"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["hello"], "hi");
}

// -- Scenario: SOAP -------------------------------------------------------------

#[tokio::test]
async fn soap_rejects_unknown_content_type() {
    let app = build_app(serde_json::json!({}), &[], GatewayConfig::default());
    let (status, _, _) = send(
        &app,
        "POST",
        "/api/soap/demo/v1/p",
        &[("content-type", "application/json")],
        Body::from("{}"),
    )
    .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn soap_proxies_xml_and_faults_in_xml() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<ok/>"))
        .mount(&upstream)
        .await;

    let seed = serde_json::json!({
        "apis": [{
            "api_id": "s1", "name": "soapy", "version": "v1", "api_type": "SOAP",
            "public": true, "servers": [upstream.uri()],
        }],
        "endpoints": [
            {"endpoint_id": "e1", "api_id": "s1", "method": "POST", "uri": "/p"}
        ],
    });
    let app = build_app(seed, &[], GatewayConfig::default());

    let envelope = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
        <soap:Body><Ping/></soap:Body></soap:Envelope>"#;
    let (status, _, _) = send(
        &app,
        "POST",
        "/api/soap/soapy/v1/p",
        &[("content-type", "text/xml")],
        Body::from(envelope),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Unknown endpoint produces a SOAP fault, not JSON.
    let (status, body, _) = send(
        &app,
        "POST",
        "/api/soap/soapy/v1/missing",
        &[("content-type", "text/xml")],
        Body::from(envelope),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let text = body.as_str().unwrap_or_default().to_owned();
    assert!(text.contains("<soap:Fault>"), "{text}");
    assert!(text.contains("GTW003"));
}

// -- Scenario: gRPC allowlist ----------------------------------------------------

#[tokio::test]
async fn grpc_allowlist_violation_is_gtw013() {
    let seed = serde_json::json!({
        "apis": [{
            "api_id": "r1", "name": "rpc", "version": "v1", "api_type": "GRPC",
            "public": true, "servers": ["grpc://127.0.0.1:50051"],
            "grpc": {"allowed_services": ["Greeter"]},
        }],
    });
    let app = build_app(seed, &[], GatewayConfig::default());

    let (status, body, _) = send(
        &app,
        "POST",
        "/api/grpc/rpc",
        &[("content-type", "application/json")],
        Body::from(r#"{"method": "Admin.DeleteAll", "message": {}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "GTW013");
}

#[tokio::test]
async fn grpc_malformed_method_is_gtw011() {
    let seed = serde_json::json!({
        "apis": [{
            "api_id": "r1", "name": "rpc", "version": "v1", "api_type": "GRPC",
            "public": true, "servers": ["grpc://127.0.0.1:50051"],
        }],
    });
    let app = build_app(seed, &[], GatewayConfig::default());

    let (status, body, _) = send(
        &app,
        "POST",
        "/api/grpc/rpc",
        &[("content-type", "application/json")],
        Body::from(r#"{"method": "NoDotHere", "message": {}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "GTW011");
}

// -- Scenario: strict envelope -----------------------------------------------------

#[tokio::test]
async fn strict_envelope_wraps_success() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&upstream)
        .await;

    let app = build_app(
        public_rest_seed(&upstream.uri()),
        &[],
        GatewayConfig {
            strict_envelope: true,
            ..GatewayConfig::default()
        },
    );

    let (status, body, _) = get(&app, "/api/rest/demo/v1/p", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 200);
    assert_eq!(body["response"]["ok"], true);
    assert!(body["response_headers"]["request_id"].is_string());
}

// -- Admin surface -------------------------------------------------------------------

fn admin_seed(upstream: &str) -> serde_json::Value {
    let mut seed = public_rest_seed(upstream);
    seed["users"] = serde_json::json!([{
        "username": "root", "email": "root@example.com", "role": "platform",
    }]);
    seed["roles"] = serde_json::json!([
        {"name": "platform", "permissions": ["manage_gateway"]},
        {"name": "developer", "permissions": []},
    ]);
    seed
}

#[tokio::test]
async fn health_is_public() {
    let app = build_app(serde_json::json!({}), &[], GatewayConfig::default());
    let (status, body, _) = get(&app, "/api/health", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn cache_clear_requires_manage_gateway() {
    let upstream = MockServer::start().await;
    let app = build_app(
        admin_seed(&upstream.uri()),
        &[("tok-root", "root")],
        GatewayConfig::default(),
    );

    let (status, body, _) = send(&app, "DELETE", "/api/caches", &[], Body::empty()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "AUTH401");

    // Duplicate clears succeed identically.
    for _ in 0..2 {
        let (status, body, _) = send(
            &app,
            "DELETE",
            "/api/caches",
            &[("Authorization", "Bearer tok-root")],
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "All caches cleared");
    }
}

#[tokio::test]
async fn status_reports_metrics_for_admins() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&upstream)
        .await;

    let app = build_app(
        admin_seed(&upstream.uri()),
        &[("tok-root", "root")],
        GatewayConfig::default(),
    );

    get(&app, "/api/rest/demo/v1/p", &[]).await;

    let (status, body, _) = get(
        &app,
        "/api/status",
        &[("Authorization", "Bearer tok-root")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state_backend"], "memory");
    assert!(body["metrics"]["requests"].as_u64().unwrap() >= 1);
}

// -- Routing --------------------------------------------------------------------------

#[tokio::test]
async fn client_key_overrides_upstream() {
    let shared = MockServer::start().await;
    let dedicated = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"pool": "shared"})))
        .mount(&shared)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"pool": "dedicated"})),
        )
        .mount(&dedicated)
        .await;

    let mut seed = public_rest_seed(&shared.uri());
    seed["routings"] =
        serde_json::json!([{"client_key": "tenant-7", "servers": [dedicated.uri()]}]);
    let app = build_app(seed, &[], GatewayConfig::default());

    let (_, body, _) = get(&app, "/api/rest/demo/v1/p", &[]).await;
    assert_eq!(body["pool"], "shared");

    let (_, body, _) = get(&app, "/api/rest/demo/v1/p", &[("client-key", "tenant-7")]).await;
    assert_eq!(body["pool"], "dedicated");
}

#[tokio::test]
async fn version_header_resolves_unversioned_paths() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": 1})))
        .mount(&upstream)
        .await;

    let app = build_app(public_rest_seed(&upstream.uri()), &[], GatewayConfig::default());
    let (status, _, _) = get(&app, "/api/rest/demo/p", &[("X-API-Version", "v1")]).await;
    assert_eq!(status, StatusCode::OK);
}
