use std::collections::BTreeSet;

use bytes::Bytes;
use http::HeaderMap;
use serde_json::json;

use gatehouse_core::{Api, ApiType, ErrorBody};

use crate::config::GatewayConfig;
use crate::context::{GatewayRequest, GatewayResponse};
use crate::error::Denial;
use crate::upstream::UpstreamResponse;

/// Headers never forwarded from the upstream, regardless of allowlist.
const HOP_BY_HOP: [&str; 6] = [
    "connection",
    "content-length",
    "keep-alive",
    "proxy-authenticate",
    "transfer-encoding",
    "upgrade",
];

/// Filter upstream response headers through the API's allowlist
/// (case-insensitive; stored lowercased).
#[must_use]
pub fn filter_headers(
    upstream: &HeaderMap,
    allowed: &BTreeSet<String>,
) -> Vec<(String, String)> {
    let mut filtered = Vec::new();
    for (name, value) in upstream {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        if !allowed.contains(&lower) {
            continue;
        }
        if let Ok(text) = value.to_str() {
            filtered.push((lower, text.to_owned()));
        }
    }
    filtered
}

/// Compute the per-API CORS headers for a request origin.
///
/// Without a configured origin list the origin is echoed unless strict mode
/// is on; with one, only allowlisted origins receive CORS headers. `Vary:
/// Origin` accompanies every `Access-Control-Allow-Origin`.
#[must_use]
pub fn cors_headers(
    api: &Api,
    origin: Option<&str>,
    request_headers: Option<&str>,
    strict: bool,
) -> Vec<(String, String)> {
    let Some(origin) = origin.filter(|o| !o.is_empty()) else {
        return Vec::new();
    };

    let allowed = if api.cors.origins.is_empty() {
        !strict
    } else {
        api.cors.allows_origin(origin)
    };
    if !allowed {
        return Vec::new();
    }

    let mut headers = vec![
        ("Access-Control-Allow-Origin".to_owned(), origin.to_owned()),
        ("Vary".to_owned(), "Origin".to_owned()),
    ];

    let methods = if api.cors.methods.is_empty() {
        "GET, POST, PUT, PATCH, DELETE, OPTIONS".to_owned()
    } else {
        api.cors.methods.join(", ")
    };
    headers.push(("Access-Control-Allow-Methods".to_owned(), methods));

    let allow_headers = if api.cors.headers.is_empty() {
        request_headers.unwrap_or("*").to_owned()
    } else {
        api.cors.headers.join(", ")
    };
    headers.push(("Access-Control-Allow-Headers".to_owned(), allow_headers));

    if api.cors.credentials {
        headers.push((
            "Access-Control-Allow-Credentials".to_owned(),
            "true".to_owned(),
        ));
    }
    if !api.cors.expose.is_empty() {
        headers.push((
            "Access-Control-Expose-Headers".to_owned(),
            api.cors.expose.join(", "),
        ));
    }
    if let Some(max_age) = api.cors.max_age {
        headers.push(("Access-Control-Max-Age".to_owned(), max_age.to_string()));
    }

    headers
}

/// Security headers applied to every response per configuration.
fn security_headers(config: &GatewayConfig, response: &mut GatewayResponse) {
    if config.https_only {
        response.push_header(
            "Strict-Transport-Security",
            "max-age=31536000; includeSubDomains",
        );
    }
    if !config.content_security_policy.is_empty() {
        response.push_header(
            "Content-Security-Policy",
            config.content_security_policy.clone(),
        );
    }
}

fn request_id_headers(response: &mut GatewayResponse, request_id: &str) {
    response.push_header("X-Request-ID", request_id);
    response.push_header("request_id", request_id);
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn elapsed_ms(since_epoch_ms: f64) -> u64 {
    #[allow(clippy::cast_precision_loss)]
    let now_ms = chrono::Utc::now().timestamp_micros() as f64 / 1_000.0;
    (now_ms - since_epoch_ms).max(0.0) as u64
}

/// Build the caller-facing success response from an upstream reply.
#[allow(clippy::cast_precision_loss)]
pub fn success_response(
    config: &GatewayConfig,
    api: &Api,
    request: &GatewayRequest,
    upstream: &UpstreamResponse,
    backend_ms: u64,
) -> GatewayResponse {
    let filtered = filter_headers(&upstream.headers, &api.allowed_headers);

    let (body, content_type) = if config.strict_envelope {
        let payload: serde_json::Value = serde_json::from_slice(&upstream.body)
            .unwrap_or_else(|_| json!(String::from_utf8_lossy(&upstream.body)));
        let headers_map: serde_json::Map<String, serde_json::Value> = filtered
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .chain(std::iter::once((
                "request_id".to_owned(),
                json!(request.request_id),
            )))
            .collect();
        let envelope = json!({
            "status_code": upstream.status,
            "response_headers": headers_map,
            "response": payload,
        });
        (
            Bytes::from(envelope.to_string()),
            Some("application/json".to_owned()),
        )
    } else {
        let content_type = upstream
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        (upstream.body.clone(), content_type)
    };

    let mut response = GatewayResponse::new(upstream.status, body);
    for (name, value) in filtered {
        response.push_header(name, value);
    }
    if let Some(ct) = content_type {
        response.push_header("Content-Type", ct);
    }

    request_id_headers(&mut response, &request.request_id);
    response.push_header("X-Gateway-Time", elapsed_ms(request.received_at_ms).to_string());
    response.push_header("X-Backend-Time", backend_ms.to_string());
    if upstream.retry_count() > 0 {
        response.push_header("X-Retry-Count", upstream.retry_count().to_string());
    }

    let origin = request.header("origin");
    let acrh = request.header("access-control-request-headers");
    for (name, value) in cors_headers(api, origin, acrh, config.cors_strict) {
        response.push_header(name, value);
    }

    security_headers(config, &mut response);
    response
}

/// Build a caller-facing error response for a denial.
///
/// JSON everywhere except the SOAP adapter, which gets a fault envelope.
pub fn error_response(
    config: &GatewayConfig,
    protocol: ApiType,
    api: Option<&Api>,
    request: &GatewayRequest,
    denial: &Denial,
) -> GatewayResponse {
    let error = ErrorBody::new(denial.code, denial.message.clone(), request.request_id.clone());

    let (body, content_type) = if protocol == ApiType::Soap {
        let fault = format!(
            "<?xml version=\"1.0\"?>\
             <soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
             <soap:Body><soap:Fault>\
             <faultcode>{}</faultcode>\
             <faultstring>{}</faultstring>\
             <detail><request_id>{}</request_id></detail>\
             </soap:Fault></soap:Body></soap:Envelope>",
            error.error_code,
            xml_escape(&error.error_message),
            error.request_id,
        );
        (Bytes::from(fault), "text/xml; charset=utf-8")
    } else if config.strict_envelope {
        let envelope = json!({
            "status_code": denial.status,
            "response_headers": { "request_id": request.request_id },
            "error_code": error.error_code,
            "error_message": error.error_message,
        });
        (Bytes::from(envelope.to_string()), "application/json")
    } else {
        (
            Bytes::from(serde_json::to_vec(&error).unwrap_or_default()),
            "application/json",
        )
    };

    let mut response = GatewayResponse::new(denial.status, body);
    response.push_header("Content-Type", content_type);
    request_id_headers(&mut response, &request.request_id);
    response.push_header("X-Gateway-Time", elapsed_ms(request.received_at_ms).to_string());

    if let Some(api) = api {
        let origin = request.header("origin");
        let acrh = request.header("access-control-request-headers");
        for (name, value) in cors_headers(api, origin, acrh, config.cors_strict) {
            response.push_header(name, value);
        }
    }

    security_headers(config, &mut response);
    response
}

/// Build a CORS preflight response for an API.
pub fn preflight_response(
    config: &GatewayConfig,
    api: &Api,
    request: &GatewayRequest,
) -> GatewayResponse {
    let mut response = GatewayResponse::new(204, Bytes::new());
    let origin = request.header("origin");
    let acrh = request.header("access-control-request-headers");
    for (name, value) in cors_headers(api, origin, acrh, config.cors_strict) {
        response.push_header(name, value);
    }
    request_id_headers(&mut response, &request.request_id);
    security_headers(config, &mut response);
    response
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
