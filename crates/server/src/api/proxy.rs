use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use gatehouse_core::{ApiType, ErrorBody, ErrorCode};
use gatehouse_gateway::{GatewayRequest, GatewayResponse};

use super::AppState;

/// `{METHOD} /api/rest/{name}/{vN}/{...}` — REST proxy.
pub async fn rest(State(state): State<AppState>, request: Request) -> Response {
    dispatch(state, ApiType::Rest, "/api/rest", request).await
}

/// `POST /api/soap/{name}/{vN}/{...}` — SOAP proxy.
pub async fn soap(State(state): State<AppState>, request: Request) -> Response {
    dispatch(state, ApiType::Soap, "/api/soap", request).await
}

/// `POST /api/graphql/{name}` — GraphQL proxy (`X-API-Version` required).
pub async fn graphql(State(state): State<AppState>, request: Request) -> Response {
    dispatch(state, ApiType::Graphql, "/api/graphql", request).await
}

/// `POST /api/grpc/{name}` — gRPC proxy.
pub async fn grpc(State(state): State<AppState>, request: Request) -> Response {
    dispatch(state, ApiType::Grpc, "/api/grpc", request).await
}

async fn dispatch(
    state: AppState,
    protocol: ApiType,
    prefix: &str,
    request: Request,
) -> Response {
    let max_body = state.gateway.config().max_body_size;
    let gateway_request = match into_gateway_request(prefix, request, max_body).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    into_response(state.gateway.dispatch(protocol, gateway_request).await)
}

/// Convert an inbound Axum request into the pipeline's representation,
/// enforcing the global body size limit before anything else runs.
async fn into_gateway_request(
    prefix: &str,
    request: Request,
    max_body: usize,
) -> Result<GatewayRequest, Response> {
    let method = request.method().as_str().to_owned();
    let uri = request.uri().clone();
    let path = uri
        .path()
        .strip_prefix(prefix)
        .filter(|p| !p.is_empty())
        .unwrap_or("/")
        .to_owned();
    let raw_query = uri.query().map(ToOwned::to_owned);
    let headers = request.headers().clone();
    let remote_ip: IpAddr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| IpAddr::from([127, 0, 0, 1]), |info| info.0.ip());

    // Declared length first, then the enforced read cap.
    let declared = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > max_body) {
        return Err(body_too_large(&headers));
    }

    let body = axum::body::to_bytes(request.into_body(), max_body)
        .await
        .map_err(|_| body_too_large(&headers))?;

    Ok(GatewayRequest::new(method, path, headers, body, remote_ip).with_raw_query(raw_query))
}

/// `REQ001 413`, emitted before any admission or credit work.
fn body_too_large(headers: &http::HeaderMap) -> Response {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), ToOwned::to_owned);
    let body = ErrorBody::new(
        ErrorCode::BodyTooLarge,
        "Request body exceeds the size limit",
        request_id,
    );
    (http::StatusCode::PAYLOAD_TOO_LARGE, axum::Json(body)).into_response()
}

/// Render the pipeline's response for Axum.
fn into_response(response: GatewayResponse) -> Response {
    let mut builder = http::Response::builder()
        .status(http::StatusCode::from_u16(response.status).unwrap_or(http::StatusCode::OK));

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &response.headers {
            if let (Ok(name), Ok(value)) = (
                http::HeaderName::try_from(name.as_str()),
                http::HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(name, value);
            }
        }
    }

    builder
        .body(axum::body::Body::from(response.body))
        .unwrap_or_else(|_| http::StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
