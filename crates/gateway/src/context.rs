use std::net::IpAddr;

use bytes::Bytes;
use http::HeaderMap;
use uuid::Uuid;

/// An inbound request as seen by the pipeline, protocol prefix already
/// stripped by the HTTP layer.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// HTTP method, uppercased.
    pub method: String,
    /// Path below the protocol prefix, always starting with `/`
    /// (e.g. `/orders/v1/items/42`).
    pub path: String,
    pub headers: HeaderMap,
    /// Raw query string, forwarded verbatim to the upstream.
    pub raw_query: Option<String>,
    /// Fully-read request body, size-capped by the HTTP layer.
    pub body: Bytes,
    pub remote_ip: IpAddr,
    /// Echoed from `X-Request-ID` or freshly minted.
    pub request_id: String,
    /// Wall-clock receive time in epoch milliseconds, for timing headers.
    pub received_at_ms: f64,
}

impl GatewayRequest {
    /// Create a request, minting a request id when the caller supplied none.
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
        remote_ip: IpAddr,
    ) -> Self {
        let request_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map_or_else(|| Uuid::new_v4().to_string(), ToOwned::to_owned);

        #[allow(clippy::cast_precision_loss)]
        let received_at_ms = chrono::Utc::now().timestamp_micros() as f64 / 1_000.0;

        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            headers,
            raw_query: None,
            body,
            remote_ip,
            request_id,
            received_at_ms,
        }
    }

    /// Attach the raw query string.
    #[must_use]
    pub fn with_raw_query(mut self, raw_query: Option<String>) -> Self {
        self.raw_query = raw_query.filter(|q| !q.is_empty());
        self
    }

    /// Fetch a header value as a string, `None` when missing or non-UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Path segments with empty entries removed.
    #[must_use]
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }
}

/// The pipeline's final output, ready for the HTTP layer to write.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    /// Outgoing headers in emission order.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl GatewayResponse {
    /// Create a response with no headers.
    #[must_use]
    pub fn new(status: u16, body: Bytes) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    /// Append a header.
    pub fn push_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }
}
