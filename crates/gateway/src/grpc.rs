use std::sync::LazyLock;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, BufMut, Bytes};
use dashmap::DashMap;
use http::HeaderMap;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::metadata::{AsciiMetadataValue, MetadataKey, MetadataMap};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Status};
use tracing::{debug, warn};

use gatehouse_core::{Api, ErrorCode, GrpcCode};

use crate::config::GatewayConfig;
use crate::error::Denial;
use crate::metrics::GatewayMetrics;

/// `Service.Method` with identifier-shaped components.
static METHOD_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\.[A-Za-z_][A-Za-z0-9_]*$").expect("static regex")
});

/// Dot-separated protobuf package name.
static PACKAGE_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("static regex")
});

/// Parsed gRPC proxy request body.
#[derive(Debug, Clone, Deserialize)]
pub struct GrpcCallSpec {
    /// `Service.Method`.
    pub method: String,
    /// Message for unary and server-streaming calls: a base64 string (raw
    /// protobuf) or a JSON object forwarded as UTF-8 JSON bytes.
    #[serde(default)]
    pub message: serde_json::Value,
    /// Overrides the API's default package.
    #[serde(default)]
    pub package: Option<String>,
    /// `server`, `client`, or `bidi`; absent means unary.
    #[serde(default)]
    pub stream: Option<String>,
    /// Messages for client-streaming and bidi calls.
    #[serde(default)]
    pub messages: Option<Vec<serde_json::Value>>,
    /// Bound on collected response items for streaming calls.
    #[serde(default)]
    pub max_items: Option<usize>,
    /// Marks client-stream/bidi calls safe to retry.
    #[serde(default)]
    pub idempotent: bool,
}

/// The four gRPC call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Unary,
    Server,
    Client,
    Bidi,
}

impl StreamMode {
    fn parse(raw: Option<&str>) -> Result<Self, Denial> {
        match raw.map(str::to_ascii_lowercase).as_deref() {
            None | Some("" | "unary") => Ok(Self::Unary),
            Some("server") => Ok(Self::Server),
            Some("client") => Ok(Self::Client),
            Some("bidi" | "bidirectional") => Ok(Self::Bidi),
            Some(other) => Err(Denial::new(
                ErrorCode::ValidationFailed,
                format!("Unknown stream mode: {other}"),
            )),
        }
    }

    /// Whether the call sends a request stream (no automatic retry).
    fn sends_stream(self) -> bool {
        matches!(self, Self::Client | Self::Bidi)
    }
}

/// Result of a gRPC upstream call, normalized for the HTTP response.
#[derive(Debug, Clone)]
pub struct GrpcOutcome {
    pub code: GrpcCode,
    pub http_status: u16,
    pub message: String,
    /// Success payload: `{"message": b64}` or `{"items": [...], "count": n}`.
    pub payload: Option<serde_json::Value>,
    pub attempts: u32,
}

/// Pass-through codec: frames carry raw bytes, no protobuf schema needed.
#[derive(Debug, Clone, Copy, Default)]
struct BytesCodec;

#[derive(Debug, Clone, Copy, Default)]
struct BytesEncoder;

#[derive(Debug, Clone, Copy, Default)]
struct BytesDecoder;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        let remaining = src.remaining();
        Ok(Some(src.copy_to_bytes(remaining)))
    }
}

/// Default item bound for streaming responses.
const DEFAULT_MAX_ITEMS: usize = 100;

/// gRPC upstream client with per-target channel reuse.
///
/// Channels connect lazily; connection failures surface as `UNAVAILABLE`
/// at call time and feed the retry loop and circuit breaker like any other
/// upstream failure.
pub struct GrpcUpstream {
    channels: DashMap<String, Channel>,
    connect_timeout: Duration,
    call_timeout: Duration,
    max_retries: u32,
    retry_base: Duration,
    retry_max: Duration,
}

impl GrpcUpstream {
    /// Build the client from gateway configuration.
    #[must_use]
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            channels: DashMap::new(),
            connect_timeout: config.http.connect_timeout,
            call_timeout: config.http.total_timeout,
            max_retries: config.grpc_max_retries,
            retry_base: config.grpc_retry_base,
            retry_max: config.grpc_retry_max,
        }
    }

    /// Validate the call spec against the API's gRPC policy and produce the
    /// fully-qualified `/package.Service/Method` path.
    pub fn authorize(api: &Api, spec: &GrpcCallSpec) -> Result<String, Denial> {
        if !METHOD_SPEC.is_match(&spec.method) {
            return Err(Denial::new(
                ErrorCode::ValidationFailed,
                "Invalid gRPC method. Use Service.Method with alphanumerics/underscore.",
            ));
        }

        let package = spec
            .package
            .as_deref()
            .or(api.grpc.package.as_deref())
            .unwrap_or_default();
        if !package.is_empty() && !PACKAGE_SPEC.is_match(package) {
            return Err(Denial::new(
                ErrorCode::ValidationFailed,
                "Invalid gRPC package. Use letters, digits, underscore only.",
            ));
        }

        let (service, method) = spec
            .method
            .split_once('.')
            .expect("method spec regex guarantees one dot");

        if let Some(allowed) = &api.grpc.allowed_packages
            && !package.is_empty()
            && !allowed.contains(package)
        {
            return Err(Denial::new(
                ErrorCode::TargetNotAllowed,
                "gRPC package not allowed",
            ));
        }
        if let Some(allowed) = &api.grpc.allowed_services
            && !allowed.contains(service)
        {
            return Err(Denial::new(
                ErrorCode::TargetNotAllowed,
                "gRPC service not allowed",
            ));
        }
        if let Some(allowed) = &api.grpc.allowed_methods
            && !allowed.contains(&spec.method)
        {
            return Err(Denial::new(
                ErrorCode::TargetNotAllowed,
                "gRPC method not allowed",
            ));
        }

        let fq_service = if package.is_empty() {
            service.to_owned()
        } else {
            format!("{package}.{service}")
        };
        Ok(format!("/{fq_service}/{method}"))
    }

    /// Encode one request message: base64 strings decode to raw protobuf,
    /// objects pass through as UTF-8 JSON bytes.
    pub fn encode_message(message: &serde_json::Value) -> Result<Bytes, Denial> {
        match message {
            serde_json::Value::String(b64) => BASE64.decode(b64).map(Bytes::from).map_err(|_| {
                Denial::new(
                    ErrorCode::ValidationFailed,
                    "message is not valid base64-encoded protobuf",
                )
            }),
            serde_json::Value::Null => Ok(Bytes::new()),
            other => serde_json::to_vec(other).map(Bytes::from).map_err(|e| {
                Denial::new(ErrorCode::ValidationFailed, format!("invalid message: {e}"))
            }),
        }
    }

    /// Lowercase metadata keys, strip disallowed characters, and drop
    /// non-ASCII values and hop-by-hop headers.
    #[must_use]
    pub fn sanitize_metadata(headers: &HeaderMap) -> MetadataMap {
        const SKIP: [&str; 6] = [
            "host",
            "content-length",
            "content-type",
            "connection",
            "te",
            "transfer-encoding",
        ];

        let mut metadata = MetadataMap::new();
        for (name, value) in headers {
            let key: String = name
                .as_str()
                .to_ascii_lowercase()
                .chars()
                .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_.-".contains(*c))
                .collect();
            if key.is_empty() || SKIP.contains(&key.as_str()) || key.starts_with("grpc-") {
                continue;
            }

            let Ok(parsed_key) = key.parse::<MetadataKey<_>>() else {
                continue;
            };
            let Ok(ascii_value) = value
                .to_str()
                .map_err(|_| ())
                .and_then(|v| AsciiMetadataValue::try_from(v).map_err(|_| ()))
            else {
                continue;
            };
            metadata.insert(parsed_key, ascii_value);
        }
        metadata
    }

    async fn channel(&self, target: &str, tls: bool) -> Result<Channel, Denial> {
        let cache_key = format!("{}://{target}", if tls { "grpcs" } else { "grpc" });
        if let Some(existing) = self.channels.get(&cache_key) {
            return Ok(existing.clone());
        }

        let uri = format!("{}://{target}", if tls { "https" } else { "http" });
        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| {
                Denial::new(ErrorCode::ValidationFailed, format!("invalid gRPC target: {e}"))
            })?
            .connect_timeout(self.connect_timeout)
            .timeout(self.call_timeout);

        if tls {
            // grpcs:// fails closed when the TLS config cannot be built.
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .map_err(|e| {
                    Denial::new(
                        ErrorCode::TargetNotAllowed,
                        format!("TLS unavailable for grpcs target: {e}"),
                    )
                })?;
        }

        let channel = endpoint.connect_lazy();
        self.channels.insert(cache_key, channel.clone());
        Ok(channel)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .retry_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.retry_max);
        // Jitter 0.5: scale by a uniform factor in [0.75, 1.25].
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        exp.mul_f64(factor)
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        channel: Channel,
        path: &str,
        mode: StreamMode,
        payload: &Bytes,
        stream_payloads: &[Bytes],
        metadata: &MetadataMap,
        max_items: usize,
    ) -> Result<GrpcOutcome, Status> {
        let path = http::uri::PathAndQuery::try_from(path.to_owned())
            .map_err(|e| Status::invalid_argument(format!("invalid path: {e}")))?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("upstream not ready: {e}")))?;

        let mut request = Request::new(());
        *request.metadata_mut() = metadata.clone();

        match mode {
            StreamMode::Unary => {
                let (meta, _, _) = request.into_parts();
                let mut req = Request::new(payload.clone());
                *req.metadata_mut() = meta;
                let response: tonic::Response<Bytes> =
                    grpc.unary(req, path, BytesCodec).await?;
                let body = response.into_inner();
                Ok(GrpcOutcome {
                    code: GrpcCode::Ok,
                    http_status: 200,
                    message: String::new(),
                    payload: Some(serde_json::json!({ "message": BASE64.encode(&body) })),
                    attempts: 1,
                })
            }
            StreamMode::Server => {
                let (meta, _, _) = request.into_parts();
                let mut req = Request::new(payload.clone());
                *req.metadata_mut() = meta;
                let response = grpc.server_streaming(req, path, BytesCodec).await?;
                let mut streaming: tonic::Streaming<Bytes> = response.into_inner();
                let mut items = Vec::new();
                while items.len() < max_items {
                    match streaming.message().await? {
                        Some(item) => items.push(BASE64.encode(&item)),
                        None => break,
                    }
                }
                let count = items.len();
                Ok(GrpcOutcome {
                    code: GrpcCode::Ok,
                    http_status: 200,
                    message: String::new(),
                    payload: Some(serde_json::json!({ "items": items, "count": count })),
                    attempts: 1,
                })
            }
            StreamMode::Client => {
                let (meta, _, _) = request.into_parts();
                let outbound = futures::stream::iter(stream_payloads.to_vec());
                let mut req = Request::new(outbound);
                *req.metadata_mut() = meta;
                let response: tonic::Response<Bytes> =
                    grpc.client_streaming(req, path, BytesCodec).await?;
                let body = response.into_inner();
                Ok(GrpcOutcome {
                    code: GrpcCode::Ok,
                    http_status: 200,
                    message: String::new(),
                    payload: Some(serde_json::json!({ "message": BASE64.encode(&body) })),
                    attempts: 1,
                })
            }
            StreamMode::Bidi => {
                let (meta, _, _) = request.into_parts();
                let outbound = futures::stream::iter(stream_payloads.to_vec());
                let mut req = Request::new(outbound);
                *req.metadata_mut() = meta;
                let response = grpc.streaming(req, path, BytesCodec).await?;
                let mut streaming: tonic::Streaming<Bytes> = response.into_inner();
                let mut items = Vec::new();
                while items.len() < max_items {
                    match streaming.message().await? {
                        Some(item) => items.push(BASE64.encode(&item)),
                        None => break,
                    }
                }
                let count = items.len();
                Ok(GrpcOutcome {
                    code: GrpcCode::Ok,
                    http_status: 200,
                    message: String::new(),
                    payload: Some(serde_json::json!({ "items": items, "count": count })),
                    attempts: 1,
                })
            }
        }
    }

    /// Dispatch a call with the configured retry budget.
    ///
    /// Retryable codes are `UNAVAILABLE`, `DEADLINE_EXCEEDED`,
    /// `RESOURCE_EXHAUSTED`, and `ABORTED`; request-streaming calls retry
    /// only when marked idempotent. Backoff is exponential with jitter.
    pub async fn call(
        &self,
        target: &str,
        tls: bool,
        path: &str,
        spec: &GrpcCallSpec,
        headers: &HeaderMap,
        metrics: &GatewayMetrics,
    ) -> Result<GrpcOutcome, Denial> {
        let mode = StreamMode::parse(spec.stream.as_deref())?;
        let payload = Self::encode_message(&spec.message)?;
        let stream_payloads: Vec<Bytes> = spec
            .messages
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(Self::encode_message)
            .collect::<Result<_, _>>()?;
        let metadata = Self::sanitize_metadata(headers);
        let max_items = spec.max_items.unwrap_or(DEFAULT_MAX_ITEMS);
        let channel = self.channel(target, tls).await?;

        let can_retry = !mode.sends_stream() || spec.idempotent;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self
                .attempt(
                    channel.clone(),
                    path,
                    mode,
                    &payload,
                    &stream_payloads,
                    &metadata,
                    max_items,
                )
                .await
            {
                Ok(mut outcome) => {
                    outcome.attempts = attempts;
                    return Ok(outcome);
                }
                Err(status) => {
                    let code = GrpcCode::from_i32(status.code() as i32);
                    if can_retry && code.is_retryable() && attempts <= self.max_retries {
                        let delay = self.backoff(attempts - 1);
                        debug!(path, code = %code, attempt = attempts, "retrying gRPC call");
                        metrics.record_retry();
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    if code == GrpcCode::DeadlineExceeded {
                        metrics.record_upstream_timeout();
                    }
                    warn!(path, code = %code, "gRPC call failed");
                    return Ok(GrpcOutcome {
                        code,
                        http_status: code.http_status(),
                        message: status.message().to_owned(),
                        payload: None,
                        attempts,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_with_policy(policy: serde_json::Value) -> Api {
        serde_json::from_value(serde_json::json!({
            "api_id": "a1", "name": "svc", "version": "v1",
            "api_type": "GRPC", "grpc": policy,
        }))
        .unwrap()
    }

    fn spec(method: &str) -> GrpcCallSpec {
        serde_json::from_value(serde_json::json!({"method": method, "message": {}})).unwrap()
    }

    #[test]
    fn method_spec_must_be_service_dot_method() {
        let api = api_with_policy(serde_json::json!({}));
        assert!(GrpcUpstream::authorize(&api, &spec("Greeter.SayHello")).is_ok());

        for bad in ["SayHello", "Greeter.Say.Hello", "Greeter/SayHello", "1Bad.Method", ""] {
            let denial = GrpcUpstream::authorize(&api, &spec(bad)).unwrap_err();
            assert_eq!(denial.code, ErrorCode::ValidationFailed, "{bad}");
            assert_eq!(denial.status, 400);
        }
    }

    #[test]
    fn package_prefixes_the_service_path() {
        let api = api_with_policy(serde_json::json!({"package": "helloworld"}));
        let path = GrpcUpstream::authorize(&api, &spec("Greeter.SayHello")).unwrap();
        assert_eq!(path, "/helloworld.Greeter/SayHello");

        let mut call = spec("Greeter.SayHello");
        call.package = Some("override.pkg".into());
        let path = GrpcUpstream::authorize(&api, &call).unwrap();
        assert_eq!(path, "/override.pkg.Greeter/SayHello");
    }

    #[test]
    fn service_allowlist_denies_other_services() {
        let api = api_with_policy(serde_json::json!({"allowed_services": ["Greeter"]}));
        assert!(GrpcUpstream::authorize(&api, &spec("Greeter.SayHello")).is_ok());

        let denial = GrpcUpstream::authorize(&api, &spec("Admin.DeleteAll")).unwrap_err();
        assert_eq!(denial.code, ErrorCode::TargetNotAllowed);
        assert_eq!(denial.status, 403);
    }

    #[test]
    fn method_and_package_allowlists() {
        let api = api_with_policy(serde_json::json!({
            "package": "prod",
            "allowed_packages": ["prod"],
            "allowed_methods": ["Greeter.SayHello"],
        }));
        assert!(GrpcUpstream::authorize(&api, &spec("Greeter.SayHello")).is_ok());
        assert_eq!(
            GrpcUpstream::authorize(&api, &spec("Greeter.SayGoodbye"))
                .unwrap_err()
                .code,
            ErrorCode::TargetNotAllowed
        );

        let mut call = spec("Greeter.SayHello");
        call.package = Some("staging".into());
        assert_eq!(
            GrpcUpstream::authorize(&api, &call).unwrap_err().code,
            ErrorCode::TargetNotAllowed
        );
    }

    #[test]
    fn message_encoding_accepts_base64_and_json() {
        let bytes =
            GrpcUpstream::encode_message(&serde_json::Value::String(BASE64.encode(b"\x08\x01")))
                .unwrap();
        assert_eq!(&bytes[..], b"\x08\x01");

        let bytes = GrpcUpstream::encode_message(&serde_json::json!({"name": "world"})).unwrap();
        assert_eq!(&bytes[..], br#"{"name":"world"}"#);

        assert!(GrpcUpstream::encode_message(&serde_json::Value::String("!!".into())).is_err());
    }

    #[test]
    fn metadata_sanitization_rules() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Trace-Id", "abc123".parse().unwrap());
        headers.insert("Content-Type", "application/json".parse().unwrap());
        headers.insert("Weird!!Key", "v".parse().unwrap());
        headers.insert("grpc-timeout", "1S".parse().unwrap());

        let metadata = GrpcUpstream::sanitize_metadata(&headers);
        assert!(metadata.get("x-trace-id").is_some());
        assert!(metadata.get("content-type").is_none());
        assert!(metadata.get("grpc-timeout").is_none());
        // "Weird!!Key" is stripped to "weirdkey".
        assert!(metadata.get("weirdkey").is_some());
    }

    #[test]
    fn backoff_is_bounded() {
        let upstream = GrpcUpstream::new(&GatewayConfig {
            grpc_retry_base: Duration::from_millis(100),
            grpc_retry_max: Duration::from_millis(1_000),
            ..GatewayConfig::default()
        });

        for attempt in 0..10 {
            let delay = upstream.backoff(attempt);
            // Cap plus 25% jitter headroom.
            assert!(delay <= Duration::from_millis(1_250), "attempt {attempt}: {delay:?}");
        }
        assert!(upstream.backoff(0) >= Duration::from_millis(75));
    }

    #[test]
    fn stream_mode_parsing() {
        assert_eq!(StreamMode::parse(None).unwrap(), StreamMode::Unary);
        assert_eq!(StreamMode::parse(Some("server")).unwrap(), StreamMode::Server);
        assert_eq!(StreamMode::parse(Some("client")).unwrap(), StreamMode::Client);
        assert_eq!(StreamMode::parse(Some("BIDI")).unwrap(), StreamMode::Bidi);
        assert!(StreamMode::parse(Some("sideways")).is_err());
    }
}
