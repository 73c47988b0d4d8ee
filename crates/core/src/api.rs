use std::collections::BTreeSet;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Protocol family an API is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApiType {
    Rest,
    Soap,
    Graphql,
    Grpc,
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rest => f.write_str("REST"),
            Self::Soap => f.write_str("SOAP"),
            Self::Graphql => f.write_str("GRAPHQL"),
            Self::Grpc => f.write_str("GRPC"),
        }
    }
}

/// Per-API CORS policy applied to gateway responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsPolicy {
    /// Allowed origins. `*` allows any origin.
    #[serde(default)]
    pub origins: Vec<String>,
    /// Allowed methods for preflight responses.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Allowed request headers for preflight responses.
    #[serde(default)]
    pub headers: Vec<String>,
    /// Whether `Access-Control-Allow-Credentials` is emitted.
    #[serde(default)]
    pub credentials: bool,
    /// Headers exposed to the browser via `Access-Control-Expose-Headers`.
    #[serde(default)]
    pub expose: Vec<String>,
    /// Preflight cache lifetime in seconds.
    #[serde(default)]
    pub max_age: Option<u64>,
}

impl CorsPolicy {
    /// Whether `origin` is allowed by this policy.
    #[must_use]
    pub fn allows_origin(&self, origin: &str) -> bool {
        self.origins
            .iter()
            .any(|o| o == "*" || o.eq_ignore_ascii_case(origin))
    }
}

/// gRPC target restrictions for an API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrpcPolicy {
    /// Default protobuf package prepended to unqualified service names.
    #[serde(default)]
    pub package: Option<String>,
    /// Allowed packages. `None` means no restriction.
    #[serde(default)]
    pub allowed_packages: Option<BTreeSet<String>>,
    /// Allowed services (unqualified). `None` means no restriction.
    #[serde(default)]
    pub allowed_services: Option<BTreeSet<String>>,
    /// Allowed `Service.Method` pairs. `None` means no restriction.
    #[serde(default)]
    pub allowed_methods: Option<BTreeSet<String>>,
}

/// CIDR allow/deny policy evaluated against the caller's remote address.
///
/// Deny entries are checked first; when an allow list is present the address
/// must match one of its networks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpPolicy {
    #[serde(default)]
    pub allow: Vec<IpNet>,
    #[serde(default)]
    pub deny: Vec<IpNet>,
}

impl IpPolicy {
    /// Whether `addr` passes this policy.
    #[must_use]
    pub fn permits(&self, addr: IpAddr) -> bool {
        if self.deny.iter().any(|net| net.contains(&addr)) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|net| net.contains(&addr))
    }
}

/// A logical upstream exposed under `/{name}/{version}`.
///
/// Identity: `(name, version)` is unique; `api_id` is the stable handle used
/// to key endpoint lists, circuit state, and round-robin indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Api {
    /// Stable identifier.
    pub api_id: String,
    /// API name, first path segment under the protocol prefix.
    pub name: String,
    /// API version, e.g. `v1`.
    pub version: String,
    /// Protocol family served by this API.
    pub api_type: ApiType,
    /// Public APIs skip authentication and subscription checks.
    #[serde(default)]
    pub public: bool,
    /// Whether callers must present a credential. Defaults to `true`.
    #[serde(default = "default_true")]
    pub auth_required: bool,
    /// Disabled APIs refuse all traffic.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Roles allowed to call this API. Empty means any role.
    #[serde(default)]
    pub allowed_roles: BTreeSet<String>,
    /// Groups allowed to call this API. `ALL` admits every group.
    #[serde(default)]
    pub allowed_groups: BTreeSet<String>,
    /// Upstream response headers passed through to the caller, lowercased.
    #[serde(default)]
    pub allowed_headers: BTreeSet<String>,
    /// Ordered upstream servers; the router rotates across them.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Upstream retry budget for retryable statuses.
    #[serde(default)]
    pub retry_count: u32,
    /// Whether calls deduct from the caller's credit balance.
    #[serde(default)]
    pub credits_enabled: bool,
    /// Credit group consulted when `credits_enabled`.
    #[serde(default)]
    pub credit_group: Option<String>,
    /// Header whose value replaces `Authorization` before upstream dispatch.
    #[serde(default)]
    pub authorization_field_swap: Option<String>,
    /// Per-API CORS policy.
    #[serde(default)]
    pub cors: CorsPolicy,
    /// gRPC target restrictions.
    #[serde(default)]
    pub grpc: GrpcPolicy,
    /// Optional CIDR allow/deny policy.
    #[serde(default)]
    pub ip_policy: Option<IpPolicy>,
}

fn default_true() -> bool {
    true
}

impl Api {
    /// Return the public path prefix, `/{name}/{version}`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/{}/{}", self.name, self.version)
    }

    /// Return the subscription key, `{name}/{version}`.
    #[must_use]
    pub fn subscription_key(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }

    /// Lowercase the stored header allowlist. Metadata writers call this so
    /// response filtering can compare without re-normalizing.
    pub fn normalize(&mut self) {
        self.allowed_headers = self
            .allowed_headers
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();
    }
}

/// A registered route of an API.
///
/// `uri` may contain `{name}` templates; each template segment matches any
/// non-`/` substring. Identity: `(api_id, method, uri)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable identifier, used to key validation schemas.
    pub endpoint_id: String,
    /// Owning API.
    pub api_id: String,
    /// HTTP method, uppercased.
    pub method: String,
    /// Endpoint URI with optional `{placeholder}` segments.
    pub uri: String,
    /// Per-endpoint upstream override. Empty falls back to the API servers.
    #[serde(default)]
    pub servers: Vec<String>,
}

impl Endpoint {
    /// Return the composite matched against incoming requests:
    /// `"{METHOD}{uri}"`.
    #[must_use]
    pub fn composite(&self) -> String {
        format!("{}{}", self.method.to_ascii_uppercase(), self.uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_paths() {
        let api: Api = serde_json::from_value(serde_json::json!({
            "api_id": "a1",
            "name": "orders",
            "version": "v2",
            "api_type": "REST",
        }))
        .unwrap();
        assert_eq!(api.path(), "/orders/v2");
        assert_eq!(api.subscription_key(), "orders/v2");
        assert!(api.auth_required);
        assert!(api.active);
        assert!(!api.public);
    }

    #[test]
    fn normalize_lowercases_allowed_headers() {
        let mut api: Api = serde_json::from_value(serde_json::json!({
            "api_id": "a1",
            "name": "orders",
            "version": "v1",
            "api_type": "REST",
            "allowed_headers": ["Content-Type", "X-Custom"],
        }))
        .unwrap();
        api.normalize();
        assert!(api.allowed_headers.contains("content-type"));
        assert!(api.allowed_headers.contains("x-custom"));
        assert!(!api.allowed_headers.contains("Content-Type"));
    }

    #[test]
    fn ip_policy_deny_wins_over_allow() {
        let policy: IpPolicy = serde_json::from_value(serde_json::json!({
            "allow": ["10.0.0.0/8"],
            "deny": ["10.1.0.0/16"],
        }))
        .unwrap();
        assert!(policy.permits("10.2.3.4".parse().unwrap()));
        assert!(!policy.permits("10.1.3.4".parse().unwrap()));
        assert!(!policy.permits("192.168.0.1".parse().unwrap()));
    }

    #[test]
    fn ip_policy_empty_allow_permits_all() {
        let policy = IpPolicy::default();
        assert!(policy.permits("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn cors_origin_matching() {
        let cors: CorsPolicy = serde_json::from_value(serde_json::json!({
            "origins": ["https://app.example.com"],
        }))
        .unwrap();
        assert!(cors.allows_origin("https://app.example.com"));
        assert!(cors.allows_origin("HTTPS://APP.EXAMPLE.COM"));
        assert!(!cors.allows_origin("https://evil.example.com"));

        let wildcard: CorsPolicy =
            serde_json::from_value(serde_json::json!({"origins": ["*"]})).unwrap();
        assert!(wildcard.allows_origin("https://anything.example"));
    }

    #[test]
    fn endpoint_composite_uppercases_method() {
        let ep = Endpoint {
            endpoint_id: "e1".into(),
            api_id: "a1".into(),
            method: "get".into(),
            uri: "/orders/{id}".into(),
            servers: vec![],
        };
        assert_eq!(ep.composite(), "GET/orders/{id}");
    }
}
