use serde::Deserialize;

/// Schema for `gatehouse.toml`, the server bootstrap configuration.
///
/// Pipeline behavior (timeouts, limits, envelope) comes from the
/// environment; this file covers what must exist before the gateway can be
/// built: the bind address, the state backend, the token table, and the
/// metadata seed.
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub metadata: MetadataSection,
}

/// Bind address and shutdown behavior.
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds to drain in-flight requests on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

/// State backend selection.
#[derive(Debug, Deserialize)]
pub struct StateSection {
    /// `memory` or `redis`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            redis_prefix: default_redis_prefix(),
        }
    }
}

/// Opaque bearer tokens accepted by the principal resolver.
#[derive(Debug, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
    /// Seconds a verified principal stays cached.
    #[serde(default = "default_principal_ttl")]
    pub principal_cache_ttl_seconds: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            principal_cache_ttl_seconds: default_principal_ttl(),
        }
    }
}

/// One token-to-user binding.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub username: String,
}

/// Where the metadata seed lives.
#[derive(Debug, Default, Deserialize)]
pub struct MetadataSection {
    /// Path to a JSON seed file; unset starts with an empty registry.
    #[serde(default)]
    pub seed_path: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_grace() -> u64 {
    std::env::var("SHUTDOWN_GRACE")
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(10)
}

fn default_backend() -> String {
    "memory".to_owned()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

fn default_redis_prefix() -> String {
    "gatehouse".to_owned()
}

fn default_principal_ttl() -> u64 {
    60
}
