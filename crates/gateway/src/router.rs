use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use gatehouse_core::{Api, Endpoint};
use gatehouse_metadata::MetadataStore;
use gatehouse_state::{KeyKind, StateKey, StateStore};

use crate::error::GatewayError;

/// Transport family of a selected upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    /// Plain or TLS HTTP.
    Http,
    /// gRPC; `tls` distinguishes `grpcs://` from `grpc://`.
    Grpc { tls: bool },
}

/// A concrete upstream chosen for one request.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub url: String,
    pub scheme: UpstreamScheme,
}

impl UpstreamTarget {
    fn classify(url: &str) -> Self {
        if let Some(rest) = url.strip_prefix("grpcs://") {
            Self {
                url: rest.to_owned(),
                scheme: UpstreamScheme::Grpc { tls: true },
            }
        } else if let Some(rest) = url.strip_prefix("grpc://") {
            Self {
                url: rest.to_owned(),
                scheme: UpstreamScheme::Grpc { tls: false },
            }
        } else {
            Self {
                url: url.trim_end_matches('/').to_owned(),
                scheme: UpstreamScheme::Http,
            }
        }
    }
}

/// Upstream selection: client-keyed routing overrides, then endpoint
/// servers, then API servers, rotated round-robin per selection set.
///
/// The rotating index lives in the state store and is not persisted across
/// restarts; concurrent selections may collide on an index, which is
/// acceptable.
pub struct Router {
    store: Arc<dyn StateStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl Router {
    /// Create a router over the given backends.
    pub fn new(store: Arc<dyn StateStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { store, metadata }
    }

    /// Hash the ordered server set so each distinct set rotates its own index.
    fn set_hash(servers: &[String]) -> String {
        let mut hasher = Sha256::new();
        for server in servers {
            hasher.update(server.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(&hasher.finalize()[..8])
    }

    /// Pick the upstream for one request. `None` means no servers are
    /// configured anywhere; the dispatcher fails closed.
    pub async fn select(
        &self,
        api: &Api,
        endpoint: Option<&Endpoint>,
        client_key: Option<&str>,
    ) -> Result<Option<UpstreamTarget>, GatewayError> {
        let servers: Vec<String> = if let Some(key) = client_key
            && let Some(routing) = self.metadata.get_routing(key).await?
            && !routing.servers.is_empty()
        {
            debug!(client_key = key, "client-keyed routing override");
            routing.servers
        } else if let Some(ep) = endpoint.filter(|ep| !ep.servers.is_empty()) {
            ep.servers.clone()
        } else {
            api.servers.clone()
        };

        if servers.is_empty() {
            return Ok(None);
        }

        let index = if servers.len() > 1 {
            let key = StateKey::new(
                KeyKind::RoundRobin,
                format!("{}:{}", api.api_id, Self::set_hash(&servers)),
            );
            match self.store.increment(&key, 1, None).await {
                #[allow(clippy::cast_sign_loss)]
                Ok(n) => (n.max(1) as u64 - 1) as usize % servers.len(),
                Err(e) => {
                    // Selection must not fail on a counter hiccup.
                    warn!(error = %e, "round-robin increment failed, using first server");
                    0
                }
            }
        } else {
            0
        };

        Ok(Some(UpstreamTarget::classify(&servers[index])))
    }
}
