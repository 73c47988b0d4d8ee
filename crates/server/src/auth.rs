use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::warn;

use gatehouse_core::Principal;
use gatehouse_gateway::{AuthError, PrincipalResolver};
use gatehouse_metadata::MetadataStore;
use gatehouse_state::{KeyKind, StateKey, StateStore};

use crate::config::TokenEntry;

/// Opaque-bearer-token resolver backed by the metadata store.
///
/// Tokens are looked up by SHA-256 hash so plaintext never sits in the
/// table. Verification resolves the bound user's role and groups from
/// metadata and caches the principal for a short TTL keyed by the
/// credential hash.
pub struct TokenPrincipalResolver {
    /// SHA-256 hex of token -> username.
    tokens: HashMap<String, String>,
    metadata: Arc<dyn MetadataStore>,
    store: Arc<dyn StateStore>,
    cache_ttl: Duration,
}

impl TokenPrincipalResolver {
    /// Build the resolver from the configured token table.
    pub fn new(
        entries: &[TokenEntry],
        metadata: Arc<dyn MetadataStore>,
        store: Arc<dyn StateStore>,
        cache_ttl: Duration,
    ) -> Self {
        let tokens = entries
            .iter()
            .map(|entry| (Self::hash(&entry.token), entry.username.clone()))
            .collect();
        Self {
            tokens,
            metadata,
            store,
            cache_ttl,
        }
    }

    fn hash(credential: &str) -> String {
        hex::encode(Sha256::digest(credential.as_bytes()))
    }

    fn lookup(&self, credential: &str) -> Result<(String, String), AuthError> {
        if credential.is_empty() {
            return Err(AuthError::Missing);
        }
        let hash = Self::hash(credential);
        let username = self
            .tokens
            .get(&hash)
            .cloned()
            .ok_or_else(|| AuthError::Invalid("unknown token".into()))?;
        Ok((hash, username))
    }
}

#[async_trait]
impl PrincipalResolver for TokenPrincipalResolver {
    async fn subject(&self, credential: &str) -> Result<String, AuthError> {
        let (_, username) = self.lookup(credential)?;
        Ok(username)
    }

    async fn verify(&self, credential: &str) -> Result<Principal, AuthError> {
        let (hash, username) = self.lookup(credential)?;

        // Short-TTL cache of verified principals, keyed by credential hash.
        let cache_key = StateKey::new(KeyKind::PrincipalCache, &hash);
        if let Ok(Some(json)) = self.store.get(&cache_key).await
            && let Ok(principal) = serde_json::from_str::<Principal>(&json)
        {
            return Ok(principal);
        }

        let user = self
            .metadata
            .get_user(&username)
            .await
            .map_err(|e| AuthError::Invalid(format!("user lookup failed: {e}")))?
            .ok_or_else(|| AuthError::Invalid("unknown user".into()))?;

        let mut principal = Principal::new(user.username.clone(), user.role.clone());
        principal.groups = user.groups.clone();

        match serde_json::to_string(&principal) {
            Ok(json) => {
                if let Err(e) = self.store.set(&cache_key, &json, Some(self.cache_ttl)).await {
                    warn!(error = %e, "principal cache write failed");
                }
            }
            Err(e) => warn!(error = %e, "principal serialization failed"),
        }

        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use gatehouse_metadata::{MemoryMetadataStore, MetadataSeed};
    use gatehouse_state_memory::MemoryStateStore;

    use super::*;

    fn resolver() -> TokenPrincipalResolver {
        let seed = MetadataSeed::from_json(
            r#"{
                "users": [{
                    "username": "alice", "email": "alice@example.com",
                    "role": "developer", "groups": ["dev"]
                }]
            }"#,
        )
        .unwrap();
        TokenPrincipalResolver::new(
            &[TokenEntry {
                token: "tok-alice".into(),
                username: "alice".into(),
            }],
            Arc::new(MemoryMetadataStore::from_seed(seed)),
            Arc::new(MemoryStateStore::new()),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn known_token_resolves() {
        let resolver = resolver();
        assert_eq!(resolver.subject("tok-alice").await.unwrap(), "alice");

        let principal = resolver.verify("tok-alice").await.unwrap();
        assert_eq!(principal.subject, "alice");
        assert_eq!(principal.role, "developer");
        assert!(principal.groups.contains("dev"));
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let resolver = resolver();
        assert!(matches!(
            resolver.subject("tok-bob").await,
            Err(AuthError::Invalid(_))
        ));
        assert!(matches!(
            resolver.verify("").await,
            Err(AuthError::Missing)
        ));
    }

    #[tokio::test]
    async fn verification_is_cached() {
        let resolver = resolver();
        resolver.verify("tok-alice").await.unwrap();

        let key = StateKey::new(
            KeyKind::PrincipalCache,
            TokenPrincipalResolver::hash("tok-alice"),
        );
        assert!(resolver.store.get(&key).await.unwrap().is_some());
    }
}
