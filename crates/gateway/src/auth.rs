use async_trait::async_trait;
use thiserror::Error;

use gatehouse_core::Principal;

/// Failures resolving a credential to a principal.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("authentication required")]
    Missing,
    /// The credential is malformed, unknown, or expired.
    #[error("invalid credential: {0}")]
    Invalid(String),
}

/// Resolves an opaque credential to an authenticated subject.
///
/// `subject` is the cheap extraction used to key subscription and counter
/// checks; `verify` performs full verification and yields role and group
/// membership. Verification is idempotent and side-effect-free, so
/// implementations may cache verified principals for a short TTL keyed by a
/// hash of the credential.
#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    /// Extract the subject without full verification.
    async fn subject(&self, credential: &str) -> Result<String, AuthError>;

    /// Fully verify the credential.
    async fn verify(&self, credential: &str) -> Result<Principal, AuthError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::{AuthError, Principal, PrincipalResolver, async_trait};

    /// Static token-to-principal table for pipeline tests.
    #[derive(Debug, Default)]
    pub struct StaticResolver {
        pub tokens: HashMap<String, Principal>,
    }

    impl StaticResolver {
        pub fn with(mut self, token: &str, principal: Principal) -> Self {
            self.tokens.insert(token.to_owned(), principal);
            self
        }
    }

    #[async_trait]
    impl PrincipalResolver for StaticResolver {
        async fn subject(&self, credential: &str) -> Result<String, AuthError> {
            self.tokens
                .get(credential)
                .map(|p| p.subject.clone())
                .ok_or_else(|| AuthError::Invalid("unknown token".into()))
        }

        async fn verify(&self, credential: &str) -> Result<Principal, AuthError> {
            self.tokens
                .get(credential)
                .cloned()
                .ok_or_else(|| AuthError::Invalid("unknown token".into()))
        }
    }
}
