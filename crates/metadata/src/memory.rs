use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use gatehouse_core::{
    Api, CreditDefinition, Endpoint, EndpointValidation, Role, Routing, Subscription, Tier, User,
    UserCredits, UserTierAssignment,
};

use crate::error::MetadataError;
use crate::seed::MetadataSeed;
use crate::store::MetadataStore;

#[derive(Debug, Default)]
struct Inner {
    /// Keyed by `/{name}/{version}`.
    apis_by_path: HashMap<String, Api>,
    /// Keyed by `api_id`.
    endpoints: HashMap<String, Vec<Endpoint>>,
    users: HashMap<String, User>,
    subscriptions: HashMap<String, Subscription>,
    routings: HashMap<String, Routing>,
    credit_defs: HashMap<String, CreditDefinition>,
    user_credits: HashMap<String, UserCredits>,
    tiers: HashMap<String, Tier>,
    tier_assignments: HashMap<String, UserTierAssignment>,
    /// Keyed by `endpoint_id`.
    validations: HashMap<String, EndpointValidation>,
    roles: HashMap<String, Role>,
}

/// In-memory [`MetadataStore`] used by standalone mode and tests.
///
/// All collections live behind one `RwLock`; credit mutations take the write
/// lock, which makes decrement/refund atomic within the process.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl MemoryMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store populated from a seed.
    #[must_use]
    pub fn from_seed(seed: MetadataSeed) -> Self {
        let mut inner = Inner::default();

        for mut api in seed.apis {
            api.normalize();
            inner.apis_by_path.insert(api.path(), api);
        }
        for endpoint in seed.endpoints {
            inner
                .endpoints
                .entry(endpoint.api_id.clone())
                .or_default()
                .push(endpoint);
        }
        for user in seed.users {
            inner.users.insert(user.username.clone(), user);
        }
        for sub in seed.subscriptions {
            inner.subscriptions.insert(sub.username.clone(), sub);
        }
        for routing in seed.routings {
            inner.routings.insert(routing.client_key.clone(), routing);
        }
        for def in seed.credit_defs {
            inner.credit_defs.insert(def.group.clone(), def);
        }
        for credits in seed.user_credits {
            inner.user_credits.insert(credits.username.clone(), credits);
        }
        for tier in seed.tiers {
            inner.tiers.insert(tier.tier_id.clone(), tier);
        }
        for assignment in seed.tier_assignments {
            inner
                .tier_assignments
                .insert(assignment.user_id.clone(), assignment);
        }
        for validation in seed.validations {
            inner
                .validations
                .insert(validation.endpoint_id.clone(), validation);
        }
        for role in seed.roles {
            inner.roles.insert(role.name.clone(), role);
        }

        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Replace a user's credit balances (test and admin hook).
    pub async fn put_user_credits(&self, credits: UserCredits) {
        let mut inner = self.inner.write().await;
        inner.user_credits.insert(credits.username.clone(), credits);
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_api_by_path(&self, path: &str) -> Result<Option<Api>, MetadataError> {
        let inner = self.inner.read().await;
        Ok(inner.apis_by_path.get(path).cloned())
    }

    async fn list_endpoints(&self, api_id: &str) -> Result<Vec<Endpoint>, MetadataError> {
        let inner = self.inner.read().await;
        Ok(inner.endpoints.get(api_id).cloned().unwrap_or_default())
    }

    async fn get_endpoint(
        &self,
        api_id: &str,
        method: &str,
        uri: &str,
    ) -> Result<Option<Endpoint>, MetadataError> {
        let inner = self.inner.read().await;
        Ok(inner.endpoints.get(api_id).and_then(|eps| {
            eps.iter()
                .find(|ep| ep.method.eq_ignore_ascii_case(method) && ep.uri == uri)
                .cloned()
        }))
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>, MetadataError> {
        let inner = self.inner.read().await;
        Ok(inner.users.get(username).cloned())
    }

    async fn get_subscription(
        &self,
        username: &str,
    ) -> Result<Option<Subscription>, MetadataError> {
        let inner = self.inner.read().await;
        Ok(inner.subscriptions.get(username).cloned())
    }

    async fn get_routing(&self, client_key: &str) -> Result<Option<Routing>, MetadataError> {
        let inner = self.inner.read().await;
        Ok(inner.routings.get(client_key).cloned())
    }

    async fn get_credit_def(
        &self,
        group: &str,
    ) -> Result<Option<CreditDefinition>, MetadataError> {
        let inner = self.inner.read().await;
        Ok(inner.credit_defs.get(group).cloned())
    }

    async fn get_user_credits(
        &self,
        username: &str,
    ) -> Result<Option<UserCredits>, MetadataError> {
        let inner = self.inner.read().await;
        Ok(inner.user_credits.get(username).cloned())
    }

    async fn decrement_credit(&self, username: &str, group: &str) -> Result<bool, MetadataError> {
        let mut inner = self.inner.write().await;
        let Some(balance) = inner
            .user_credits
            .get_mut(username)
            .and_then(|uc| uc.credits.get_mut(group))
        else {
            return Ok(false);
        };

        if balance.available_credits == 0 {
            return Ok(false);
        }
        balance.available_credits -= 1;
        Ok(true)
    }

    async fn refund_credit(&self, username: &str, group: &str) -> Result<bool, MetadataError> {
        let mut inner = self.inner.write().await;
        let Some(balance) = inner
            .user_credits
            .get_mut(username)
            .and_then(|uc| uc.credits.get_mut(group))
        else {
            return Ok(false);
        };

        balance.available_credits += 1;
        Ok(true)
    }

    async fn get_endpoint_validation(
        &self,
        endpoint_id: &str,
    ) -> Result<Option<EndpointValidation>, MetadataError> {
        let inner = self.inner.read().await;
        Ok(inner.validations.get(endpoint_id).cloned())
    }

    async fn get_user_tier(&self, user_id: &str) -> Result<Option<Tier>, MetadataError> {
        let inner = self.inner.read().await;
        let now = Utc::now();

        // Explicit assignment within its effectivity window wins.
        if let Some(assignment) = inner.tier_assignments.get(user_id)
            && assignment.is_effective(&now)
            && let Some(tier) = inner.tiers.get(&assignment.tier_id)
            && tier.enabled
        {
            let mut effective = tier.clone();
            if let Some(overrides) = assignment.override_limits {
                effective.limits = overrides;
            }
            return Ok(Some(effective));
        }

        // Fall back to the default tier.
        Ok(inner
            .tiers
            .values()
            .find(|t| t.is_default && t.enabled)
            .cloned())
    }

    async fn get_role(&self, name: &str) -> Result<Option<Role>, MetadataError> {
        let inner = self.inner.read().await;
        Ok(inner.roles.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use gatehouse_core::CreditBalance;

    use super::*;

    fn seeded() -> MemoryMetadataStore {
        let seed = MetadataSeed::from_json(
            r#"{
                "apis": [{
                    "api_id": "a1",
                    "name": "demo",
                    "version": "v1",
                    "api_type": "REST",
                    "allowed_headers": ["X-Custom"]
                }],
                "endpoints": [
                    {"endpoint_id": "e1", "api_id": "a1", "method": "GET", "uri": "/p"},
                    {"endpoint_id": "e2", "api_id": "a1", "method": "POST", "uri": "/p"}
                ],
                "tiers": [
                    {"tier_id": "t1", "name": "free", "is_default": true},
                    {"tier_id": "t2", "name": "pro",
                     "limits": {"requests_per_minute": 600}}
                ],
                "tier_assignments": [
                    {"user_id": "alice", "tier_id": "t2"}
                ]
            }"#,
        )
        .unwrap();
        MemoryMetadataStore::from_seed(seed)
    }

    #[tokio::test]
    async fn api_lookup_normalizes_headers() {
        let store = seeded();
        let api = store.get_api_by_path("/demo/v1").await.unwrap().unwrap();
        assert!(api.allowed_headers.contains("x-custom"));
        assert!(store.get_api_by_path("/demo/v2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn endpoint_lookup_is_method_insensitive() {
        let store = seeded();
        let ep = store.get_endpoint("a1", "get", "/p").await.unwrap().unwrap();
        assert_eq!(ep.endpoint_id, "e1");
        assert_eq!(store.list_endpoints("a1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn assigned_tier_beats_default() {
        let store = seeded();
        let tier = store.get_user_tier("alice").await.unwrap().unwrap();
        assert_eq!(tier.tier_id, "t2");

        let tier = store.get_user_tier("bob").await.unwrap().unwrap();
        assert_eq!(tier.tier_id, "t1");
    }

    #[tokio::test]
    async fn credit_decrement_stops_at_zero() {
        let store = MemoryMetadataStore::new();
        let mut credits = UserCredits {
            username: "alice".into(),
            credits: HashMap::new(),
        };
        credits.credits.insert(
            "ai".into(),
            CreditBalance {
                tier_name: "basic".into(),
                available_credits: 1,
                user_api_key: None,
            },
        );
        store.put_user_credits(credits).await;

        assert!(store.decrement_credit("alice", "ai").await.unwrap());
        assert!(!store.decrement_credit("alice", "ai").await.unwrap());
        assert!(store.refund_credit("alice", "ai").await.unwrap());
        assert!(store.decrement_credit("alice", "ai").await.unwrap());
        assert!(!store.decrement_credit("alice", "missing").await.unwrap());
    }
}
