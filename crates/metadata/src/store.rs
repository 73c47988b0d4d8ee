use async_trait::async_trait;

use gatehouse_core::{
    Api, CreditDefinition, Endpoint, EndpointValidation, Role, Routing, Subscription, Tier, User,
    UserCredits,
};

use crate::error::MetadataError;

/// Authoritative registry of APIs, endpoints, users, and quota metadata.
///
/// The gateway core consumes this contract and memoizes lookups in its state
/// store; administrative CRUD lives behind the implementation. Credit
/// mutations (`decrement_credit` / `refund_credit`) must be atomic so that
/// concurrent calls never drive a balance below zero.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Resolve an API by its public path, `/{name}/{version}`.
    async fn get_api_by_path(&self, path: &str) -> Result<Option<Api>, MetadataError>;

    /// List all endpoints registered for an API.
    async fn list_endpoints(&self, api_id: &str) -> Result<Vec<Endpoint>, MetadataError>;

    /// Look up one endpoint by method and URI template.
    async fn get_endpoint(
        &self,
        api_id: &str,
        method: &str,
        uri: &str,
    ) -> Result<Option<Endpoint>, MetadataError>;

    /// Look up a user by username.
    async fn get_user(&self, username: &str) -> Result<Option<User>, MetadataError>;

    /// Look up a user's API subscriptions.
    async fn get_subscription(&self, username: &str)
    -> Result<Option<Subscription>, MetadataError>;

    /// Look up a routing override by client key.
    async fn get_routing(&self, client_key: &str) -> Result<Option<Routing>, MetadataError>;

    /// Look up a credit definition by group name.
    async fn get_credit_def(&self, group: &str)
    -> Result<Option<CreditDefinition>, MetadataError>;

    /// Look up a user's credit balances.
    async fn get_user_credits(&self, username: &str)
    -> Result<Option<UserCredits>, MetadataError>;

    /// Atomically deduct one credit from the user's balance in `group`.
    /// Returns `false` when the balance is missing or already zero.
    async fn decrement_credit(&self, username: &str, group: &str) -> Result<bool, MetadataError>;

    /// Return one credit to the user's balance in `group`. Returns `false`
    /// when the balance is missing.
    async fn refund_credit(&self, username: &str, group: &str) -> Result<bool, MetadataError>;

    /// Look up the validation schema for an endpoint.
    async fn get_endpoint_validation(
        &self,
        endpoint_id: &str,
    ) -> Result<Option<EndpointValidation>, MetadataError>;

    /// Resolve the user's effective tier: explicit assignment within its
    /// effectivity window, else the default tier, else none.
    async fn get_user_tier(&self, user_id: &str) -> Result<Option<Tier>, MetadataError>;

    /// Look up a role by name. Backs permission checks on admin routes.
    async fn get_role(&self, name: &str) -> Result<Option<Role>, MetadataError>;
}
