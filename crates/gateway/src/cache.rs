use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use gatehouse_core::{Api, Endpoint, EndpointValidation, Subscription, User};
use gatehouse_metadata::MetadataStore;
use gatehouse_state::{KeyKind, StateKey, StateStore};

use crate::error::GatewayError;

/// Typed memoization layer between the pipeline and the metadata store.
///
/// Each keyspace mirrors one metadata lookup; entries are written through on
/// first read and dropped on invalidation or full clear. Read failures of the
/// state backend degrade to a metadata fetch rather than failing the request.
pub struct GatewayCache {
    store: Arc<dyn StateStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl GatewayCache {
    /// Create a cache over the given backends.
    pub fn new(store: Arc<dyn StateStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { store, metadata }
    }

    /// The underlying state store, shared with counters and circuit state.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    async fn read<T: DeserializeOwned>(&self, key: &StateKey) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, falling through");
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &StateKey, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => {
                if let Err(e) = self.store.set(key, &json, None).await {
                    warn!(key = %key, error = %e, "cache write failed");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "cache serialization failed"),
        }
    }

    /// Resolve an API by `(name, version)`, memoizing both the id and the
    /// record.
    pub async fn get_api(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<Api>, GatewayError> {
        let record_key = StateKey::new(KeyKind::Api, format!("{name}/{version}"));
        if let Some(api) = self.read::<Api>(&record_key).await {
            return Ok(Some(api));
        }

        let path = format!("/{name}/{version}");
        let Some(api) = self.metadata.get_api_by_path(&path).await? else {
            return Ok(None);
        };

        self.write(&record_key, &api).await;
        self.write(&StateKey::new(KeyKind::ApiId, path), &api.api_id)
            .await;
        Ok(Some(api))
    }

    /// List the `"{METHOD}{uri}"` composites registered for an API.
    pub async fn get_endpoint_composites(
        &self,
        api_id: &str,
    ) -> Result<Vec<String>, GatewayError> {
        let key = StateKey::new(KeyKind::EndpointList, api_id);
        if let Some(composites) = self.read::<Vec<String>>(&key).await {
            return Ok(composites);
        }

        let endpoints = self.metadata.list_endpoints(api_id).await?;
        let composites: Vec<String> = endpoints.iter().map(Endpoint::composite).collect();
        self.write(&key, &composites).await;
        Ok(composites)
    }

    /// Look up one endpoint record by method and URI template.
    pub async fn get_endpoint(
        &self,
        api: &Api,
        method: &str,
        uri: &str,
    ) -> Result<Option<Endpoint>, GatewayError> {
        let key = StateKey::new(
            KeyKind::Endpoint,
            format!("/{}/{}/{}{}", method, api.name, api.version, uri),
        );
        if let Some(endpoint) = self.read::<Endpoint>(&key).await {
            return Ok(Some(endpoint));
        }

        let Some(endpoint) = self.metadata.get_endpoint(&api.api_id, method, uri).await? else {
            return Ok(None);
        };
        self.write(&key, &endpoint).await;
        Ok(Some(endpoint))
    }

    /// Look up a user record (quota fields included, no secrets).
    pub async fn get_user(&self, username: &str) -> Result<Option<User>, GatewayError> {
        let key = StateKey::new(KeyKind::User, username);
        if let Some(user) = self.read::<User>(&key).await {
            return Ok(Some(user));
        }

        let Some(user) = self.metadata.get_user(username).await? else {
            return Ok(None);
        };
        self.write(&key, &user).await;
        Ok(Some(user))
    }

    /// Look up a user's subscriptions.
    pub async fn get_subscription(
        &self,
        username: &str,
    ) -> Result<Option<Subscription>, GatewayError> {
        let key = StateKey::new(KeyKind::Subscription, username);
        if let Some(sub) = self.read::<Subscription>(&key).await {
            return Ok(Some(sub));
        }

        let Some(sub) = self.metadata.get_subscription(username).await? else {
            return Ok(None);
        };
        self.write(&key, &sub).await;
        Ok(Some(sub))
    }

    /// Look up an endpoint's validation schema.
    pub async fn get_validation(
        &self,
        endpoint_id: &str,
    ) -> Result<Option<EndpointValidation>, GatewayError> {
        let key = StateKey::new(KeyKind::Validation, endpoint_id);
        if let Some(validation) = self.read::<EndpointValidation>(&key).await {
            return Ok(Some(validation));
        }

        let Some(validation) = self.metadata.get_endpoint_validation(endpoint_id).await? else {
            return Ok(None);
        };
        self.write(&key, &validation).await;
        Ok(Some(validation))
    }

    /// Drop memoized entries for an API after a mutation, including its
    /// endpoint list.
    pub async fn invalidate_api(&self, name: &str, version: &str, api_id: &str) {
        for key in [
            StateKey::new(KeyKind::Api, format!("{name}/{version}")),
            StateKey::new(KeyKind::ApiId, format!("/{name}/{version}")),
            StateKey::new(KeyKind::EndpointList, api_id),
        ] {
            if let Err(e) = self.store.delete(&key).await {
                warn!(key = %key, error = %e, "cache invalidation failed");
            }
        }
    }

    /// Drop memoized entries for a user after a mutation.
    pub async fn invalidate_user(&self, username: &str) {
        for key in [
            StateKey::new(KeyKind::User, username),
            StateKey::new(KeyKind::Subscription, username),
        ] {
            if let Err(e) = self.store.delete(&key).await {
                warn!(key = %key, error = %e, "cache invalidation failed");
            }
        }
    }

    /// Clear every keyspace, counters included. Idempotent.
    pub async fn clear_all(&self) -> Result<(), GatewayError> {
        self.store.clear_all().await?;
        Ok(())
    }
}
