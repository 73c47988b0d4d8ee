use serde::{Deserialize, Serialize};

/// The keyspace a state entry belongs to.
///
/// Metadata keyspaces memoize `MetadataStore` lookups; counter keyspaces hold
/// ephemeral windowed counters; the remaining keyspaces back routing and
/// circuit state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// `/{name}/{version}` -> `api_id`.
    ApiId,
    /// `{name}/{version}` -> serialized `Api`.
    Api,
    /// `api_id` -> list of `"{METHOD}{uri}"` composites.
    EndpointList,
    /// `/{METHOD}/{name}/{version}{uri}` -> serialized `Endpoint`.
    Endpoint,
    /// `username` -> serialized `User`.
    User,
    /// `username` -> serialized `Subscription`.
    Subscription,
    /// `endpoint_id` -> serialized `EndpointValidation`.
    Validation,
    /// `{subject}:{window}:{bucket}` -> admitted-request count.
    RateCounter,
    /// `{subject}:{bucket}` -> burst count.
    ThrottleCounter,
    /// `{subject}:{bucket}` -> consumed bytes.
    BandwidthCounter,
    /// `{user_id}:{window}:{bucket}` -> tier request count.
    TierCounter,
    /// `{api_id}:{set_hash}` -> rotating upstream index.
    RoundRobin,
    /// `api_key` -> serialized circuit breaker data.
    Circuit,
    /// Credential hash -> serialized verified principal.
    PrincipalCache,
    Custom(String),
}

impl KeyKind {
    /// Return the keyspace prefix.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ApiId => "api_id",
            Self::Api => "api",
            Self::EndpointList => "api_endpoint",
            Self::Endpoint => "endpoint",
            Self::User => "user",
            Self::Subscription => "user_subscription",
            Self::Validation => "endpoint_validation",
            Self::RateCounter => "rate",
            Self::ThrottleCounter => "throttle",
            Self::BandwidthCounter => "bandwidth_usage",
            Self::TierCounter => "tier_rate",
            Self::RoundRobin => "rr",
            Self::Circuit => "circuit",
            Self::PrincipalCache => "principal",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key used to address state entries in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub kind: KeyKind,
    pub id: String,
}

impl StateKey {
    /// Create a new state key.
    #[must_use]
    pub fn new(kind: KeyKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Return a canonical string representation: `{kind}:{id}`.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}
