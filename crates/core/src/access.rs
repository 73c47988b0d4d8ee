use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Group names with fixed meaning: `admin` grants administrative access and
/// `ALL` on an API's allowlist admits every group.
pub const RESERVED_GROUPS: [&str; 2] = ["admin", "ALL"];

/// Binding of a user to the APIs they may call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subscription {
    pub username: String,
    /// Subscribed APIs as `{name}/{version}` keys.
    #[serde(default)]
    pub apis: BTreeSet<String>,
}

impl Subscription {
    /// Whether the user is subscribed to the API identified by
    /// `{name}/{version}`.
    #[must_use]
    pub fn covers(&self, subscription_key: &str) -> bool {
        self.apis.contains(subscription_key)
    }
}

/// A named permission bundle. Permission names form a closed set
/// (`manage_apis`, `manage_gateway`, `view_logs`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl Role {
    /// Whether this role carries the given permission.
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// A named group of users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    /// Optional description of the API access this group conveys.
    #[serde(default)]
    pub api_access: Option<String>,
}

/// Routing override keyed by the caller-supplied `client-key` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routing {
    pub client_key: String,
    /// Ordered upstream servers that replace the endpoint/API server lists.
    pub servers: Vec<String>,
}
