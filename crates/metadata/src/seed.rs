use serde::{Deserialize, Serialize};

use gatehouse_core::{
    Api, CreditDefinition, Endpoint, EndpointValidation, Role, Routing, Subscription, Tier, User,
    UserCredits, UserTierAssignment,
};

/// Declarative metadata loaded at startup in standalone mode.
///
/// The same shape backs test fixtures; every collection defaults to empty so
/// seeds only name what they need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataSeed {
    #[serde(default)]
    pub apis: Vec<Api>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub routings: Vec<Routing>,
    #[serde(default)]
    pub credit_defs: Vec<CreditDefinition>,
    #[serde(default)]
    pub user_credits: Vec<UserCredits>,
    #[serde(default)]
    pub tiers: Vec<Tier>,
    #[serde(default)]
    pub tier_assignments: Vec<UserTierAssignment>,
    #[serde(default)]
    pub validations: Vec<EndpointValidation>,
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl MetadataSeed {
    /// Parse a seed from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
