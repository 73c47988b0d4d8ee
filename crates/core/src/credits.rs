use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One purchasable tier inside a credit group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTierSpec {
    pub tier_name: String,
    /// Credits granted when the tier resets.
    pub credits: u64,
    /// How often the balance resets, e.g. `monthly`.
    #[serde(default)]
    pub reset_frequency: Option<String>,
}

/// Definition of a credit group shared by credit-enabled APIs.
///
/// On dispatch the gateway injects `key_header` with the user's own API key
/// when present, falling back to `key_value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditDefinition {
    /// Group name referenced by `Api::credit_group`.
    pub group: String,
    /// Header name injected into the upstream request.
    pub key_header: String,
    /// Default header value when the user has no key of their own.
    pub key_value: String,
    #[serde(default)]
    pub tiers: Vec<CreditTierSpec>,
}

/// A user's balance within one credit group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditBalance {
    pub tier_name: String,
    pub available_credits: u64,
    /// Per-user upstream API key. An empty string is treated as absent.
    #[serde(default)]
    pub user_api_key: Option<String>,
}

impl CreditBalance {
    /// Return the user's API key, treating the empty string as absent.
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.user_api_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// Credit balances for a user across all groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserCredits {
    pub username: String,
    /// Balances keyed by credit group.
    #[serde(default)]
    pub credits: HashMap<String, CreditBalance>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_user_api_key_is_absent() {
        let balance = CreditBalance {
            tier_name: "basic".into(),
            available_credits: 3,
            user_api_key: Some(String::new()),
        };
        assert_eq!(balance.api_key(), None);

        let balance = CreditBalance {
            user_api_key: Some("sk-123".into()),
            ..balance
        };
        assert_eq!(balance.api_key(), Some("sk-123"));
    }

    #[test]
    fn user_credits_roundtrip() {
        let json = serde_json::json!({
            "username": "alice",
            "credits": {
                "ai": {"tier_name": "basic", "available_credits": 10}
            }
        });
        let credits: UserCredits = serde_json::from_value(json).unwrap();
        assert_eq!(credits.credits["ai"].available_credits, 10);
        assert_eq!(credits.credits["ai"].api_key(), None);
    }
}
