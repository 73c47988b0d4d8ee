use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// A verified caller derived from an opaque credential.
///
/// The gateway core never inspects the credential itself; resolution is the
/// job of the principal resolver configured at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Authenticated subject, normally the username.
    pub subject: String,
    /// Role name resolved against the role registry.
    pub role: String,
    /// Groups the subject belongs to.
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Free-form attributes carried by the credential.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Principal {
    /// Create a principal with the required fields.
    #[must_use]
    pub fn new(subject: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            role: role.into(),
            groups: BTreeSet::new(),
            attributes: HashMap::new(),
        }
    }

    /// Add a group membership.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_adds_groups() {
        let principal = Principal::new("alice", "developer")
            .with_group("payments")
            .with_group("search");
        assert_eq!(principal.subject, "alice");
        assert!(principal.groups.contains("payments"));
        assert!(principal.groups.contains("search"));
    }
}
