use std::sync::Arc;

use tracing::{debug, warn};

use gatehouse_core::{Api, ErrorCode};
use gatehouse_metadata::MetadataStore;

use crate::error::{Denial, GatewayError};

/// A successful credit deduction, carrying what the dispatcher needs:
/// the header to inject and the group to refund on pre-upstream failure.
#[derive(Debug, Clone)]
pub struct CreditTicket {
    pub group: String,
    /// Header name from the credit definition.
    pub key_header: String,
    /// The user's own key when present and non-empty, else the definition's
    /// default value.
    pub header_value: String,
}

/// Credit accounting for credit-enabled APIs.
///
/// Deduction happens after every admission check and immediately before
/// upstream dispatch; a dispatch that fails before reaching the upstream
/// refunds the credit.
pub struct CreditEngine {
    metadata: Arc<dyn MetadataStore>,
}

impl CreditEngine {
    /// Create an engine over the metadata store.
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Deduct one credit for a call to `api` by `username`.
    pub async fn deduct(
        &self,
        api: &Api,
        username: &str,
    ) -> Result<Result<CreditTicket, Denial>, GatewayError> {
        let Some(group) = api.credit_group.as_deref() else {
            debug!(api = %api.api_id, "credits enabled but no credit group configured");
            return Ok(Err(Denial::new(
                ErrorCode::CreditsExhausted,
                "User does not have any credits",
            )));
        };

        let Some(def) = self.metadata.get_credit_def(group).await? else {
            debug!(group, "credit definition not found");
            return Ok(Err(Denial::new(
                ErrorCode::CreditsExhausted,
                "User does not have any credits",
            )));
        };

        let balance = self
            .metadata
            .get_user_credits(username)
            .await?
            .and_then(|uc| uc.credits.get(group).cloned());

        let Some(balance) = balance.filter(|b| b.available_credits > 0) else {
            return Ok(Err(Denial::new(
                ErrorCode::CreditsExhausted,
                "User does not have any credits",
            )));
        };

        // The atomic decrement is authoritative; a race to zero loses here.
        if !self.metadata.decrement_credit(username, group).await? {
            return Ok(Err(Denial::new(
                ErrorCode::CreditsExhausted,
                "User does not have any credits",
            )));
        }

        let header_value = balance
            .api_key()
            .map_or_else(|| def.key_value.clone(), ToOwned::to_owned);

        Ok(Ok(CreditTicket {
            group: group.to_owned(),
            key_header: def.key_header,
            header_value,
        }))
    }

    /// Return a credit after a dispatch failure that never reached the
    /// upstream. Best-effort: a failed refund is logged, not propagated.
    pub async fn refund(&self, username: &str, ticket: &CreditTicket) {
        match self.metadata.refund_credit(username, &ticket.group).await {
            Ok(true) => {}
            Ok(false) => warn!(username, group = %ticket.group, "credit refund found no balance"),
            Err(e) => warn!(username, group = %ticket.group, error = %e, "credit refund failed"),
        }
    }
}
