use std::sync::Arc;

use tracing::debug;

use gatehouse_core::{Api, BandwidthQuota, ErrorCode, Principal, User};
use gatehouse_metadata::MetadataStore;

use crate::auth::{AuthError, PrincipalResolver};
use crate::cache::GatewayCache;
use crate::config::GatewayConfig;
use crate::context::GatewayRequest;
use crate::error::{Denial, GatewayError};
use crate::limits::{Charge, LimitDecision, LimitEngine};

/// Everything the pipeline needs to know about an admitted request.
#[derive(Debug)]
pub struct Grant {
    /// Verified principal; `None` for public APIs.
    pub principal: Option<Principal>,
    /// User record backing the quota checks.
    pub user: Option<User>,
    /// Subject for credit accounting; `None` for public APIs.
    pub subject: Option<String>,
    /// Bandwidth quota to charge after the response is known.
    pub bandwidth: Option<BandwidthQuota>,
}

/// Outcome of the admission chain.
#[derive(Debug)]
pub enum Admission {
    Admitted(Box<Grant>),
    Denied(Denial),
}

/// The ordered, fail-fast admission chain: subscription, group, rate +
/// throttle + tier, principal verification, role, bandwidth.
///
/// Counter charges accumulate through the limiter steps; when a later
/// limiter refuses, earlier charges are rolled back so refused requests
/// consume nothing.
pub struct AdmissionEngine {
    cache: Arc<GatewayCache>,
    metadata: Arc<dyn MetadataStore>,
    limits: Arc<LimitEngine>,
    resolver: Arc<dyn PrincipalResolver>,
    config: Arc<GatewayConfig>,
}

impl AdmissionEngine {
    /// Assemble the engine from its shared collaborators.
    pub fn new(
        cache: Arc<GatewayCache>,
        metadata: Arc<dyn MetadataStore>,
        limits: Arc<LimitEngine>,
        resolver: Arc<dyn PrincipalResolver>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            cache,
            metadata,
            limits,
            resolver,
            config,
        }
    }

    fn auth_denial(error: &AuthError) -> Denial {
        match error {
            AuthError::Missing => Denial::new(ErrorCode::AuthRequired, "Authentication required"),
            AuthError::Invalid(msg) => {
                Denial::new(ErrorCode::AuthRequired, format!("Invalid credential: {msg}"))
            }
        }
    }

    /// Run the chain for one request against one API.
    pub async fn admit(
        &self,
        api: &Api,
        request: &GatewayRequest,
        credential: Option<&str>,
    ) -> Result<Admission, GatewayError> {
        if api.public || !api.auth_required {
            return self.admit_public(api, request).await;
        }

        let Some(credential) = credential else {
            return Ok(Admission::Denied(Self::auth_denial(&AuthError::Missing)));
        };

        // Subject extraction keys the subscription and counter checks; full
        // verification happens later, in chain order.
        let subject = match self.resolver.subject(credential).await {
            Ok(subject) => subject,
            Err(e) => return Ok(Admission::Denied(Self::auth_denial(&e))),
        };

        // a. Subscription.
        let subscribed = self
            .cache
            .get_subscription(&subject)
            .await?
            .is_some_and(|sub| sub.covers(&api.subscription_key()));
        if !subscribed {
            debug!(subject, api = %api.api_id, "subscription missing");
            return Ok(Admission::Denied(Denial::new(
                ErrorCode::SubscriptionRequired,
                "You are not subscribed to this API",
            )));
        }

        // b. Group allowance.
        let Some(user) = self.cache.get_user(&subject).await? else {
            return Ok(Admission::Denied(Denial::new(
                ErrorCode::AuthRequired,
                "Unknown user",
            )));
        };
        if !api.allowed_groups.is_empty()
            && !api.allowed_groups.contains("ALL")
            && user.groups.is_disjoint(&api.allowed_groups)
        {
            return Ok(Admission::Denied(Denial::new(
                ErrorCode::GroupNotAllowed,
                "Your groups do not allow access to this API",
            )));
        }

        // c. Rate limit, throttle, then tier; earlier charges roll back when
        // a later limiter refuses.
        let mut charges: Vec<Charge> = Vec::new();

        if let Some(quota) = &user.rate_limit {
            match self.limits.check_rate(&subject, quota).await? {
                LimitDecision::Admitted { charge, .. } => charges.push(charge),
                LimitDecision::Denied(denial) => return Ok(Admission::Denied(denial)),
            }
        }

        if let Some(quota) = &user.throttle {
            match self.limits.check_throttle(&subject, quota).await? {
                LimitDecision::Admitted { charge, wait } => {
                    charges.push(charge);
                    if let Some(delay) = wait {
                        tokio::time::sleep(delay).await;
                    }
                }
                LimitDecision::Denied(denial) => {
                    self.limits.rollback(&charges).await?;
                    return Ok(Admission::Denied(denial));
                }
            }
        }

        if let Some(tier) = self.metadata.get_user_tier(&user.username).await?
            && tier.enabled
        {
            let (tier_charges, denial) = self.limits.check_tier(&user.username, &tier.limits).await?;
            if let Some(denial) = denial {
                self.limits.rollback(&charges).await?;
                return Ok(Admission::Denied(denial));
            }
            charges.extend(tier_charges);
        }

        // d. Full principal verification. Counters consumed so far stay
        // consumed, matching the documented chain order.
        let principal = match self.resolver.verify(credential).await {
            Ok(principal) => principal,
            Err(e) => return Ok(Admission::Denied(Self::auth_denial(&e))),
        };

        // e. Role allowance.
        if !api.allowed_roles.is_empty() && !api.allowed_roles.contains(&user.role) {
            return Ok(Admission::Denied(Denial::new(
                ErrorCode::RoleNotAllowed,
                "Forbidden: role not allowed for this API",
            )));
        }

        // f. Bandwidth pre-check against the incoming body size.
        let bandwidth = user.bandwidth.filter(|bw| bw.enabled);
        if let Some(quota) = &bandwidth
            && let Some(denial) = self
                .limits
                .check_bandwidth(&subject, quota, request.body.len() as u64)
                .await?
        {
            self.limits.rollback(&charges).await?;
            return Ok(Admission::Denied(denial));
        }

        Ok(Admission::Admitted(Box::new(Grant {
            principal: Some(principal),
            user: Some(user),
            subject: Some(subject),
            bandwidth,
        })))
    }

    /// Public APIs skip authentication; an optional default quota applies
    /// per remote address.
    async fn admit_public(
        &self,
        api: &Api,
        request: &GatewayRequest,
    ) -> Result<Admission, GatewayError> {
        if api.public && let Some(quota) = &self.config.public_default_rate {
            let subject = format!("ip:{}", request.remote_ip);
            if let LimitDecision::Denied(denial) = self.limits.check_rate(&subject, quota).await? {
                return Ok(Admission::Denied(denial));
            }
        }

        Ok(Admission::Admitted(Box::new(Grant {
            principal: None,
            user: None,
            subject: None,
            bandwidth: None,
        })))
    }
}
