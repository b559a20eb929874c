//! Tier composition: deriving the effective policy set for a request.

use std::sync::Arc;
use std::time::Duration;

use crate::config::TiersConfig;
use crate::request::{RequestInfo, SubscriptionTier};

use super::policy::{KeyStrategy, PolicyError, RatePolicy};

/// One tier's contribution to a request's admission check.
#[derive(Debug)]
pub struct ScopedPolicy<'a> {
    /// Tier label, used in logs and audit records
    pub tier: &'static str,
    /// The policy to charge
    pub policy: &'a RatePolicy,
    /// The derived counter key, namespaced by tier so tiers with different
    /// windows never share a counter
    pub key: String,
}

/// Derives the ordered policy set a request must pass.
///
/// All policies are validated and built once at construction; composition
/// itself cannot fail. The operation tier keeps one prebuilt policy per
/// subscription tier and picks between them per request.
#[derive(Debug)]
pub struct PolicyComposer {
    global: RatePolicy,
    per_user: RatePolicy,
    sensitive: RatePolicy,
    operation_premium: RatePolicy,
    operation_free: RatePolicy,
    route_overrides: Vec<(String, RatePolicy)>,
    sensitive_paths: Vec<String>,
    intensive_paths: Vec<String>,
}

impl PolicyComposer {
    /// Build the composer from tier configuration.
    ///
    /// Fails if any tier carries a zero ceiling or an empty window.
    pub fn new(config: &TiersConfig) -> Result<Self, PolicyError> {
        let global = RatePolicy::new(
            Duration::from_secs(config.global.window_secs),
            config.global.max_requests,
            KeyStrategy::Custom(Arc::new(|request: &RequestInfo| {
                request.remote_addr.clone()
            })),
            config.global.message.clone(),
        )?;

        let per_user = RatePolicy::new(
            Duration::from_secs(config.per_user.window_secs),
            config.per_user.max_requests,
            KeyStrategy::ByAuthenticatedUser,
            config.per_user.message.clone(),
        )?;

        let sensitive = RatePolicy::new(
            Duration::from_secs(config.sensitive.window_secs),
            config.sensitive.max_requests,
            KeyStrategy::ByAuthenticatedUser,
            config.sensitive.message.clone(),
        )?;

        let operation_window = Duration::from_secs(config.operation.window_secs);
        let operation_premium = RatePolicy::new(
            operation_window,
            config.operation.premium_max,
            KeyStrategy::ByAuthenticatedUser,
            config.operation.premium_message.clone(),
        )?;
        let operation_free = RatePolicy::new(
            operation_window,
            config.operation.free_max,
            KeyStrategy::ByAuthenticatedUser,
            config.operation.free_message.clone(),
        )?;

        let mut route_overrides = Vec::with_capacity(config.route_overrides.len());
        for route in &config.route_overrides {
            let policy = RatePolicy::new(
                Duration::from_secs(route.window_secs),
                route.max_requests,
                KeyStrategy::ByUserAndEndpoint,
                route.message.clone(),
            )?;
            route_overrides.push((route.path_prefix.clone(), policy));
        }

        Ok(Self {
            global,
            per_user,
            sensitive,
            operation_premium,
            operation_free,
            route_overrides,
            sensitive_paths: config.sensitive_paths.clone(),
            intensive_paths: config.intensive_paths.clone(),
        })
    }

    /// The ordered set of tiers the request must pass, coarse first.
    ///
    /// Always yields at least the global and per-user tiers.
    pub fn compose(&self, request: &RequestInfo) -> Vec<ScopedPolicy<'_>> {
        let mut tiers = Vec::with_capacity(4);
        tiers.push(self.scoped("global_ip", &self.global, request));
        tiers.push(self.scoped("user", &self.per_user, request));

        if matches_prefix(&self.sensitive_paths, &request.path) {
            tiers.push(self.scoped("sensitive_op", &self.sensitive, request));
        }

        if let Some((_, policy)) = self
            .route_overrides
            .iter()
            .find(|(prefix, _)| request.path.starts_with(prefix.as_str()))
        {
            tiers.push(self.scoped("route", policy, request));
        }

        if matches_prefix(&self.intensive_paths, &request.path) {
            let policy = match request.effective_tier() {
                SubscriptionTier::Premium => &self.operation_premium,
                SubscriptionTier::Free => &self.operation_free,
            };
            tiers.push(self.scoped("operation", policy, request));
        }

        tiers
    }

    fn scoped<'a>(
        &self,
        tier: &'static str,
        policy: &'a RatePolicy,
        request: &RequestInfo,
    ) -> ScopedPolicy<'a> {
        let derived = policy.key_strategy().derive_key(request);
        ScopedPolicy {
            tier,
            policy,
            key: format!("{}:{}", tier, derived),
        }
    }
}

fn matches_prefix(prefixes: &[String], path: &str) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
}
