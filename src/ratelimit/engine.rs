//! Policy evaluation against the window store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error};

use crate::audit::{AuditKind, AuditLog};
use crate::request::RequestInfo;

use super::policy::RatePolicy;
use super::store::{Decision, WindowStore};

/// Evaluates requests against rate limit policies.
///
/// The engine owns the fail-open boundary: a store fault is converted into
/// an allow decision plus a high-severity audit record, so a local cache
/// failure can never take the whole service down with it.
pub struct PolicyEngine {
    store: Arc<WindowStore>,
    audit: AuditLog,
}

impl PolicyEngine {
    /// Create an engine over the given store.
    pub fn new(store: Arc<WindowStore>, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    /// Derive the request's key under `policy` and evaluate it now.
    pub fn check(&self, request: &RequestInfo, policy: &RatePolicy) -> Decision {
        let key = policy.key_strategy().derive_key(request);
        self.check_key("policy", &key, policy, Utc::now())
    }

    /// Evaluate an already-derived key. `scope` labels the policy tier in
    /// logs and audit records.
    pub fn check_key(
        &self,
        scope: &str,
        key: &str,
        policy: &RatePolicy,
        now: DateTime<Utc>,
    ) -> Decision {
        match self.store.evaluate(key, policy, now) {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        scope = %scope,
                        key = %key,
                        limit = decision.limit,
                        "Rate limit exceeded"
                    );
                    self.audit.emit(
                        AuditKind::RateLimitExceeded,
                        json!({
                            "scope": scope,
                            "key": key,
                            "limit": decision.limit,
                            "retry_after_secs": decision.retry_after_secs,
                        }),
                    );
                }
                decision
            }
            Err(e) => {
                error!(scope = %scope, key = %key, error = %e, "Window store unavailable, failing open");
                self.audit.emit(
                    AuditKind::StoreUnavailable,
                    json!({
                        "scope": scope,
                        "key": key,
                        "error": e.to_string(),
                    }),
                );
                Self::fail_open(policy, now)
            }
        }
    }

    /// The store backing this engine.
    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }

    /// Allow decision synthesized when the store cannot be consulted.
    fn fail_open(policy: &RatePolicy, now: DateTime<Utc>) -> Decision {
        Decision {
            allowed: true,
            limit: policy.max_requests(),
            remaining: policy.max_requests(),
            reset_at: now + policy.window(),
            retry_after_secs: None,
        }
    }
}
