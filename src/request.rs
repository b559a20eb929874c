//! Per-request facts supplied by the serving layer.
//!
//! The identity/session collaborator fills in the optional identity and
//! subscription tier; everything else comes straight off the wire. This
//! crate only reads these values.

/// Subscription tier attached to an authenticated identity.
///
/// Anything other than a recognized premium label maps to [`SubscriptionTier::Free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionTier {
    /// Free-plan identity
    Free,
    /// Paying identity with elevated operation ceilings
    Premium,
}

impl SubscriptionTier {
    /// Parse a tier label from the identity context.
    pub fn from_label(label: &str) -> Self {
        if label.eq_ignore_ascii_case("premium") {
            SubscriptionTier::Premium
        } else {
            SubscriptionTier::Free
        }
    }
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        SubscriptionTier::Free
    }
}

/// The facts about one inbound request that admission control consumes.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Caller's network address as reported by the serving layer
    pub remote_addr: String,
    /// Raw User-Agent header, if any
    pub user_agent: Option<String>,
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Stable authenticated identity, absent for anonymous requests
    pub user_id: Option<String>,
    /// Subscription tier, absent for anonymous requests
    pub subscription: Option<SubscriptionTier>,
}

impl RequestInfo {
    /// Create a request description for an anonymous caller.
    pub fn new(
        remote_addr: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            user_agent: None,
            method: method.into(),
            path: path.into(),
            user_id: None,
            subscription: None,
        }
    }

    /// Attach a User-Agent header value.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Attach an authenticated identity.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a subscription tier.
    pub fn with_subscription(mut self, tier: SubscriptionTier) -> Self {
        self.subscription = Some(tier);
        self
    }

    /// The subscription tier to charge operation limits against.
    ///
    /// Authenticated identities without an explicit tier are treated as free.
    pub fn effective_tier(&self) -> SubscriptionTier {
        self.subscription.unwrap_or_default()
    }
}
