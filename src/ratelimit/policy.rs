//! Rate limit policies and counter key derivation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::request::RequestInfo;

/// Maximum number of User-Agent characters folded into the default key.
/// Bounds key cardinality against adversarial User-Agent strings.
const UA_FINGERPRINT_LEN: usize = 50;

/// Identity placeholder used in keys for unauthenticated requests.
const ANONYMOUS_IDENTITY: &str = "anonymous";

/// Placeholder for an absent User-Agent header.
const UNKNOWN_AGENT: &str = "unknown";

/// Errors raised when constructing a policy with invalid parameters.
///
/// These are fatal: a misconfigured policy must prevent startup rather
/// than silently admit or reject traffic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// The request ceiling was zero
    #[error("max_requests must be at least 1")]
    ZeroCeiling,

    /// The window duration was zero
    #[error("window duration must be positive")]
    EmptyWindow,
}

/// How the counter key for a request is derived.
#[derive(Clone)]
pub enum KeyStrategy {
    /// Network address plus a bounded User-Agent fingerprint.
    ByRemoteAddress,
    /// Authenticated identity; falls back to [`KeyStrategy::ByRemoteAddress`]
    /// for anonymous requests.
    ByAuthenticatedUser,
    /// Identity (or `anonymous`) combined with the normalized request path,
    /// so per-endpoint limits are charged separately from per-user limits.
    ByUserAndEndpoint,
    /// Caller-supplied derivation for anything the built-in strategies
    /// cannot express.
    Custom(Arc<dyn Fn(&RequestInfo) -> String + Send + Sync>),
}

impl KeyStrategy {
    /// Derive the counter key for a request.
    pub fn derive_key(&self, request: &RequestInfo) -> String {
        match self {
            KeyStrategy::ByRemoteAddress => default_key(request),
            KeyStrategy::ByAuthenticatedUser => match request.user_id.as_deref() {
                Some(user_id) => user_id.to_string(),
                None => default_key(request),
            },
            KeyStrategy::ByUserAndEndpoint => {
                let identity = request.user_id.as_deref().unwrap_or(ANONYMOUS_IDENTITY);
                format!("{}:{}", identity, normalize_path(&request.path))
            }
            KeyStrategy::Custom(derive) => derive(request),
        }
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::ByRemoteAddress => write!(f, "ByRemoteAddress"),
            KeyStrategy::ByAuthenticatedUser => write!(f, "ByAuthenticatedUser"),
            KeyStrategy::ByUserAndEndpoint => write!(f, "ByUserAndEndpoint"),
            KeyStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Address + truncated User-Agent. Truncation is by character so multi-byte
/// agents cannot split the key mid-codepoint.
fn default_key(request: &RequestInfo) -> String {
    let agent = request.user_agent.as_deref().unwrap_or(UNKNOWN_AGENT);
    let fingerprint: String = agent.chars().take(UA_FINGERPRINT_LEN).collect();
    format!("{}:{}", request.remote_addr, fingerprint)
}

/// Strip trailing slashes so `/reports` and `/reports/` charge one counter.
fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// An immutable rate limit policy: one window, one ceiling, one key scheme.
///
/// Policies are constructed once, validated, and shared read-only across
/// all concurrent evaluations.
#[derive(Debug, Clone)]
pub struct RatePolicy {
    window: Duration,
    max_requests: u64,
    key_strategy: KeyStrategy,
    denial_message: String,
}

impl RatePolicy {
    /// Create a policy, validating its parameters.
    pub fn new(
        window: Duration,
        max_requests: u64,
        key_strategy: KeyStrategy,
        denial_message: impl Into<String>,
    ) -> Result<Self, PolicyError> {
        if max_requests < 1 {
            return Err(PolicyError::ZeroCeiling);
        }
        if window.is_zero() {
            return Err(PolicyError::EmptyWindow);
        }

        Ok(Self {
            window,
            max_requests,
            key_strategy,
            denial_message: denial_message.into(),
        })
    }

    /// The window duration.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Maximum requests admitted per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// The key derivation scheme.
    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key_strategy
    }

    /// Message returned to callers when this policy denies a request.
    pub fn denial_message(&self) -> &str {
        &self.denial_message
    }
}
