//! Configuration management for Turnstile.
//!
//! Every knob has a serde default matching the shipped policy set, so an
//! empty file (or no file at all) yields a fully working configuration.
//! Validation happens when policies are constructed from these values;
//! invalid ceilings or windows fail startup.

use serde::{Deserialize, Serialize};

/// Main configuration for the admission-control layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Rate limit tier configuration
    #[serde(default)]
    pub tiers: TiersConfig,

    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Background eviction configuration
    #[serde(default)]
    pub evictor: EvictorConfig,

    /// Suspicious-activity detector configuration
    #[serde(default)]
    pub abuse: AbuseConfig,

    /// Audit queue configuration
    #[serde(default)]
    pub audit: AuditConfig,
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| crate::error::TurnstileError::Config(e.to_string()))
    }
}

/// One static rate limit tier: a window, a ceiling, and a denial message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimit {
    /// Window length in seconds
    pub window_secs: u64,
    /// Maximum requests admitted per window
    pub max_requests: u64,
    /// Message returned when this tier denies a request
    pub message: String,
}

/// Ceilings for resource-intensive operations, chosen by subscription tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationTierConfig {
    /// Window length in seconds, shared by both tiers
    #[serde(default = "default_operation_window")]
    pub window_secs: u64,

    /// Ceiling for premium identities
    #[serde(default = "default_operation_premium_max")]
    pub premium_max: u64,

    /// Ceiling for free identities
    #[serde(default = "default_operation_free_max")]
    pub free_max: u64,

    /// Denial message for premium identities
    #[serde(default = "default_operation_premium_message")]
    pub premium_message: String,

    /// Denial message for free identities
    #[serde(default = "default_operation_free_message")]
    pub free_message: String,
}

impl Default for OperationTierConfig {
    fn default() -> Self {
        Self {
            window_secs: default_operation_window(),
            premium_max: default_operation_premium_max(),
            free_max: default_operation_free_max(),
            premium_message: default_operation_premium_message(),
            free_message: default_operation_free_message(),
        }
    }
}

/// A per-route limit override, matched by path prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteOverride {
    /// Path prefix this override applies to
    pub path_prefix: String,
    /// Window length in seconds
    pub window_secs: u64,
    /// Maximum requests admitted per window
    pub max_requests: u64,
    /// Message returned when this override denies a request
    pub message: String,
}

/// Rate limiting tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiersConfig {
    /// Coarse volumetric protection, keyed by address alone
    #[serde(default = "default_global_tier")]
    pub global: TierLimit,

    /// Per-identity limit across all endpoints
    #[serde(default = "default_user_tier")]
    pub per_user: TierLimit,

    /// Short, small-ceiling limit for sensitive operations
    #[serde(default = "default_sensitive_tier")]
    pub sensitive: TierLimit,

    /// Tier-dependent ceilings for resource-intensive operations
    #[serde(default)]
    pub operation: OperationTierConfig,

    /// Path prefixes flagged as sensitive operations
    #[serde(default = "default_sensitive_paths")]
    pub sensitive_paths: Vec<String>,

    /// Path prefixes flagged as resource-intensive operations
    #[serde(default = "default_intensive_paths")]
    pub intensive_paths: Vec<String>,

    /// Per-route overrides, first matching prefix wins
    #[serde(default)]
    pub route_overrides: Vec<RouteOverride>,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            global: default_global_tier(),
            per_user: default_user_tier(),
            sensitive: default_sensitive_tier(),
            operation: OperationTierConfig::default(),
            sensitive_paths: default_sensitive_paths(),
            intensive_paths: default_intensive_paths(),
            route_overrides: Vec::new(),
        }
    }
}

fn default_global_tier() -> TierLimit {
    TierLimit {
        window_secs: 15 * 60,
        max_requests: 10_000,
        message: "Global rate limit exceeded".to_string(),
    }
}

fn default_user_tier() -> TierLimit {
    TierLimit {
        window_secs: 15 * 60,
        max_requests: 1_000,
        message: "User rate limit exceeded".to_string(),
    }
}

fn default_sensitive_tier() -> TierLimit {
    TierLimit {
        window_secs: 60,
        max_requests: 10,
        message: "Strict rate limit exceeded".to_string(),
    }
}

fn default_operation_window() -> u64 {
    60 * 60
}

fn default_operation_premium_max() -> u64 {
    1_000
}

fn default_operation_free_max() -> u64 {
    50
}

fn default_operation_premium_message() -> String {
    "AI operation rate limit exceeded (premium)".to_string()
}

fn default_operation_free_message() -> String {
    "AI operation rate limit exceeded (free tier)".to_string()
}

fn default_sensitive_paths() -> Vec<String> {
    vec![
        "/auth/refresh".to_string(),
        "/auth/revoke".to_string(),
        "/account/delete".to_string(),
    ]
}

fn default_intensive_paths() -> Vec<String> {
    vec!["/ai".to_string()]
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bound on live window entries; new keys beyond it fail open
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

fn default_max_entries() -> usize {
    100_000
}

/// Background eviction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictorConfig {
    /// Sweep period in seconds
    #[serde(default = "default_evictor_period")]
    pub period_secs: u64,

    /// Grace kept past a window's reset before its entry is removed
    #[serde(default = "default_evictor_grace")]
    pub grace_secs: u64,
}

impl Default for EvictorConfig {
    fn default() -> Self {
        Self {
            period_secs: default_evictor_period(),
            grace_secs: default_evictor_grace(),
        }
    }
}

fn default_evictor_period() -> u64 {
    5 * 60
}

fn default_evictor_grace() -> u64 {
    60
}

/// Suspicious-activity detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseConfig {
    /// Trailing history window in seconds
    #[serde(default = "default_abuse_window")]
    pub window_secs: u64,

    /// Entry count above which the request rate is suspicious
    #[serde(default = "default_rapid_request_threshold")]
    pub rapid_request_threshold: usize,

    /// Distinct source addresses above which the spread is suspicious
    #[serde(default = "default_source_address_threshold")]
    pub source_address_threshold: usize,

    /// Failed entry count above which the failure rate is suspicious
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// Cool-down returned with a block, in seconds
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Bound on the history fetch, in milliseconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            window_secs: default_abuse_window(),
            rapid_request_threshold: default_rapid_request_threshold(),
            source_address_threshold: default_source_address_threshold(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
            fetch_timeout_ms: default_fetch_timeout(),
        }
    }
}

fn default_abuse_window() -> u64 {
    60
}

fn default_rapid_request_threshold() -> usize {
    50
}

fn default_source_address_threshold() -> usize {
    3
}

fn default_failure_threshold() -> usize {
    10
}

fn default_cooldown() -> u64 {
    300
}

fn default_fetch_timeout() -> u64 {
    1_000
}

/// Audit queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Bounded queue capacity; events beyond it are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1_024
}
