//! The admission controller: the one entry point the serving layer calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::instrument;

use crate::abuse::{AbuseDetector, RequestHistory};
use crate::audit::{AuditLog, AuditSink};
use crate::config::{AbuseConfig, TurnstileConfig};
use crate::error::Result;
use crate::ratelimit::{Decision, Evictor, PolicyComposer, PolicyEngine, WindowStore};
use crate::request::RequestInfo;

/// Message returned with a suspicious-activity block.
const SUSPICIOUS_ACTIVITY_MESSAGE: &str = "Suspicious activity detected. Please try again later.";

/// Stable machine-readable denial codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    /// A rate limit tier denied the request
    RateLimitExceeded,
    /// The abuse detector blocked the identity
    SuspiciousActivity,
}

impl ReasonCode {
    /// Wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ReasonCode::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client-visible rejection. Calling code maps this to a 429-class
/// response.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// Machine-readable reason code
    pub code: ReasonCode,
    /// Human-readable denial message from the denying policy
    pub message: String,
    /// Whole seconds until retry is worthwhile
    pub retry_after_secs: u64,
    /// The denying tier's window decision; absent for abuse blocks
    pub decision: Option<Decision>,
}

impl Rejection {
    /// Response metadata for this rejection.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match &self.decision {
            Some(decision) => decision.headers(),
            None => vec![("Retry-After", self.retry_after_secs.to_string())],
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Forward the request, echoing the decision's headers
    Allowed(Decision),
    /// Reject the request
    Denied(Rejection),
}

impl Verdict {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed(_))
    }
}

/// Ties the composer, engine, detector, and evictor into one admission
/// pipeline owned by the server instance.
pub struct AdmissionController {
    store: Arc<WindowStore>,
    engine: PolicyEngine,
    composer: PolicyComposer,
    detector: Option<AbuseDetector>,
    evictor: Evictor,
    abuse_config: AbuseConfig,
    audit: AuditLog,
}

impl AdmissionController {
    /// Build a controller from configuration, auditing into `sink`.
    ///
    /// Fails on invalid tier parameters; nothing else can fail at runtime.
    /// Must be called within a Tokio runtime (the audit queue and evictor
    /// spawn background tasks).
    pub fn new(config: &TurnstileConfig, sink: Arc<dyn AuditSink>) -> Result<Self> {
        let audit = AuditLog::with_capacity(sink, config.audit.queue_capacity);
        Self::with_audit_log(config, audit)
    }

    /// Build a controller around an existing audit log handle.
    pub fn with_audit_log(config: &TurnstileConfig, audit: AuditLog) -> Result<Self> {
        let store = Arc::new(WindowStore::with_max_entries(config.store.max_entries));
        let engine = PolicyEngine::new(Arc::clone(&store), audit.clone());
        let composer = PolicyComposer::new(&config.tiers)?;
        let evictor = Evictor::new(
            Arc::clone(&store),
            Duration::from_secs(config.evictor.period_secs),
            Duration::from_secs(config.evictor.grace_secs),
        );

        Ok(Self {
            store,
            engine,
            composer,
            detector: None,
            evictor,
            abuse_config: config.abuse.clone(),
            audit,
        })
    }

    /// Enable the suspicious-activity check, reading from `history`.
    pub fn with_history(mut self, history: Arc<dyn RequestHistory>) -> Self {
        self.detector = Some(AbuseDetector::new(
            history,
            self.abuse_config.clone(),
            self.audit.clone(),
        ));
        self
    }

    /// Run the full admission check for one request.
    ///
    /// Tiers are evaluated coarse-first and short-circuit on the first
    /// denial, so counters of later tiers are never charged for a request
    /// that is already rejected. The abuse check runs last, only for
    /// authenticated requests that every tier admitted. On allow, the
    /// returned decision (and therefore the echoed headers) is the last
    /// evaluated tier's.
    #[instrument(skip(self, request), fields(path = %request.path, user = ?request.user_id))]
    pub async fn admit(&self, request: &RequestInfo) -> Verdict {
        let now = Utc::now();
        let mut admitted: Option<Decision> = None;

        for scoped in self.composer.compose(request) {
            let decision = self.engine.check_key(scoped.tier, &scoped.key, scoped.policy, now);
            if !decision.allowed {
                let retry_after_secs = decision.retry_after_secs.unwrap_or(1);
                return Verdict::Denied(Rejection {
                    code: ReasonCode::RateLimitExceeded,
                    message: scoped.policy.denial_message().to_string(),
                    retry_after_secs,
                    decision: Some(decision),
                });
            }
            admitted = Some(decision);
        }

        if let (Some(detector), Some(user_id)) = (&self.detector, request.user_id.as_deref()) {
            if let Some(block) = detector.assess(user_id, now).await {
                return Verdict::Denied(Rejection {
                    code: ReasonCode::SuspiciousActivity,
                    message: SUSPICIOUS_ACTIVITY_MESSAGE.to_string(),
                    retry_after_secs: block.retry_after_secs,
                    decision: None,
                });
            }
        }

        match admitted {
            Some(decision) => Verdict::Allowed(decision),
            // compose() always yields the global and per-user tiers; this
            // arm is unreachable but keeps the path panic-free.
            None => Verdict::Allowed(Decision {
                allowed: true,
                limit: 0,
                remaining: 0,
                reset_at: now,
                retry_after_secs: None,
            }),
        }
    }

    /// Start the background eviction sweep.
    pub fn start_eviction(&self) {
        self.evictor.start();
    }

    /// Stop the background eviction sweep. Idempotent.
    pub fn stop_eviction(&self) {
        self.evictor.stop();
    }

    /// The window store, for diagnostics and probes.
    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::{HistoryError, RequestHistoryEntry};
    use crate::audit::{AuditKind, MemoryAuditSink};
    use crate::config::TiersConfig;
    use crate::request::SubscriptionTier;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    fn controller(config: &TurnstileConfig) -> AdmissionController {
        AdmissionController::with_audit_log(config, AuditLog::disabled()).unwrap()
    }

    fn request() -> RequestInfo {
        RequestInfo::new("203.0.113.20", "GET", "/activities")
            .with_user_agent("Mozilla/5.0")
            .with_user("user-1")
    }

    #[tokio::test]
    async fn test_allowed_request_echoes_innermost_tier() {
        let config = TurnstileConfig::default();
        let controller = controller(&config);

        let verdict = controller.admit(&request()).await;
        let Verdict::Allowed(decision) = verdict else {
            panic!("expected allow");
        };
        // The last evaluated tier for a plain request is per-user.
        assert_eq!(decision.limit, 1_000);
        assert_eq!(decision.remaining, 999);
    }

    #[tokio::test]
    async fn test_denial_carries_code_message_and_retry() {
        let mut config = TurnstileConfig::default();
        config.tiers.global.max_requests = 2;
        let controller = controller(&config);

        assert!(controller.admit(&request()).await.is_allowed());
        assert!(controller.admit(&request()).await.is_allowed());

        let verdict = controller.admit(&request()).await;
        let Verdict::Denied(rejection) = verdict else {
            panic!("expected denial");
        };
        assert_eq!(rejection.code, ReasonCode::RateLimitExceeded);
        assert_eq!(rejection.code.as_str(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(rejection.message, "Global rate limit exceeded");
        assert!(rejection.retry_after_secs > 0);

        let decision = rejection.decision.as_ref().unwrap();
        assert_eq!(decision.remaining, 0);
        assert!(rejection
            .headers()
            .iter()
            .any(|(name, _)| *name == "Retry-After"));
    }

    #[tokio::test]
    async fn test_short_circuit_does_not_charge_later_tiers() {
        let mut config = TurnstileConfig::default();
        config.tiers.global.max_requests = 2;
        let controller = controller(&config);

        for _ in 0..4 {
            controller.admit(&request()).await;
        }

        // Only the two admitted requests reached the per-user tier.
        let user_state = controller.store().snapshot("user:user-1").unwrap();
        assert_eq!(user_state.count, 2);
        let global_state = controller.store().snapshot("global_ip:203.0.113.20").unwrap();
        assert_eq!(global_state.count, 4);
    }

    #[tokio::test]
    async fn test_premium_allowed_strictly_more_than_free() {
        let mut config = TurnstileConfig::default();
        config.tiers.operation.free_max = 2;
        config.tiers.operation.premium_max = 5;

        let controller = controller(&config);

        let free = RequestInfo::new("203.0.113.20", "POST", "/ai/chat").with_user("free-user");
        let premium = RequestInfo::new("203.0.113.21", "POST", "/ai/chat")
            .with_user("premium-user")
            .with_subscription(SubscriptionTier::Premium);

        let mut free_admitted = 0;
        let mut premium_admitted = 0;
        for _ in 0..6 {
            if controller.admit(&free).await.is_allowed() {
                free_admitted += 1;
            }
            if controller.admit(&premium).await.is_allowed() {
                premium_admitted += 1;
            }
        }

        assert_eq!(free_admitted, 2);
        assert_eq!(premium_admitted, 5);
        assert!(premium_admitted > free_admitted);
    }

    #[tokio::test]
    async fn test_sensitive_operation_uses_strict_ceiling() {
        let config = TurnstileConfig::default();
        let controller = controller(&config);

        let refresh = RequestInfo::new("203.0.113.20", "POST", "/auth/refresh")
            .with_user("user-1");
        let mut admitted = 0;
        for _ in 0..12 {
            if controller.admit(&refresh).await.is_allowed() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    struct BusyHistory;

    #[async_trait]
    impl crate::abuse::RequestHistory for BusyHistory {
        async fn recent_entries(
            &self,
            _user_id: &str,
            _since: DateTime<Utc>,
        ) -> std::result::Result<Vec<RequestHistoryEntry>, HistoryError> {
            Ok((0..60)
                .map(|i| RequestHistoryEntry {
                    key: "user-1".to_string(),
                    source_address: format!("198.51.100.{}", i % 5 + 1),
                    user_agent: "Mozilla/5.0".to_string(),
                    timestamp: Utc::now(),
                    failed: false,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_abuse_block_after_tiers_allow() {
        let config = TurnstileConfig::default();
        let controller = controller(&config).with_history(Arc::new(BusyHistory));

        let verdict = controller.admit(&request()).await;
        let Verdict::Denied(rejection) = verdict else {
            panic!("expected abuse block");
        };
        assert_eq!(rejection.code, ReasonCode::SuspiciousActivity);
        assert_eq!(rejection.code.as_str(), "SUSPICIOUS_ACTIVITY");
        assert_eq!(rejection.retry_after_secs, 300);
        assert!(rejection.decision.is_none());
        assert_eq!(
            rejection.headers(),
            vec![("Retry-After", "300".to_string())]
        );
    }

    #[tokio::test]
    async fn test_abuse_check_skipped_for_anonymous() {
        let config = TurnstileConfig::default();
        let controller = controller(&config).with_history(Arc::new(BusyHistory));

        let anonymous =
            RequestInfo::new("203.0.113.20", "GET", "/activities").with_user_agent("Mozilla/5.0");
        assert!(controller.admit(&anonymous).await.is_allowed());
    }

    #[tokio::test]
    async fn test_store_fault_fails_open_end_to_end() {
        let sink = Arc::new(MemoryAuditSink::new());
        let mut config = TurnstileConfig::default();
        config.store.max_entries = 0;
        let controller = AdmissionController::new(&config, sink.clone()).unwrap();

        // No window can be tracked at all, yet every request goes through.
        assert!(controller.admit(&request()).await.is_allowed());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(sink.count_of(AuditKind::StoreUnavailable) > 0);
    }

    #[tokio::test]
    async fn test_eviction_lifecycle_through_controller() {
        let config = TurnstileConfig::default();
        let controller = controller(&config);

        controller.stop_eviction();
        controller.start_eviction();
        controller.start_eviction();
        controller.stop_eviction();
        controller.stop_eviction();
    }

    #[test]
    fn test_composer_validation_fails_startup() {
        let mut config = TurnstileConfig::default();
        config.tiers.sensitive.max_requests = 0;
        let result = AdmissionController::with_audit_log(&config, AuditLog::disabled());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_default_tiers_config_is_valid() {
        assert!(PolicyComposer::new(&TiersConfig::default()).is_ok());
    }
}
