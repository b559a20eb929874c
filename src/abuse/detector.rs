//! Heuristic suspicious-activity detection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::audit::{AuditKind, AuditLog};
use crate::config::AbuseConfig;

use super::history::{RequestHistory, RequestHistoryEntry};

/// Indicators must agree before an identity is blocked. A single indicator
/// alone (e.g. one shared NAT address) is not enough.
const BLOCK_THRESHOLD: usize = 2;

/// User-Agent fragments that mark automation traffic.
const AUTOMATION_SIGNATURES: &[&str] = &[
    "bot", "crawler", "spider", "scraper", "curl", "wget", "python", "java", "postman",
    "insomnia",
];

/// The named indicators computed from one identity's recent history.
///
/// Computed fresh per evaluation, never persisted.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SuspicionIndicators {
    /// Entry count in the window exceeded the rapid-request threshold
    pub rapid_requests: bool,
    /// Distinct source addresses exceeded the spread threshold
    pub multiple_source_addresses: bool,
    /// The most recent entry's User-Agent matches an automation signature
    pub unusual_user_agent: bool,
    /// Failed entries exceeded the failure threshold
    pub repeated_failures: bool,
}

impl SuspicionIndicators {
    /// Number of indicators currently raised.
    pub fn active_count(&self) -> usize {
        [
            self.rapid_requests,
            self.multiple_source_addresses,
            self.unusual_user_agent,
            self.repeated_failures,
        ]
        .iter()
        .filter(|raised| **raised)
        .count()
    }
}

/// A temporary block raised against an identity.
#[derive(Debug, Clone)]
pub struct AbuseBlock {
    /// Fixed cool-down, independent of any rate limit retry-after
    pub retry_after_secs: u64,
    /// The indicators that triggered the block
    pub indicators: SuspicionIndicators,
}

/// Inspects recent request history and blocks identities whose combined
/// indicators cross the threshold.
///
/// Advisory and secondary: it runs only after the rate limiter has already
/// admitted the request, and it fails open whenever history cannot be
/// fetched in time.
pub struct AbuseDetector {
    history: Arc<dyn RequestHistory>,
    config: AbuseConfig,
    audit: AuditLog,
}

impl AbuseDetector {
    /// Create a detector reading from `history`.
    pub fn new(history: Arc<dyn RequestHistory>, config: AbuseConfig, audit: AuditLog) -> Self {
        Self {
            history,
            config,
            audit,
        }
    }

    /// Assess one authenticated identity. Returns a block when at least
    /// two indicators are raised, `None` otherwise or on any fetch fault.
    pub async fn assess(&self, user_id: &str, now: DateTime<Utc>) -> Option<AbuseBlock> {
        let since = now - Duration::from_secs(self.config.window_secs);
        let fetch_timeout = Duration::from_millis(self.config.fetch_timeout_ms);

        let entries = match tokio::time::timeout(
            fetch_timeout,
            self.history.recent_entries(user_id, since),
        )
        .await
        {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                warn!(user_id = %user_id, error = %e, "History lookup failed, skipping abuse check");
                self.audit.emit(
                    AuditKind::HistoryLookupFailed,
                    json!({"user_id": user_id, "error": e.to_string()}),
                );
                return None;
            }
            Err(_) => {
                warn!(
                    user_id = %user_id,
                    timeout_ms = self.config.fetch_timeout_ms,
                    "History lookup timed out, skipping abuse check"
                );
                self.audit.emit(
                    AuditKind::HistoryLookupFailed,
                    json!({"user_id": user_id, "error": "lookup timed out"}),
                );
                return None;
            }
        };

        let indicators = self.indicators(&entries);
        let active = indicators.active_count();

        if active < BLOCK_THRESHOLD {
            debug!(user_id = %user_id, active = active, "Activity within normal bounds");
            return None;
        }

        warn!(
            user_id = %user_id,
            indicators = ?indicators,
            entries = entries.len(),
            "Blocking identity for suspicious activity"
        );
        self.audit.emit(
            AuditKind::SuspiciousActivityDetected,
            json!({
                "user_id": user_id,
                "indicators": indicators,
                "active_count": active,
                "recent_request_count": entries.len(),
            }),
        );

        Some(AbuseBlock {
            retry_after_secs: self.config.cooldown_secs,
            indicators,
        })
    }

    fn indicators(&self, entries: &[RequestHistoryEntry]) -> SuspicionIndicators {
        let distinct_addresses: HashSet<&str> = entries
            .iter()
            .map(|entry| entry.source_address.as_str())
            .collect();

        let latest_agent = entries
            .iter()
            .max_by_key(|entry| entry.timestamp)
            .map(|entry| entry.user_agent.as_str());

        let failures = entries.iter().filter(|entry| entry.failed).count();

        SuspicionIndicators {
            rapid_requests: entries.len() > self.config.rapid_request_threshold,
            multiple_source_addresses: distinct_addresses.len()
                > self.config.source_address_threshold,
            unusual_user_agent: latest_agent.map(is_automation_agent).unwrap_or(false),
            repeated_failures: failures > self.config.failure_threshold,
        }
    }
}

/// Case-insensitive match against the automation signature list.
fn is_automation_agent(user_agent: &str) -> bool {
    let lowered = user_agent.to_ascii_lowercase();
    AUTOMATION_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::history::HistoryError;
    use crate::audit::MemoryAuditSink;
    use async_trait::async_trait;

    struct FixedHistory {
        entries: Vec<RequestHistoryEntry>,
    }

    #[async_trait]
    impl RequestHistory for FixedHistory {
        async fn recent_entries(
            &self,
            _user_id: &str,
            since: DateTime<Utc>,
        ) -> Result<Vec<RequestHistoryEntry>, HistoryError> {
            Ok(self
                .entries
                .iter()
                .filter(|entry| entry.timestamp >= since)
                .cloned()
                .collect())
        }
    }

    struct BrokenHistory;

    #[async_trait]
    impl RequestHistory for BrokenHistory {
        async fn recent_entries(
            &self,
            _user_id: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<RequestHistoryEntry>, HistoryError> {
            Err(HistoryError::Unavailable("connection refused".to_string()))
        }
    }

    struct SlowHistory;

    #[async_trait]
    impl RequestHistory for SlowHistory {
        async fn recent_entries(
            &self,
            _user_id: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<RequestHistoryEntry>, HistoryError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    fn entry(address: &str, agent: &str, failed: bool, age_secs: u64) -> RequestHistoryEntry {
        RequestHistoryEntry {
            key: "user-1".to_string(),
            source_address: address.to_string(),
            user_agent: agent.to_string(),
            timestamp: Utc::now() - Duration::from_secs(age_secs),
            failed,
        }
    }

    fn detector(entries: Vec<RequestHistoryEntry>) -> AbuseDetector {
        AbuseDetector::new(
            Arc::new(FixedHistory { entries }),
            AbuseConfig::default(),
            AuditLog::disabled(),
        )
    }

    #[tokio::test]
    async fn test_quiet_history_is_not_blocked() {
        let entries = (0..5)
            .map(|i| entry("198.51.100.1", "Mozilla/5.0", false, i))
            .collect();
        assert!(detector(entries).assess("user-1", Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn test_single_indicator_is_not_blocked() {
        // Rapid requests alone: 60 entries, one address, browser agent.
        let entries = (0..60)
            .map(|_| entry("198.51.100.1", "Mozilla/5.0", false, 1))
            .collect();
        assert!(detector(entries).assess("user-1", Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn test_two_indicators_block_with_cooldown() {
        // Rapid requests from four distinct addresses.
        let entries: Vec<_> = (0..60)
            .map(|i| entry(&format!("198.51.100.{}", i % 4 + 1), "Mozilla/5.0", false, 1))
            .collect();

        let block = detector(entries)
            .assess("user-1", Utc::now())
            .await
            .expect("two indicators must block");
        assert_eq!(block.retry_after_secs, 300);
        assert!(block.indicators.rapid_requests);
        assert!(block.indicators.multiple_source_addresses);
        assert_eq!(block.indicators.active_count(), 2);
    }

    #[tokio::test]
    async fn test_failures_and_automation_agent_block() {
        let mut entries: Vec<_> = (0..12)
            .map(|i| entry("198.51.100.1", "python-requests/2.31", true, 10 - (i % 10)))
            .collect();
        entries.push(entry("198.51.100.1", "curl/8.4.0", false, 0));

        let block = detector(entries)
            .assess("user-1", Utc::now())
            .await
            .expect("failures plus automation agent must block");
        assert!(block.indicators.repeated_failures);
        assert!(block.indicators.unusual_user_agent);
    }

    #[tokio::test]
    async fn test_only_latest_agent_counts_for_unusual_user_agent() {
        // Automation agent deep in the history, browser on the latest entry.
        let mut entries = vec![entry("198.51.100.1", "curl/8.4.0", false, 50)];
        entries.extend((0..12).map(|_| entry("198.51.100.1", "Mozilla/5.0", true, 1)));

        let detector = detector(entries);
        let block = detector.assess("user-1", Utc::now()).await;
        // Repeated failures alone: one indicator, no block.
        assert!(block.is_none());
    }

    #[tokio::test]
    async fn test_history_error_fails_open() {
        let sink = Arc::new(MemoryAuditSink::new());
        let detector = AbuseDetector::new(
            Arc::new(BrokenHistory),
            AbuseConfig::default(),
            AuditLog::new(sink.clone()),
        );

        assert!(detector.assess("user-1", Utc::now()).await.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.count_of(AuditKind::HistoryLookupFailed), 1);
    }

    #[tokio::test]
    async fn test_history_timeout_fails_open() {
        let sink = Arc::new(MemoryAuditSink::new());
        let config = AbuseConfig {
            fetch_timeout_ms: 20,
            ..AbuseConfig::default()
        };
        let detector =
            AbuseDetector::new(Arc::new(SlowHistory), config, AuditLog::new(sink.clone()));

        assert!(detector.assess("user-1", Utc::now()).await.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.count_of(AuditKind::HistoryLookupFailed), 1);
    }

    #[tokio::test]
    async fn test_block_emits_audit_record() {
        let sink = Arc::new(MemoryAuditSink::new());
        let entries: Vec<_> = (0..60)
            .map(|i| entry(&format!("198.51.100.{}", i % 4 + 1), "Mozilla/5.0", false, 1))
            .collect();
        let detector = AbuseDetector::new(
            Arc::new(FixedHistory { entries }),
            AbuseConfig::default(),
            AuditLog::new(sink.clone()),
        );

        detector.assess("user-1", Utc::now()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditKind::SuspiciousActivityDetected);
        assert_eq!(events[0].payload["user_id"], "user-1");
        assert_eq!(events[0].payload["indicators"]["rapid_requests"], true);
    }

    #[test]
    fn test_automation_signatures() {
        assert!(is_automation_agent("curl/8.4.0"));
        assert!(is_automation_agent("Googlebot/2.1"));
        assert!(is_automation_agent("python-requests/2.31"));
        assert!(is_automation_agent("PostmanRuntime/7.36"));
        assert!(!is_automation_agent(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64)"
        ));
        assert!(!is_automation_agent(""));
    }
}
