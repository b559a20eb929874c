//! Request history collaborator contract.
//!
//! The serving backend keeps an append-only log of handled requests. The
//! abuse detector only ever reads a trailing window of it; this crate
//! never writes entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// One logged request, as recorded by the serving backend.
#[derive(Debug, Clone)]
pub struct RequestHistoryEntry {
    /// Counter key the request was charged against
    pub key: String,
    /// Caller's network address
    pub source_address: String,
    /// Raw User-Agent header
    pub user_agent: String,
    /// When the request was handled
    pub timestamp: DateTime<Utc>,
    /// Whether the request failed
    pub failed: bool,
}

/// Errors raised by the history collaborator.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The backing store could not be reached
    #[error("history backend unavailable: {0}")]
    Unavailable(String),

    /// The query was rejected or failed mid-flight
    #[error("history query failed: {0}")]
    Query(String),
}

/// Read access to the request history log.
#[async_trait]
pub trait RequestHistory: Send + Sync {
    /// Entries recorded for `user_id` at or after `since`.
    async fn recent_entries(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestHistoryEntry>, HistoryError>;
}
