//! Window counter store.
//!
//! The store is the only piece of mutable shared state in the admission
//! path. All mutation goes through [`WindowStore::evaluate`] and
//! [`WindowStore::evict_expired`]; callers never read a window state and
//! write it back separately.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::trace;

use super::policy::RatePolicy;

/// Default bound on the number of live window entries.
const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Errors raised by the window store.
///
/// The store itself has no user-visible failures; capacity exhaustion is an
/// infra-level fault the caller converts into a fail-open allow.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The entry budget is spent and the key is not already tracked
    #[error("window store at capacity ({capacity} entries), refusing new key")]
    CapacityExhausted {
        /// The configured entry bound
        capacity: usize,
    },
}

/// Counter state for one key's current window.
///
/// `reset_at` is always strictly after `window_start`. A request is
/// attributed to the window containing its evaluation time: when the
/// window has lapsed the state is replaced wholesale, never merged.
#[derive(Debug, Clone)]
pub struct WindowState {
    /// Requests charged to the current window
    pub count: u64,
    /// When the current window opened
    pub window_start: DateTime<Utc>,
    /// When the current window lapses
    pub reset_at: DateTime<Utc>,
    /// When this window opened, kept for diagnostics
    pub first_seen_at: DateTime<Utc>,
}

impl WindowState {
    fn fresh(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            reset_at: now + window,
            first_seen_at: now,
        }
    }
}

/// The admission decision for one evaluated request.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The policy ceiling the request was checked against
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window lapses
    pub reset_at: DateTime<Utc>,
    /// Whole seconds until retry is worthwhile, present only when denied
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    /// Response metadata for this decision.
    ///
    /// Always carries the limit/remaining/reset trio; `Retry-After` is
    /// appended when the request was denied.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_epoch_seconds().to_string()),
        ];
        if let Some(retry_after) = self.retry_after_secs {
            headers.push(("Retry-After", retry_after.to_string()));
        }
        headers
    }

    /// Window reset time as epoch seconds, rounded up.
    pub fn reset_epoch_seconds(&self) -> i64 {
        let millis = self.reset_at.timestamp_millis();
        (millis + 999).div_euclid(1000)
    }
}

/// Concurrency-safe mapping from counter key to window state.
///
/// Backed by a sharded map: evaluations for one key are linearized by the
/// shard's entry lock, evaluations for distinct keys proceed in parallel.
pub struct WindowStore {
    windows: DashMap<String, WindowState>,
    max_entries: usize,
}

impl WindowStore {
    /// Create a store with the default entry bound.
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    /// Create a store bounded to roughly `max_entries` live keys.
    ///
    /// The bound is approximate under concurrent inserts of new keys.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            windows: DashMap::new(),
            max_entries,
        }
    }

    /// Atomically attribute one request to `key`'s current window and
    /// decide whether it is admitted.
    ///
    /// The rollover check, state creation, and increment happen under one
    /// entry lock, so concurrent evaluations of the same key can never act
    /// on a stale pre-rollover state and the admitted count per window
    /// never exceeds the policy ceiling. A given key must always be charged
    /// with the same policy.
    pub fn evaluate(
        &self,
        key: &str,
        policy: &RatePolicy,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        if !self.windows.contains_key(key) && self.windows.len() >= self.max_entries {
            return Err(StoreError::CapacityExhausted {
                capacity: self.max_entries,
            });
        }

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowState::fresh(now, policy.window()));
        let state = entry.value_mut();

        if now >= state.reset_at {
            *state = WindowState::fresh(now, policy.window());
        }

        state.count += 1;

        let limit = policy.max_requests();
        let allowed = state.count <= limit;
        let remaining = limit.saturating_sub(state.count);
        let reset_at = state.reset_at;
        let count = state.count;
        drop(entry);

        let retry_after_secs = if allowed {
            None
        } else {
            let millis = (reset_at - now).num_milliseconds();
            Some(((millis + 999).div_euclid(1000)).max(1) as u64)
        };

        trace!(key = %key, count = count, limit = limit, allowed = allowed, "Evaluated window");

        Ok(Decision {
            allowed,
            limit,
            remaining,
            reset_at,
            retry_after_secs,
        })
    }

    /// Remove every entry whose window lapsed more than `grace` ago.
    ///
    /// Returns the number of entries removed. Locking is per shard; other
    /// keys stay evaluable throughout the sweep.
    pub fn evict_expired(&self, now: DateTime<Utc>, grace: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, state| now < state.reset_at + grace);
        before.saturating_sub(self.windows.len())
    }

    /// Whether a window is currently tracked for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.windows.contains_key(key)
    }

    /// Copy of the tracked state for `key`, for diagnostics and tests.
    pub fn snapshot(&self, key: &str) -> Option<WindowState> {
        self.windows.get(key).map(|state| state.clone())
    }

    /// Number of tracked windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether the store tracks no windows.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop all tracked windows. Primarily useful for testing.
    pub fn clear(&self) {
        self.windows.clear();
    }
}

impl Default for WindowStore {
    fn default() -> Self {
        Self::new()
    }
}
