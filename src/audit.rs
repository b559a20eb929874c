//! Audit event dispatch.
//!
//! Admission control emits structured event records for rate-limit
//! exceedances, suspicious-activity detections, and internal faults. The
//! dispatch is fire-and-forget: events go through a bounded queue drained
//! by a background task, and neither a full queue nor a failing sink may
//! ever stall or abort the request path.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default capacity of the audit queue.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Classification of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A request was denied by a rate limit tier. Expected, high-frequency.
    RateLimitExceeded,
    /// The abuse detector blocked an identity.
    SuspiciousActivityDetected,
    /// The window store refused an evaluation; the request was let through.
    StoreUnavailable,
    /// The request-history collaborator was unreachable or timed out.
    HistoryLookupFailed,
}

/// A structured audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Unique event id
    pub id: Uuid,
    /// Event classification
    pub kind: AuditKind,
    /// Free-form event payload
    pub payload: serde_json::Value,
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Create an event stamped with the current time.
    pub fn new(kind: AuditKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for audit records.
///
/// Implementations must tolerate being called concurrently. Write failures
/// are swallowed at the dispatch boundary and only logged.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one event.
    async fn record(&self, event: AuditEvent) -> std::result::Result<(), SinkError>;
}

/// Error returned by an audit sink write.
#[derive(Debug, thiserror::Error)]
#[error("audit sink write failed: {0}")]
pub struct SinkError(pub String);

/// Cloneable handle for emitting audit events.
///
/// `emit` never blocks: events are pushed onto a bounded queue with
/// `try_send` and dropped (with a debug log) when the queue is full or the
/// drain task is gone.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditLog {
    /// Create an audit log draining into `sink` with the default queue capacity.
    ///
    /// Spawns the drain task, so this must be called within a Tokio runtime.
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self::with_capacity(sink, DEFAULT_QUEUE_CAPACITY)
    }

    /// Create an audit log with an explicit queue capacity.
    pub fn with_capacity(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.record(event).await {
                    warn!(error = %e, "Audit sink write failed, event dropped");
                }
            }
        });

        Self { tx }
    }

    /// Create an audit log that discards every event.
    pub fn disabled() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }

    /// Queue an event for recording. Never blocks, never fails the caller.
    pub fn emit(&self, kind: AuditKind, payload: serde_json::Value) {
        let event = AuditEvent::new(kind, payload);
        if let Err(e) = self.tx.try_send(event) {
            debug!(error = %e, "Audit queue rejected event");
        }
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

/// Audit sink that emits events as structured log records.
///
/// Severity follows the error-handling policy: store faults are errors,
/// collaborator faults are warnings, and rate-limit exceedances stay at
/// info since they are expected control-flow outcomes.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> std::result::Result<(), SinkError> {
        match event.kind {
            AuditKind::StoreUnavailable => {
                error!(id = %event.id, payload = %event.payload, "Window store unavailable");
            }
            AuditKind::HistoryLookupFailed => {
                warn!(id = %event.id, payload = %event.payload, "Request history lookup failed");
            }
            AuditKind::SuspiciousActivityDetected => {
                warn!(id = %event.id, payload = %event.payload, "Suspicious activity detected");
            }
            AuditKind::RateLimitExceeded => {
                info!(id = %event.id, payload = %event.payload, "Rate limit exceeded");
            }
        }
        Ok(())
    }
}

/// In-memory audit sink for inspection in tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: parking_lot::Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events of the given kind.
    pub fn count_of(&self, kind: AuditKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> std::result::Result<(), SinkError> {
        self.events.lock().push(event);
        Ok(())
    }
}
