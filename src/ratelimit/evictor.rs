//! Background eviction of lapsed windows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::store::WindowStore;

/// Periodic sweep that bounds store memory.
///
/// Removes entries whose window lapsed more than the grace period ago.
/// The sweep shares the store's per-shard locking, so evaluations on other
/// keys proceed while it runs. `start` and `stop` are idempotent and the
/// task is aborted on drop, so it cannot outlive its owner.
pub struct Evictor {
    store: Arc<WindowStore>,
    period: Duration,
    grace: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Evictor {
    /// Create an evictor over `store`, sweeping every `period` and keeping
    /// entries for `grace` past their reset.
    pub fn new(store: Arc<WindowStore>, period: Duration, grace: Duration) -> Self {
        Self {
            store,
            period,
            grace,
            task: Mutex::new(None),
        }
    }

    /// Start the periodic sweep. No-op if it is already running.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let store = Arc::clone(&self.store);
        let period = self.period;
        let grace = self.grace;

        info!(period_secs = period.as_secs(), "Starting window eviction sweep");

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a fresh interval fires immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = store.evict_expired(Utc::now(), grace);
                if removed > 0 {
                    debug!(removed = removed, "Evicted lapsed windows");
                }
            }
        }));
    }

    /// Stop the sweep. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("Stopped window eviction sweep");
        }
    }

    /// Whether the sweep task is currently running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
