//! In-flight invocation accounting and health reporting.

use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Mutex-guarded counter plus a notification that fires on reaching zero.
/// The drain path selects between the zero notification and its timeout.
pub(crate) struct Inflight {
    count: Mutex<u64>,
    zero: Notify,
}

impl Inflight {
    pub fn new() -> Arc<Self> {
        Arc::new(Inflight {
            count: Mutex::new(0),
            zero: Notify::new(),
        })
    }

    pub fn begin(self: &Arc<Self>) -> InflightGuard {
        *self.count.lock().expect("inflight counter poisoned") += 1;
        InflightGuard {
            inflight: Arc::clone(self),
        }
    }

    pub fn count(&self) -> u64 {
        *self.count.lock().expect("inflight counter poisoned")
    }

    /// Wait until the counter reaches zero (returns immediately if it
    /// already is).
    pub async fn wait_zero(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct InflightGuard {
    inflight: Arc<Inflight>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut count = self
            .inflight
            .count
            .lock()
            .expect("inflight counter poisoned");
        *count -= 1;
        if *count == 0 {
            self.inflight.zero.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Draining,
    Unhealthy,
}

/// Snapshot for external health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub inflight: u64,
}
