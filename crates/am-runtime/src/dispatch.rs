//! Pending-call correlation.
//!
//! Every remote call registers a single-use waiter keyed by its call ID.
//! The session task that reads responses completes the waiter; the entry
//! is removed on completion, connection loss, cancellation, and timeout.

use am_protocol::Response;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
pub(crate) struct PendingCalls {
    inner: Mutex<HashMap<Uuid, oneshot::Sender<Response>>>,
}

impl PendingCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter for `call_id`.
    ///
    /// The returned guard removes the entry when dropped, which is what
    /// keeps the table clean when the caller is cancelled mid-wait; a late
    /// response then finds no waiter and is discarded.
    pub fn register(self: &Arc<Self>, call_id: Uuid) -> (PendingCallGuard, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .expect("pending-call table poisoned")
            .insert(call_id, tx);
        (
            PendingCallGuard {
                table: Arc::clone(self),
                call_id,
            },
            rx,
        )
    }

    /// Complete the waiter for a response's call ID.
    ///
    /// A response with no matching waiter (already completed, cancelled, or
    /// never issued) is logged and discarded — each call ID is used once.
    pub fn complete(&self, response: Response) {
        let waiter = self
            .inner
            .lock()
            .expect("pending-call table poisoned")
            .remove(&response.call_id);
        match waiter {
            Some(tx) => {
                // The receiver may have been dropped between removal and
                // send; that is the cancellation race and is harmless.
                let _ = tx.send(response);
            }
            None => {
                debug!(call_id = %response.call_id, "discarding response with no pending call");
            }
        }
    }

    /// Fail every pending waiter; used when the transport session closes.
    ///
    /// Dropping the senders makes every waiting receiver observe closure,
    /// which callers surface as `connection-closed`.
    pub fn fail_all(&self) {
        let drained: Vec<Uuid> = {
            let mut inner = self.inner.lock().expect("pending-call table poisoned");
            let ids = inner.keys().copied().collect();
            inner.clear();
            ids
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending calls on connection loss");
        }
    }

    pub fn remove(&self, call_id: &Uuid) {
        self.inner
            .lock()
            .expect("pending-call table poisoned")
            .remove(call_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Removes the pending entry on drop.
pub(crate) struct PendingCallGuard {
    table: Arc<PendingCalls>,
    call_id: Uuid,
}

impl Drop for PendingCallGuard {
    fn drop(&mut self) {
        self.table.remove(&self.call_id);
    }
}
