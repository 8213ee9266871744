//! Client-side stream checkpoints.
//!
//! One record per stream: the last sequence received plus enough identity
//! to ask the server to continue.  Records expire by age; an expired
//! checkpoint means the stream is treated as terminated rather than
//! resumed.

use am_protocol::ActorId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub stream_id: Uuid,
    pub last_seq: u64,
    pub actor_id: ActorId,
    pub method: String,
    pub created_at: Instant,
}

pub(crate) struct CheckpointStore {
    inner: Mutex<HashMap<Uuid, Checkpoint>>,
    max_age: Duration,
}

impl CheckpointStore {
    pub fn new(max_age: Duration) -> Self {
        CheckpointStore {
            inner: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    /// Record the latest sequence for a stream.  The timestamp refreshes
    /// on every update, so only streams that stopped receiving age out.
    pub fn record(&self, stream_id: Uuid, last_seq: u64, actor_id: &ActorId, method: &str) {
        self.inner.lock().expect("checkpoint store poisoned").insert(
            stream_id,
            Checkpoint {
                stream_id,
                last_seq,
                actor_id: actor_id.clone(),
                method: method.to_owned(),
                created_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self, stream_id: Uuid) {
        self.inner
            .lock()
            .expect("checkpoint store poisoned")
            .remove(&stream_id);
    }

    /// Split into still-valid checkpoints (kept, returned for resume) and
    /// expired stream IDs (dropped).
    pub fn take_for_resume(&self) -> (Vec<Checkpoint>, Vec<Uuid>) {
        let mut inner = self.inner.lock().expect("checkpoint store poisoned");
        let now = Instant::now();
        let expired: Vec<Uuid> = inner
            .iter()
            .filter(|(_, cp)| now.duration_since(cp.created_at) > self.max_age)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            inner.remove(id);
        }
        let mut valid: Vec<Checkpoint> = inner.values().cloned().collect();
        valid.sort_by_key(|cp| cp.stream_id);
        (valid, expired)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
