//! Server-side stream publishing.
//!
//! Each subscription runs as a publisher task that pulls from the actor's
//! value stream, consults the filter, numbers accepted frames, and pushes
//! them through the connection's bounded outbound queue (which is the
//! back-pressure path; there is no unbounded buffer between producer and
//! transport).
//!
//! The registry keeps a bounded buffer of frames already sent per stream.
//! It survives connection loss so a `StreamResume` can replay the tail the
//! client missed; a stream that terminated normally is removed, since
//! there is nothing left to resume.

use crate::delta::DeltaManager;
use crate::filter::{evaluate, FilterState};
use crate::registry::RegisteredActor;
use am_protocol::{
    encode_envelope, ActorId, Blob, Envelope, FilterSpec, StreamData, StreamEnd, StreamEndReason,
    StreamError,
};
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use super::ServerShared;

// ---------------------------------------------------------------------------
// Publisher registry
// ---------------------------------------------------------------------------

pub(crate) struct PublisherRecord {
    pub actor_id: ActorId,
    pub method: String,
    pub filter: Option<FilterSpec>,
    /// Highest sequence number emitted on this stream.
    pub last_seq: u64,
    /// Recently sent frames, oldest first.
    pub replay: VecDeque<StreamData>,
    /// Whether a live publisher task currently owns the stream.
    pub active: bool,
}

/// What a `StreamResume` should do.
pub(crate) enum ResumeAction {
    /// A publisher is already running; a duplicate resume is ignored so
    /// resuming twice equals resuming once.
    AlreadyActive,
    /// Replay the buffered tail, then continue publishing from
    /// `continue_from` with the subscription's original filter.
    Replay {
        frames: Vec<StreamData>,
        continue_from: u64,
        filter: Option<FilterSpec>,
    },
    /// Nothing retained: restart from the head, numbering from the
    /// client's checkpoint so overlap suppression keeps working.
    Fresh,
}

pub(crate) struct PublisherRegistry {
    inner: Mutex<HashMap<Uuid, PublisherRecord>>,
    capacity: usize,
}

impl PublisherRegistry {
    pub fn new(capacity: usize) -> Self {
        PublisherRegistry {
            inner: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Create the record for a freshly opened or restarted stream.
    pub fn open(
        &self,
        stream_id: Uuid,
        actor_id: ActorId,
        method: String,
        filter: Option<FilterSpec>,
        start_seq: u64,
    ) {
        self.inner.lock().expect("publisher registry poisoned").insert(
            stream_id,
            PublisherRecord {
                actor_id,
                method,
                filter,
                last_seq: start_seq,
                replay: VecDeque::new(),
                active: true,
            },
        );
    }

    /// Remember a sent frame for replay, evicting the oldest at capacity.
    pub fn record_sent(&self, stream_id: Uuid, frame: StreamData) {
        let mut inner = self.inner.lock().expect("publisher registry poisoned");
        if let Some(record) = inner.get_mut(&stream_id) {
            record.last_seq = frame.seq;
            record.replay.push_back(frame);
            while record.replay.len() > self.capacity {
                record.replay.pop_front();
            }
        }
    }

    /// The connection died mid-stream; keep the record for resume.
    pub fn park(&self, stream_id: Uuid) {
        if let Some(record) = self
            .inner
            .lock()
            .expect("publisher registry poisoned")
            .get_mut(&stream_id)
        {
            record.active = false;
        }
    }

    /// The stream terminated (end or error frame sent); nothing to resume.
    pub fn finish(&self, stream_id: Uuid) {
        self.inner
            .lock()
            .expect("publisher registry poisoned")
            .remove(&stream_id);
    }

    /// Resolve a `StreamResume` against the retained state.  When this
    /// returns [`ResumeAction::Replay`], the record has been re-marked
    /// active and the caller must start a continuation publisher.
    pub fn resume(&self, stream_id: Uuid, last_seq: u64) -> ResumeAction {
        let mut inner = self.inner.lock().expect("publisher registry poisoned");
        match inner.get_mut(&stream_id) {
            None => ResumeAction::Fresh,
            Some(record) if record.active => ResumeAction::AlreadyActive,
            Some(record) => {
                record.active = true;
                debug!(
                    stream_id = %stream_id,
                    actor_id = %record.actor_id,
                    method = %record.method,
                    last_seq,
                    "reactivating retained stream"
                );
                let frames = record
                    .replay
                    .iter()
                    .filter(|frame| frame.seq > last_seq)
                    .cloned()
                    .collect();
                ResumeAction::Replay {
                    frames,
                    continue_from: record.last_seq,
                    filter: record.filter.clone(),
                }
            }
        }
    }

    #[cfg(test)]
    pub fn last_seq(&self, stream_id: Uuid) -> Option<u64> {
        self.inner.lock().unwrap().get(&stream_id).map(|r| r.last_seq)
    }
}

// ---------------------------------------------------------------------------
// Publisher task
// ---------------------------------------------------------------------------

enum Outcome {
    End(StreamEndReason),
    Error(String),
}

/// Drive one stream until the source ends, the actor terminates, the
/// client unsubscribes, or the connection closes.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_publisher(
    shared: Arc<ServerShared>,
    actor: Arc<RegisteredActor>,
    stream_id: Uuid,
    method: String,
    filter: Option<FilterSpec>,
    start_seq: u64,
    out_tx: mpsc::Sender<Vec<u8>>,
    mut unsubscribed: watch::Receiver<bool>,
) {
    let mut source = match actor.open_stream(&method).await {
        Ok(source) => source,
        Err(message) => {
            warn!(stream_id = %stream_id, method = %method, error = %message, "stream open failed");
            finish_with(&shared, &actor, stream_id, &method, Outcome::Error(message), &out_tx).await;
            return;
        }
    };

    let mut filter_state = FilterState::new();
    let mut delta = actor.delta_strategy(&method).map(DeltaManager::new);
    let mut seq = start_seq;
    let mut terminated = actor.terminated();
    let mut phase_rx = shared.phase_tx.subscribe();

    // The termination receiver has already "seen" the current value, so an
    // actor that went away between resolve and here needs an upfront check.
    if *terminated.borrow() {
        finish_with(
            &shared,
            &actor,
            stream_id,
            &method,
            Outcome::End(StreamEndReason::ActorTerminated),
            &out_tx,
        )
        .await;
        return;
    }

    let outcome = loop {
        tokio::select! {
            _ = phase_rx.changed() => {
                if *phase_rx.borrow() == super::Phase::Stopped {
                    shared.publishers.park(stream_id);
                    return;
                }
            }
            changed = unsubscribed.changed() => {
                if changed.is_err() || *unsubscribed.borrow() {
                    break Outcome::End(StreamEndReason::ClientUnsubscribed);
                }
            }
            changed = terminated.changed() => {
                if changed.is_ok() && *terminated.borrow() {
                    break Outcome::End(StreamEndReason::ActorTerminated);
                }
            }
            item = source.next() => match item {
                None => break Outcome::End(StreamEndReason::Completed),
                Some(Err(message)) => break Outcome::Error(message),
                Some(Ok(value)) => {
                    if let Some(spec) = &filter {
                        // Rejected values do not consume a sequence number.
                        if !evaluate(spec, &mut filter_state, &value) {
                            continue;
                        }
                    }
                    let payload = match &mut delta {
                        Some(manager) => match serde_json::to_vec(&manager.wrap(&value)) {
                            Ok(bytes) => Blob::new(bytes),
                            Err(e) => break Outcome::Error(format!("delta encoding failed: {e}")),
                        },
                        None => Blob::new(value),
                    };
                    seq += 1;
                    let frame = StreamData {
                        stream_id,
                        seq,
                        payload,
                        timestamp: Utc::now(),
                    };
                    shared.publishers.record_sent(stream_id, frame.clone());
                    match encode_envelope(&Envelope::StreamData(frame)) {
                        Ok(bytes) => {
                            if out_tx.send(bytes).await.is_err() {
                                // Connection gone: no terminator frame; the
                                // peer detects closure.  Park for resume.
                                debug!(stream_id = %stream_id, "connection closed mid-stream; parking");
                                shared.publishers.park(stream_id);
                                return;
                            }
                        }
                        Err(e) => break Outcome::Error(format!("encoding failed: {e}")),
                    }
                }
            }
        }
    };

    finish_with(&shared, &actor, stream_id, &method, outcome, &out_tx).await;
}

/// Send the single terminator frame and drop the publisher record.
async fn finish_with(
    shared: &ServerShared,
    actor: &RegisteredActor,
    stream_id: Uuid,
    method: &str,
    outcome: Outcome,
    out_tx: &mpsc::Sender<Vec<u8>>,
) {
    shared.hooks.stream_end(&actor.id, method);
    let envelope = match outcome {
        Outcome::End(reason) => Envelope::StreamEnd(StreamEnd { stream_id, reason }),
        Outcome::Error(message) => Envelope::StreamError(StreamError { stream_id, message }),
    };
    match encode_envelope(&envelope) {
        Ok(bytes) => {
            if out_tx.send(bytes).await.is_err() {
                // Terminator undeliverable: the connection closed first, so
                // the stream stays resumable instead of finished.
                shared.publishers.park(stream_id);
                return;
            }
        }
        Err(e) => warn!(stream_id = %stream_id, error = %e, "terminator encoding failed"),
    }
    shared.publishers.finish(stream_id);
}
