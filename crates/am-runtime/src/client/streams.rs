//! Client-side stream registry.
//!
//! Keyed by stream ID.  An entry is created under a client-generated
//! provisional ID *before* the subscribe envelope goes out, so server
//! frames can never race the consumer structure into existence; the
//! canonical `StreamStart` re-keys it.  Frames are delivered in sequence
//! order; duplicates and reordering are dropped by the
//! `seq > last_seq` check.

use crate::delta::DeltaApplier;
use am_protocol::{ActorId, DeltaPayload, StreamData, StreamEndReason, StreamStart};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// What a consumer receives.
#[derive(Debug)]
pub(crate) enum StreamItem {
    Data(Vec<u8>),
    End(StreamEndReason),
    Error(String),
}

/// Everything the route needs to checkpoint an accepted frame.
pub(crate) struct CheckpointUpdate {
    pub stream_id: Uuid,
    pub seq: u64,
    pub actor_id: ActorId,
    pub method: String,
}

struct StreamEntry {
    call_id: Uuid,
    provisional_id: Uuid,
    canonical: bool,
    actor_id: ActorId,
    method: String,
    last_seq: u64,
    /// Resume cache of delivered `(seq, payload)` pairs; never flushed to
    /// the consumer.
    ring: VecDeque<(u64, Vec<u8>)>,
    /// Payloads that arrived before the consumer attached.
    holding: VecDeque<Vec<u8>>,
    subscriber: Option<mpsc::Sender<StreamItem>>,
    delta: Option<DeltaApplier>,
    registered_at: Instant,
}

pub(crate) struct StreamRegistry {
    inner: Mutex<HashMap<Uuid, StreamEntry>>,
    ring_capacity: usize,
}

impl StreamRegistry {
    pub fn new(ring_capacity: usize) -> Self {
        StreamRegistry {
            inner: Mutex::new(HashMap::new()),
            ring_capacity,
        }
    }

    /// Create the consumer structure ahead of the subscribe envelope.
    pub async fn preregister(
        &self,
        provisional: Uuid,
        call_id: Uuid,
        actor_id: ActorId,
        method: String,
        delta: Option<DeltaApplier>,
    ) {
        self.inner.lock().await.insert(
            provisional,
            StreamEntry {
                call_id,
                provisional_id: provisional,
                canonical: false,
                actor_id,
                method,
                last_seq: 0,
                ring: VecDeque::new(),
                holding: VecDeque::new(),
                subscriber: None,
                delta,
                registered_at: Instant::now(),
            },
        );
    }

    /// Attach the consumer, flushing the holding queue in order first.
    pub async fn attach(&self, provisional: Uuid, sender: mpsc::Sender<StreamItem>) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = entry_by_provisional(&mut inner, provisional) else {
            // Terminated before the consumer attached; dropping the sender
            // ends the subscription immediately.
            return;
        };
        while let Some(payload) = entry.holding.pop_front() {
            if sender.send(StreamItem::Data(payload)).await.is_err() {
                return;
            }
        }
        entry.subscriber = Some(sender);
    }

    /// Re-key from the provisional ID to the server's canonical one.
    pub async fn rekey(&self, start: &StreamStart) {
        let mut inner = self.inner.lock().await;
        let provisional = inner
            .iter()
            .find(|(_, entry)| entry.call_id == start.call_id && !entry.canonical)
            .map(|(id, _)| *id);
        match provisional {
            Some(old_key) => {
                let mut entry = inner.remove(&old_key).expect("entry just found");
                entry.canonical = true;
                debug!(provisional = %old_key, canonical = %start.stream_id, "stream re-keyed");
                inner.insert(start.stream_id, entry);
            }
            None => {
                debug!(call_id = %start.call_id, stream_id = %start.stream_id, "stream start with no pending subscription");
            }
        }
    }

    /// Ordered, gap-aware delivery.  Returns checkpoint info when the
    /// frame was accepted.
    pub async fn on_data(&self, frame: StreamData) -> Option<CheckpointUpdate> {
        let mut inner = self.inner.lock().await;
        let entry = match inner.get_mut(&frame.stream_id) {
            Some(entry) => entry,
            None => {
                debug!(stream_id = %frame.stream_id, "data for unknown stream dropped");
                return None;
            }
        };
        if frame.seq <= entry.last_seq {
            // A seq we still hold in the resume cache is a replay overlap;
            // anything else is reordering.
            let replayed = entry.ring.iter().any(|(seq, _)| *seq == frame.seq);
            debug!(
                stream_id = %frame.stream_id,
                seq = frame.seq,
                last_seq = entry.last_seq,
                replayed,
                "duplicate or out-of-order frame dropped"
            );
            return None;
        }
        entry.last_seq = frame.seq;

        let unwrapped = match &mut entry.delta {
            Some(applier) => match serde_json::from_slice::<DeltaPayload>(frame.payload.as_bytes())
            {
                Ok(wrapped) => applier.unwrap(wrapped).map_err(|e| e.to_string()),
                Err(e) => Err(format!("delta payload decode failed: {e}")),
            },
            None => Ok(frame.payload.into_bytes()),
        };
        let payload = match unwrapped {
            Ok(payload) => payload,
            Err(message) => {
                // A broken delta chain is unrecoverable for this stream.
                warn!(stream_id = %frame.stream_id, error = %message, "terminating stream");
                if let Some(mut entry) = inner.remove(&frame.stream_id) {
                    terminate_locked(&mut entry, StreamItem::Error(message)).await;
                }
                return None;
            }
        };

        entry.ring.push_back((frame.seq, payload.clone()));
        while entry.ring.len() > self.ring_capacity {
            entry.ring.pop_front();
        }

        match &entry.subscriber {
            Some(sender) => {
                // A closed receiver means the consumer dropped its handle;
                // the subscription's drop path tells the server.
                let _ = sender.send(StreamItem::Data(payload)).await;
            }
            None => entry.holding.push_back(payload),
        }

        Some(CheckpointUpdate {
            stream_id: frame.stream_id,
            seq: frame.seq,
            actor_id: entry.actor_id.clone(),
            method: entry.method.clone(),
        })
    }

    /// Terminate normally; true when an entry existed.
    pub async fn on_end(&self, stream_id: Uuid, reason: StreamEndReason) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.remove(&stream_id) {
            Some(mut entry) => {
                terminate_locked(&mut entry, StreamItem::End(reason)).await;
                true
            }
            None => false,
        }
    }

    /// Terminate with a surfaced error; true when an entry existed.
    pub async fn on_error(&self, stream_id: Uuid, message: String) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.remove(&stream_id) {
            Some(mut entry) => {
                terminate_locked(&mut entry, StreamItem::Error(message)).await;
                true
            }
            None => false,
        }
    }

    /// Consumer dropped its handle: remove the entry and report the key to
    /// unsubscribe with (canonical when re-keyed).
    pub async fn remove_for_unsubscribe(&self, provisional: Uuid) -> Option<Uuid> {
        let mut inner = self.inner.lock().await;
        let key = inner
            .iter()
            .find(|(_, entry)| entry.provisional_id == provisional)
            .map(|(id, _)| *id)?;
        inner.remove(&key);
        Some(key)
    }

    /// Connection lost: provisional entries can never be re-keyed or
    /// resumed, so their consumers terminate with connection-closed.
    /// Canonical entries stay, awaiting checkpoint resume.
    pub async fn drop_provisional_on_disconnect(&self) {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<Uuid> = inner
            .iter()
            .filter(|(_, entry)| !entry.canonical)
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            if let Some(mut entry) = inner.remove(&id) {
                terminate_locked(&mut entry, StreamItem::End(StreamEndReason::ConnectionClosed))
                    .await;
            }
        }
    }

    /// Reap provisional entries whose canonical rebind never arrived.
    pub async fn reap_stale_provisional(&self, grace: Duration) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let doomed: Vec<Uuid> = inner
            .iter()
            .filter(|(_, entry)| {
                !entry.canonical && now.duration_since(entry.registered_at) > grace
            })
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            if let Some(mut entry) = inner.remove(&id) {
                warn!(stream_id = %id, "provisional stream never confirmed; reaping");
                terminate_locked(&mut entry, StreamItem::End(StreamEndReason::ConnectionClosed))
                    .await;
            }
        }
    }

    /// Terminate a single stream (expired checkpoint path).
    pub async fn terminate(&self, stream_id: Uuid, reason: StreamEndReason) {
        let mut inner = self.inner.lock().await;
        if let Some(mut entry) = inner.remove(&stream_id) {
            terminate_locked(&mut entry, StreamItem::End(reason)).await;
        }
    }

    /// Reconnection failed definitively: every consumer terminates.
    pub async fn fail_all(&self) {
        let mut inner = self.inner.lock().await;
        for (_, mut entry) in inner.drain() {
            terminate_locked(&mut entry, StreamItem::End(StreamEndReason::ConnectionClosed)).await;
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    #[cfg(test)]
    pub async fn contains(&self, stream_id: Uuid) -> bool {
        self.inner.lock().await.contains_key(&stream_id)
    }
}

fn entry_by_provisional(
    inner: &mut HashMap<Uuid, StreamEntry>,
    provisional: Uuid,
) -> Option<&mut StreamEntry> {
    if inner.contains_key(&provisional) {
        return inner.get_mut(&provisional);
    }
    inner
        .values_mut()
        .find(|entry| entry.provisional_id == provisional)
}

async fn terminate_locked(entry: &mut StreamEntry, item: StreamItem) {
    if let Some(sender) = entry.subscriber.take() {
        let _ = sender.send(item).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_protocol::Blob;
    use chrono::Utc;

    fn data(stream_id: Uuid, seq: u64, payload: &[u8]) -> StreamData {
        StreamData {
            stream_id,
            seq,
            payload: Blob::new(payload.to_vec()),
            timestamp: Utc::now(),
        }
    }

    async fn registered(registry: &StreamRegistry) -> (Uuid, Uuid) {
        let provisional = Uuid::new_v4();
        let call_id = Uuid::new_v4();
        registry
            .preregister(provisional, call_id, ActorId::local("a"), "watch".to_owned(), None)
            .await;
        (provisional, call_id)
    }

    fn start(call_id: Uuid, canonical: Uuid) -> StreamStart {
        StreamStart {
            stream_id: canonical,
            call_id,
            actor_id: ActorId::local("a"),
            method: "watch".to_owned(),
            filter: None,
        }
    }

    #[tokio::test]
    async fn duplicate_and_out_of_order_frames_are_dropped() {
        let registry = StreamRegistry::new(100);
        let (provisional, _) = registered(&registry).await;
        let (tx, mut rx) = mpsc::channel(16);
        registry.attach(provisional, tx).await;

        assert!(registry.on_data(data(provisional, 1, b"x")).await.is_some());
        assert!(registry.on_data(data(provisional, 1, b"y")).await.is_none());
        assert!(registry.on_data(data(provisional, 2, b"z")).await.is_some());
        // Late out-of-order frame.
        assert!(registry.on_data(data(provisional, 1, b"w")).await.is_none());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, StreamItem::Data(p) if p == b"x"));
        assert!(matches!(second, StreamItem::Data(p) if p == b"z"));
    }

    #[tokio::test]
    async fn holding_queue_flushes_in_order_on_attach() {
        let registry = StreamRegistry::new(100);
        let (provisional, _) = registered(&registry).await;

        registry.on_data(data(provisional, 1, b"one")).await;
        registry.on_data(data(provisional, 2, b"two")).await;

        let (tx, mut rx) = mpsc::channel(16);
        registry.attach(provisional, tx).await;
        registry.on_data(data(provisional, 3, b"three")).await;

        for expected in [b"one".as_slice(), b"two", b"three"] {
            let item = rx.recv().await.unwrap();
            assert!(matches!(item, StreamItem::Data(p) if p == expected));
        }
    }

    #[tokio::test]
    async fn rekey_moves_the_entry_to_the_canonical_id() {
        let registry = StreamRegistry::new(100);
        let (provisional, call_id) = registered(&registry).await;
        let canonical = Uuid::new_v4();
        registry.rekey(&start(call_id, canonical)).await;

        assert!(!registry.contains(provisional).await);
        assert!(registry.contains(canonical).await);

        // Frames now arrive under the canonical id; attach by provisional
        // still finds the entry.
        registry.on_data(data(canonical, 1, b"x")).await;
        let (tx, mut rx) = mpsc::channel(16);
        registry.attach(provisional, tx).await;
        assert!(matches!(rx.recv().await.unwrap(), StreamItem::Data(p) if p == b"x"));
    }

    #[tokio::test]
    async fn data_for_unknown_streams_is_dropped() {
        let registry = StreamRegistry::new(100);
        assert!(registry.on_data(data(Uuid::new_v4(), 1, b"x")).await.is_none());
    }

    #[tokio::test]
    async fn end_terminates_and_removes() {
        let registry = StreamRegistry::new(100);
        let (provisional, _) = registered(&registry).await;
        let (tx, mut rx) = mpsc::channel(16);
        registry.attach(provisional, tx).await;

        assert!(registry.on_end(provisional, StreamEndReason::Completed).await);
        assert!(matches!(
            rx.recv().await.unwrap(),
            StreamItem::End(StreamEndReason::Completed)
        ));
        assert_eq!(registry.len().await, 0);
        // Exactly one terminator: a second end finds nothing.
        assert!(!registry.on_end(provisional, StreamEndReason::Completed).await);
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest() {
        let registry = StreamRegistry::new(2);
        let (provisional, _) = registered(&registry).await;
        for seq in 1..=4 {
            registry.on_data(data(provisional, seq, &[seq as u8])).await;
        }
        let inner = registry.inner.lock().await;
        let entry = inner.get(&provisional).unwrap();
        let seqs: Vec<u64> = entry.ring.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![3, 4]);
        // The holding queue still has everything: the ring is a resume
        // cache, not the delivery path.
        assert_eq!(entry.holding.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_provisional_entries_are_reaped() {
        let registry = StreamRegistry::new(100);
        let (stale_provisional, _) = registered(&registry).await;
        // A second subscription that does get its canonical rebind.
        let (confirmed_provisional, confirmed_call) = registered(&registry).await;
        let canonical = Uuid::new_v4();
        registry.rekey(&start(confirmed_call, canonical)).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        registry.reap_stale_provisional(Duration::from_secs(10)).await;

        assert!(!registry.contains(stale_provisional).await);
        assert!(!registry.contains(confirmed_provisional).await);
        assert!(registry.contains(canonical).await);
    }
}
