//! Client connection manager and remote references.
//!
//! One logical connection per client, driven by a background task that
//! walks the reconnect state machine (capped exponential backoff) and, on
//! every successful reconnect, replays the non-expired stream checkpoints
//! as `StreamResume` envelopes before normal traffic continues.

mod checkpoint;
mod streams;

pub use checkpoint::Checkpoint;

use crate::delta::{DeltaApplier, DeltaStrategy};
use crate::dispatch::PendingCalls;
use crate::error::{RuntimeError, RuntimeResult};
use crate::link::{ws_connect, FrameLink};
use crate::registry::ActorRegistry;
use crate::config::StreamSettings;
use crate::server::ACTOR_NOT_FOUND_PREFIX;
use am_protocol::{
    decode_envelope, encode_envelope, ActorId, ArgumentWriter, Blob, Envelope, FilterSpec,
    Invocation, StreamEnd, StreamEndReason, StreamResume, StreamStart, TraceContext,
    PROTOCOL_VERSION,
};
use checkpoint::CheckpointStore;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use streams::{StreamItem, StreamRegistry};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const OUTBOUND_QUEUE: usize = 64;
const SUBSCRIPTION_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;
const REAPER_TICK: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Policy, state, events
// ---------------------------------------------------------------------------

/// Capped exponential backoff for reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// `None` retries forever; `Some(0)` disables reconnection.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: None,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        ReconnectPolicy {
            max_attempts: Some(0),
            ..Default::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting(u32),
    Failed,
}

/// Lifecycle notifications for observers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    DidConnect,
    WillReconnect { attempt: u32, delay: Duration },
    DidFailWithError(String),
    DidDisconnect,
}

/// Per-call options.
#[derive(Debug, Default)]
pub struct InvokeOptions {
    pub timeout: Option<Duration>,
    pub trace: Option<TraceContext>,
    /// Concrete-type fingerprints carried through the wire unchanged.
    pub generics: Vec<String>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct ClientShared {
    host: String,
    port: u16,
    policy: ReconnectPolicy,
    settings: StreamSettings,
    pending: Arc<PendingCalls>,
    streams: StreamRegistry,
    checkpoints: CheckpointStore,
    out_tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ClientEvent>,
    local: std::sync::RwLock<Option<Arc<ActorRegistry>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ClientShared {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn current_out(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.out_tx.read().await.clone()
    }

    fn local_registry(&self) -> Option<Arc<ActorRegistry>> {
        self.local.read().expect("local registry lock poisoned").clone()
    }

    /// Replay checkpoints after reconnect; expired ones terminate their
    /// streams instead.
    async fn resume_streams(&self, out_tx: &mpsc::Sender<Vec<u8>>) {
        let (valid, expired) = self.checkpoints.take_for_resume();
        for stream_id in expired {
            warn!(stream_id = %stream_id, "checkpoint expired; stream terminated");
            self.streams
                .terminate(stream_id, StreamEndReason::ConnectionClosed)
                .await;
        }
        for cp in valid {
            let envelope = Envelope::StreamResume(StreamResume {
                stream_id: cp.stream_id,
                last_seq: cp.last_seq,
                actor_id: cp.actor_id,
                method: cp.method,
            });
            match encode_envelope(&envelope) {
                Ok(bytes) => {
                    if out_tx.send(bytes).await.is_err() {
                        return;
                    }
                    debug!(stream_id = %cp.stream_id, last_seq = cp.last_seq, "stream resume sent");
                }
                Err(e) => warn!(error = %e, "resume encoding failed"),
            }
        }
    }

    async fn unsubscribe(&self, provisional: Uuid) {
        if let Some(key) = self.streams.remove_for_unsubscribe(provisional).await {
            self.checkpoints.clear(key);
            if let Some(out) = self.current_out().await {
                let envelope = Envelope::StreamEnd(StreamEnd {
                    stream_id: key,
                    reason: StreamEndReason::ClientUnsubscribed,
                });
                if let Ok(bytes) = encode_envelope(&envelope) {
                    let _ = out.send(bytes).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

async fn drive(shared: Arc<ClientShared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    // 0 = initial connect; n >= 1 = reconnect attempt n.
    let mut next_attempt: u32 = 0;
    loop {
        if *shutdown_rx.borrow() {
            shared.set_state(ConnectionState::Disconnected);
            break;
        }
        shared.set_state(if next_attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting(next_attempt)
        });

        match ws_connect(&shared.host, shared.port).await {
            Ok(link) => {
                next_attempt = 1;
                info!(host = %shared.host, port = shared.port, "connected");

                // Outbound must exist before the connected state is
                // observable, or an early invoke races into
                // `system-not-running`.
                let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
                *shared.out_tx.write().await = Some(out_tx.clone());
                // Checkpoint replay writes into the queue this session is
                // about to drain, so it runs as its own task.
                {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        shared.resume_streams(&out_tx).await;
                    });
                }
                shared.set_state(ConnectionState::Connected);
                shared.emit(ClientEvent::DidConnect);

                run_session(&shared, Box::new(link), out_rx, &mut shutdown_rx).await;

                *shared.out_tx.write().await = None;
                shared.pending.fail_all();
                shared.streams.drop_provisional_on_disconnect().await;
                shared.emit(ClientEvent::DidDisconnect);

                if *shutdown_rx.borrow() {
                    shared.set_state(ConnectionState::Disconnected);
                    break;
                }
                if shared.policy.max_attempts == Some(0) {
                    shared.set_state(ConnectionState::Failed);
                    shared.streams.fail_all().await;
                    break;
                }
                // Transport closure: reconnect attempt 1 starts
                // immediately; backoff applies between failed attempts.
            }
            Err(e) => {
                let failed_attempt = next_attempt;
                warn!(host = %shared.host, port = shared.port, error = %e, "connect failed");
                shared.emit(ClientEvent::DidFailWithError(e.to_string()));
                if let Some(max) = shared.policy.max_attempts {
                    if failed_attempt >= max {
                        shared.set_state(ConnectionState::Failed);
                        shared.streams.fail_all().await;
                        break;
                    }
                }
                let upcoming = if failed_attempt == 0 { 1 } else { failed_attempt + 1 };
                let delay = shared.policy.delay_for(upcoming);
                shared.emit(ClientEvent::WillReconnect {
                    attempt: upcoming,
                    delay,
                });
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            shared.set_state(ConnectionState::Disconnected);
                            break;
                        }
                    }
                }
                next_attempt = upcoming;
            }
        }
    }
}

async fn run_session(
    shared: &Arc<ClientShared>,
    mut link: Box<dyn FrameLink>,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    link.shutdown().await;
                    break;
                }
            }
            outbound = out_rx.recv() => match outbound {
                Some(frame) => {
                    if link.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = link.recv() => match inbound {
                None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "session error");
                    break;
                }
                Some(Ok(bytes)) => route_frame(shared, bytes).await,
            },
        }
    }
}

async fn route_frame(shared: &Arc<ClientShared>, bytes: Vec<u8>) {
    let envelope = match decode_envelope(&bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "dropping undecodable frame");
            return;
        }
    };
    match envelope {
        Envelope::Response(response) => shared.pending.complete(response),
        Envelope::StreamStart(start) => shared.streams.rekey(&start).await,
        Envelope::StreamData(frame) => {
            if let Some(update) = shared.streams.on_data(frame).await {
                shared.checkpoints.record(
                    update.stream_id,
                    update.seq,
                    &update.actor_id,
                    &update.method,
                );
            }
        }
        Envelope::StreamEnd(end) => {
            if shared.streams.on_end(end.stream_id, end.reason).await {
                shared.checkpoints.clear(end.stream_id);
            }
        }
        Envelope::StreamError(error) => {
            if shared.streams.on_error(error.stream_id, error.message).await {
                shared.checkpoints.clear(error.stream_id);
            }
        }
        other => {
            debug!(?other, "ignoring unexpected frame");
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct Client {
    shared: Arc<ClientShared>,
    driver: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl Client {
    /// Connect with the default policy and stream settings.
    pub async fn connect(host: &str, port: u16) -> RuntimeResult<Client> {
        Self::connect_with(host, port, ReconnectPolicy::default(), StreamSettings::default()).await
    }

    /// Connect, waiting until the manager reaches `connected` (or gives up
    /// per the policy).
    pub async fn connect_with(
        host: &str,
        port: u16,
        policy: ReconnectPolicy,
        settings: StreamSettings,
    ) -> RuntimeResult<Client> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(ClientShared {
            host: host.to_owned(),
            port,
            pending: PendingCalls::new(),
            streams: StreamRegistry::new(settings.ring_capacity),
            checkpoints: CheckpointStore::new(settings.checkpoint_max_age),
            policy,
            settings,
            out_tx: RwLock::new(None),
            state_tx,
            events_tx,
            local: std::sync::RwLock::new(None),
            shutdown_tx,
        });

        let driver = tokio::spawn(drive(Arc::clone(&shared)));
        let reaper = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(REAPER_TICK);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    shared
                        .streams
                        .reap_stale_provisional(shared.settings.provisional_grace)
                        .await;
                }
            })
        };
        let client = Client {
            shared,
            driver,
            reaper,
        };

        let mut state_rx = client.shared.state_tx.subscribe();
        loop {
            match *state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(client),
                ConnectionState::Failed => {
                    return Err(RuntimeError::ConnectionFailed {
                        host: host.to_owned(),
                        port,
                        cause: "reconnect attempts exhausted".to_owned(),
                    });
                }
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(RuntimeError::SystemNotRunning);
            }
        }
    }

    /// Observe connection-state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Observe lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Co-located actors for the local short-circuit path.
    pub fn set_local_registry(&self, registry: Arc<ActorRegistry>) {
        *self
            .shared
            .local
            .write()
            .expect("local registry lock poisoned") = Some(registry);
    }

    /// A reference to the remote actor registered under `name`.
    pub fn resolve(&self, name: &str) -> RemoteRef {
        RemoteRef {
            shared: Arc::clone(&self.shared),
            id: ActorId::remote(name, self.shared.host.clone(), self.shared.port),
        }
    }

    /// Close the connection and stop the manager.
    pub async fn close(self) {
        let _ = self.shared.shutdown_tx.send(true);
        let _ = self.driver.await;
        self.reaper.abort();
    }
}

// ---------------------------------------------------------------------------
// Remote reference
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RemoteRef {
    shared: Arc<ClientShared>,
    id: ActorId,
}

impl RemoteRef {
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// Value-returning call.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        method: &str,
        args: ArgumentWriter,
    ) -> RuntimeResult<T> {
        self.invoke_with(method, args, InvokeOptions::default()).await
    }

    pub async fn invoke_with<T: DeserializeOwned>(
        &self,
        method: &str,
        args: ArgumentWriter,
        options: InvokeOptions,
    ) -> RuntimeResult<T> {
        let result = self.invoke_raw(method, args, options).await?;
        let blob = result.ok_or_else(|| {
            RuntimeError::DeserializationFailed("void response where a value was expected".to_owned())
        })?;
        serde_json::from_slice(blob.as_bytes())
            .map_err(|e| RuntimeError::DeserializationFailed(e.to_string()))
    }

    /// Void call: success carries no payload.
    pub async fn invoke_void(&self, method: &str, args: ArgumentWriter) -> RuntimeResult<()> {
        self.invoke_raw(method, args, InvokeOptions::default())
            .await
            .map(|_| ())
    }

    async fn invoke_raw(
        &self,
        method: &str,
        args: ArgumentWriter,
        options: InvokeOptions,
    ) -> RuntimeResult<Option<Blob>> {
        let arguments = args.finish();

        // Local short-circuit: a co-located actor executes in-process and
        // the pending-call table is never touched.
        if let Some(registry) = self.shared.local_registry() {
            if registry.contains(&self.id).await {
                return registry.invoke_local(&self.id, method, arguments).await;
            }
        }

        let out = self
            .shared
            .current_out()
            .await
            .ok_or(RuntimeError::SystemNotRunning)?;
        let call_id = Uuid::new_v4();
        let (_guard, receiver) = self.shared.pending.register(call_id);
        let envelope = Envelope::Invocation(Invocation {
            call_id,
            target: self.id.clone(),
            method: method.to_owned(),
            protocol_version: PROTOCOL_VERSION,
            generics: options.generics,
            arguments,
            stream_filter: None,
            trace_context: options.trace,
        });
        let bytes = encode_envelope(&envelope)?;
        out.send(bytes)
            .await
            .map_err(|_| RuntimeError::ConnectionClosed)?;

        let response = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, receiver)
                .await
                .map_err(|_| RuntimeError::Timeout(limit))?
                .map_err(|_| RuntimeError::ConnectionClosed)?,
            None => receiver.await.map_err(|_| RuntimeError::ConnectionClosed)?,
        };
        match response.error {
            Some(message) => Err(self.map_remote_error(message)),
            None => Ok(response.result),
        }
    }

    fn map_remote_error(&self, message: String) -> RuntimeError {
        if message.starts_with(ACTOR_NOT_FOUND_PREFIX) {
            return RuntimeError::ActorNotFound(self.id.clone());
        }
        if let Some(rest) = message.strip_prefix("unsupported protocol version ") {
            if let Ok(version) = rest.trim().parse() {
                return RuntimeError::UnsupportedProtocolVersion(version);
            }
        }
        RuntimeError::RemoteInvocationFailed(message)
    }

    /// Open a push stream from a streaming method.
    pub async fn subscribe(&self, method: &str) -> RuntimeResult<Subscription> {
        self.subscribe_with(method, None, None).await
    }

    pub async fn subscribe_with(
        &self,
        method: &str,
        filter: Option<FilterSpec>,
        delta: Option<Arc<dyn DeltaStrategy>>,
    ) -> RuntimeResult<Subscription> {
        let out = self
            .shared
            .current_out()
            .await
            .ok_or(RuntimeError::SystemNotRunning)?;
        let call_id = Uuid::new_v4();
        let provisional = Uuid::new_v4();

        // Pre-register before the envelope goes out so server frames can
        // never beat the consumer structure.
        self.shared
            .streams
            .preregister(
                provisional,
                call_id,
                self.id.clone(),
                method.to_owned(),
                delta.map(DeltaApplier::new),
            )
            .await;

        let envelope = Envelope::StreamStart(StreamStart {
            stream_id: provisional,
            call_id,
            actor_id: self.id.clone(),
            method: method.to_owned(),
            filter,
        });
        let bytes = encode_envelope(&envelope)?;
        if out.send(bytes).await.is_err() {
            let _ = self.shared.streams.remove_for_unsubscribe(provisional).await;
            return Err(RuntimeError::ConnectionClosed);
        }

        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_QUEUE);
        self.shared.streams.attach(provisional, sender).await;
        Ok(Subscription {
            provisional,
            shared: Arc::clone(&self.shared),
            receiver,
            finished: false,
            end_reason: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Consumer handle for one stream.
///
/// Dropping it before the stream ends unsubscribes: the entry and
/// checkpoint are removed and the server is told to stop publishing.
pub struct Subscription {
    provisional: Uuid,
    shared: Arc<ClientShared>,
    receiver: mpsc::Receiver<StreamItem>,
    finished: bool,
    end_reason: Option<StreamEndReason>,
}

impl Subscription {
    /// Next payload, in sequence order.  `None` means the stream ended;
    /// [`Subscription::end_reason`] says why.
    pub async fn next(&mut self) -> Option<RuntimeResult<Vec<u8>>> {
        match self.receiver.recv().await {
            Some(StreamItem::Data(payload)) => Some(Ok(payload)),
            Some(StreamItem::End(reason)) => {
                self.finished = true;
                self.end_reason = Some(reason);
                None
            }
            Some(StreamItem::Error(message)) => {
                self.finished = true;
                Some(Err(RuntimeError::RemoteInvocationFailed(message)))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Next payload decoded as `T`.
    pub async fn next_value<T: DeserializeOwned>(&mut self) -> Option<RuntimeResult<T>> {
        match self.next().await? {
            Ok(payload) => Some(
                serde_json::from_slice(&payload)
                    .map_err(|e| RuntimeError::DeserializationFailed(e.to_string())),
            ),
            Err(e) => Some(Err(e)),
        }
    }

    pub fn end_reason(&self) -> Option<StreamEndReason> {
        self.end_reason
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let provisional = self.provisional;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                shared.unsubscribe(provisional).await;
            });
        }
    }
}
