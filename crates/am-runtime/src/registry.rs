//! Actor registry and handles.
//!
//! The registry is a concurrent map from an actor's local identity to a
//! handle that executes invocations by method name.  Invocations on one
//! actor are serialized by its turn lock (FIFO); distinct actors run
//! concurrently.

use crate::delta::DeltaStrategy;
use crate::error::{RuntimeError, RuntimeResult};
use am_protocol::{ActorId, ArgumentReader, Blob, TraceContext};
use async_trait::async_trait;
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Encoded domain values yielded by a streaming method.  An `Err` item
/// terminates the stream with a `StreamError` frame.
pub type ValueStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, String>> + Send>>;

/// Per-invocation context handed to handlers.
///
/// Handlers that call further remote methods derive the child trace with
/// `ctx.trace.as_ref().map(TraceContext::child)` so the trace ID and the
/// parent/child span linkage survive the hop.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub call_id: Uuid,
    pub trace: Option<TraceContext>,
}

impl InvocationContext {
    pub fn internal() -> Self {
        InvocationContext {
            call_id: Uuid::new_v4(),
            trace: None,
        }
    }

    /// Trace context for a child call made from this invocation.
    pub fn child_trace(&self) -> Option<TraceContext> {
        self.trace.as_ref().map(TraceContext::child)
    }
}

/// An executable actor.
///
/// Handler errors are strings: they cross the wire verbatim inside
/// `Response.error` and surface to the caller as
/// `remote-invocation-failed`.
#[async_trait]
pub trait ActorHandle: Send + Sync {
    /// Execute a unary method.  `Ok(None)` is void success.
    async fn invoke(
        &self,
        ctx: &InvocationContext,
        method: &str,
        args: ArgumentReader,
    ) -> Result<Option<Blob>, String>;

    /// Open a streaming method.  The default rejects every method; actors
    /// with push streams override this.
    fn open_stream(&self, method: &str) -> Result<ValueStream, String> {
        Err(format!("method `{method}` is not a stream"))
    }

    /// Delta strategy for a streaming method, when the actor opts into
    /// delta encoding for it.
    fn delta_strategy(&self, _method: &str) -> Option<Arc<dyn DeltaStrategy>> {
        None
    }
}

/// On-demand materialization hook.
///
/// Consulted when an incoming invocation's target is not registered; a
/// returned handle is registered under the requested identity and the
/// invocation proceeds.
#[async_trait]
pub trait ActorProvider: Send + Sync {
    async fn on_actor_request(&self, actor_id: &ActorId) -> Option<Arc<dyn ActorHandle>>;
}

// ---------------------------------------------------------------------------
// Registered actor
// ---------------------------------------------------------------------------

/// A registry entry: the handle plus its turn lock and termination signal.
pub struct RegisteredActor {
    pub id: ActorId,
    handle: Arc<dyn ActorHandle>,
    turn: Mutex<()>,
    gone_tx: watch::Sender<bool>,
}

impl RegisteredActor {
    fn new(id: ActorId, handle: Arc<dyn ActorHandle>) -> Arc<Self> {
        let (gone_tx, _) = watch::channel(false);
        Arc::new(RegisteredActor {
            id,
            handle,
            turn: Mutex::new(()),
            gone_tx,
        })
    }

    /// Execute a unary method under the actor's turn.
    pub async fn invoke(
        &self,
        ctx: &InvocationContext,
        method: &str,
        args: ArgumentReader,
    ) -> Result<Option<Blob>, String> {
        let _turn = self.turn.lock().await;
        self.handle.invoke(ctx, method, args).await
    }

    /// Open a streaming method.  The turn is held only while opening; the
    /// produced stream runs outside it so slow consumers do not starve
    /// unary traffic.
    pub async fn open_stream(&self, method: &str) -> Result<ValueStream, String> {
        let _turn = self.turn.lock().await;
        self.handle.open_stream(method)
    }

    pub fn delta_strategy(&self, method: &str) -> Option<Arc<dyn DeltaStrategy>> {
        self.handle.delta_strategy(method)
    }

    /// Resolves to `true` once the actor is unregistered.
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.gone_tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ActorRegistry {
    actors: RwLock<HashMap<String, Arc<RegisteredActor>>>,
    provider: RwLock<Option<Arc<dyn ActorProvider>>>,
}

impl ActorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(ActorRegistry {
            actors: RwLock::new(HashMap::new()),
            provider: RwLock::new(None),
        })
    }

    /// Install the on-demand materialization hook.
    pub async fn set_provider(&self, provider: Arc<dyn ActorProvider>) {
        *self.provider.write().await = Some(provider);
    }

    /// Register an actor under its local identity.  Replacing an existing
    /// registration terminates the old entry.
    pub async fn register(
        &self,
        id: ActorId,
        handle: Arc<dyn ActorHandle>,
    ) -> Arc<RegisteredActor> {
        let key = id.local_form().to_string();
        let entry = RegisteredActor::new(id.local_form(), handle);
        let previous = self
            .actors
            .write()
            .await
            .insert(key.clone(), Arc::clone(&entry));
        if let Some(old) = previous {
            let _ = old.gone_tx.send(true);
            debug!(actor_id = %key, "replaced existing registration");
        }
        info!(actor_id = %key, "actor registered");
        entry
    }

    /// Remove an actor; returns false when it was not registered.
    pub async fn unregister(&self, id: &ActorId) -> bool {
        let key = id.local_form().to_string();
        match self.actors.write().await.remove(&key) {
            Some(entry) => {
                let _ = entry.gone_tx.send(true);
                info!(actor_id = %key, "actor unregistered");
                true
            }
            None => false,
        }
    }

    /// Plain lookup by local identity.
    pub async fn lookup(&self, id: &ActorId) -> Option<Arc<RegisteredActor>> {
        self.actors
            .read()
            .await
            .get(&id.local_form().to_string())
            .cloned()
    }

    pub async fn contains(&self, id: &ActorId) -> bool {
        self.actors
            .read()
            .await
            .contains_key(&id.local_form().to_string())
    }

    /// Lookup with on-demand materialization on miss.
    pub async fn resolve(&self, id: &ActorId) -> Option<Arc<RegisteredActor>> {
        if let Some(found) = self.lookup(id).await {
            return Some(found);
        }
        let provider = self.provider.read().await.clone()?;
        let handle = provider.on_actor_request(id).await?;
        debug!(actor_id = %id, "actor materialized on demand");
        Some(self.register(id.clone(), handle).await)
    }

    /// In-process invocation without touching any transport (the local
    /// short-circuit path).
    pub async fn invoke_local(
        &self,
        target: &ActorId,
        method: &str,
        arguments: Vec<Blob>,
    ) -> RuntimeResult<Option<Blob>> {
        let actor = self
            .resolve(target)
            .await
            .ok_or_else(|| RuntimeError::ActorNotFound(target.clone()))?;
        let ctx = InvocationContext::internal();
        actor
            .invoke(&ctx, method, ArgumentReader::new(arguments))
            .await
            .map_err(RuntimeError::RemoteInvocationFailed)
    }
}
