//! Observability callbacks and the middleware gate.

use am_protocol::{ActorId, Invocation};
use async_trait::async_trait;
use std::sync::Arc;

pub type EventCallback = Arc<dyn Fn(&ActorId, &str) + Send + Sync>;

/// Per-event callbacks, invoked synchronously before the associated work.
/// They must not block long; anything expensive belongs on a channel.
#[derive(Clone, Default)]
pub struct EventHooks {
    pub on_invocation: Option<EventCallback>,
    pub on_stream_start: Option<EventCallback>,
    pub on_stream_end: Option<EventCallback>,
}

impl EventHooks {
    pub(crate) fn invocation(&self, actor_id: &ActorId, method: &str) {
        if let Some(hook) = &self.on_invocation {
            hook(actor_id, method);
        }
    }

    pub(crate) fn stream_start(&self, actor_id: &ActorId, method: &str) {
        if let Some(hook) = &self.on_stream_start {
            hook(actor_id, method);
        }
    }

    pub(crate) fn stream_end(&self, actor_id: &ActorId, method: &str) {
        if let Some(hook) = &self.on_stream_end {
            hook(actor_id, method);
        }
    }
}

/// Chain position between "frame decoded" and "dispatch handler".
///
/// A rejection becomes an error response on the same call ID; the
/// connection stays up.  `rate_key` is the hook rate-limiting middleware
/// uses to bucket invocations.
#[async_trait]
pub trait InvocationGate: Send + Sync {
    async fn check(&self, invocation: &Invocation) -> Result<(), String>;

    fn rate_key(&self, invocation: &Invocation) -> String {
        invocation.target.to_string()
    }
}
