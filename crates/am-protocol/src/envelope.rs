//! Envelope records and the top-level discriminated union.
//!
//! The seven wire variants map 1:1 to the frozen frame kinds.  Optional
//! fields introduced after protocol version 1 (`streamFilter`,
//! `traceContext`, `protocolVersion` itself) carry `#[serde(default)]` so
//! envelopes from older peers decode with "none"/version-1 substituted.

use crate::actor_id::ActorId;
use crate::filter::FilterSpec;
use crate::Blob;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn protocol_version_default() -> u32 {
    1
}

fn is_protocol_version_default(v: &u32) -> bool {
    *v == 1
}

// ---------------------------------------------------------------------------
// Trace context
// ---------------------------------------------------------------------------

/// Distributed trace coordinates attached to an invocation.
///
/// A handler that invokes another remote method derives the child context
/// with [`TraceContext::child`]: same trace ID, fresh span ID, parent span
/// set to the current span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<Uuid>,
}

impl TraceContext {
    /// Start a fresh trace.
    pub fn root() -> Self {
        TraceContext {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
        }
    }

    /// Derive the context for a child call made from within this span.
    pub fn child(&self) -> Self {
        TraceContext {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation / response
// ---------------------------------------------------------------------------

/// A method invocation addressed to an actor.
///
/// `generics` carries concrete-type fingerprints substituted for generic
/// parameters; they travel the wire unchanged and are not consulted for
/// dispatch in this version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub call_id: Uuid,
    pub target: ActorId,
    pub method: String,
    #[serde(
        default = "protocol_version_default",
        skip_serializing_if = "is_protocol_version_default"
    )]
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generics: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_filter: Option<FilterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<TraceContext>,
}

/// The response correlated to an invocation by call ID.
///
/// Exactly one of `result`/`error` is populated; an absent result with no
/// error means "void success".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub call_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(call_id: Uuid, result: Option<Blob>) -> Self {
        Response {
            call_id,
            result,
            error: None,
        }
    }

    pub fn err(call_id: Uuid, message: impl Into<String>) -> Self {
        Response {
            call_id,
            result: None,
            error: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream frames
// ---------------------------------------------------------------------------

/// Opens a subscription (client → server) or announces the canonical
/// stream ID (server → client, first frame of every stream).
///
/// The client sends a provisional `stream_id`; the server's reply carries
/// the canonical one, and the client re-keys its registry entry using
/// `call_id` to match the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_id: Uuid,
    pub call_id: Uuid,
    pub actor_id: ActorId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterSpec>,
}

/// One stream item.  `seq` is per-stream, strictly increasing, starting at
/// 1; numbers may skip (filtered items) but never repeat or decrease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamData {
    pub stream_id: Uuid,
    pub seq: u64,
    pub payload: Blob,
    pub timestamp: DateTime<Utc>,
}

/// Why a stream terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamEndReason {
    Completed,
    ActorTerminated,
    ClientUnsubscribed,
    ConnectionClosed,
    Error,
}

impl std::fmt::Display for StreamEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamEndReason::Completed => "completed",
            StreamEndReason::ActorTerminated => "actor-terminated",
            StreamEndReason::ClientUnsubscribed => "client-unsubscribed",
            StreamEndReason::ConnectionClosed => "connection-closed",
            StreamEndReason::Error => "error",
        };
        f.write_str(s)
    }
}

/// Normal stream terminator.  Every stream ends with exactly one
/// `StreamEnd` or `StreamError` (unless the connection closed first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnd {
    pub stream_id: Uuid,
    pub reason: StreamEndReason,
}

/// Error stream terminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamError {
    pub stream_id: Uuid,
    pub message: String,
}

/// Client request to continue a stream after reconnect, from the last
/// sequence number it received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResume {
    pub stream_id: Uuid,
    pub last_seq: u64,
    pub actor_id: ActorId,
    pub method: String,
}

// ---------------------------------------------------------------------------
// Top-level union
// ---------------------------------------------------------------------------

/// Every message on the wire.
///
/// ```json
/// { "type": "streamData", "payload": { "streamId": "...", "seq": 3, ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Envelope {
    Invocation(Invocation),
    Response(Response),
    StreamStart(StreamStart),
    StreamData(StreamData),
    StreamEnd(StreamEnd),
    StreamError(StreamError),
    StreamResume(StreamResume),
}

// ---------------------------------------------------------------------------
// Cross-replica state change notification
// ---------------------------------------------------------------------------

/// Published on the `actor_state_changes` channel when a replica saves
/// actor state.  Other replicas reload the actor's state and re-broadcast
/// to their local subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeNotification {
    pub actor_id: String,
    pub sequence: u64,
    pub timestamp_seconds: i64,
}
