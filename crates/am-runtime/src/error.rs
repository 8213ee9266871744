//! Failure taxonomy surfaced to callers.

use am_protocol::{ActorId, CodecError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("connection to {host}:{port} failed: {cause}")]
    ConnectionFailed {
        host: String,
        port: u16,
        cause: String,
    },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("actor `{0}` not found")]
    ActorNotFound(ActorId),
    /// The stringified remote error, propagated verbatim.
    #[error("remote invocation failed: {0}")]
    RemoteInvocationFailed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("system not running")]
    SystemNotRunning,
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u32),
    /// A delta payload arrived before any full value.
    #[error("no base value to apply delta against")]
    NoBaseValue,
}

impl From<CodecError> for RuntimeError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::SerializationFailed(m) => RuntimeError::SerializationFailed(m),
            CodecError::DeserializationFailed(m) => RuntimeError::DeserializationFailed(m),
            other => RuntimeError::MalformedEnvelope(other.to_string()),
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
