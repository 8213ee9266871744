// am-protocol: wire protocol types and serialization for the actor runtime.
//
// Every message on the wire is a discriminated union with a string `type`
// tag and a `payload` object holding the variant record.  The codec is
// forward compatible: unknown fields are ignored, optional fields added
// after protocol version 1 default to "none" when absent.

mod actor_id;
mod args;
mod codec;
mod envelope;
mod filter;

pub use actor_id::{ActorId, ActorIdParseError};
pub use args::{ArgumentReader, ArgumentWriter};
pub use codec::{decode_envelope, encode_envelope, CodecError};
pub use envelope::{
    Envelope, Invocation, Response, StateChangeNotification, StreamData, StreamEnd,
    StreamEndReason, StreamError, StreamResume, StreamStart, TraceContext,
};
pub use filter::{DeltaPayload, FilterSpec};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lowest protocol version this build understands.
pub const PROTOCOL_VERSION_MIN: u32 = 1;
/// Highest protocol version this build understands.
///
/// Version 2 added `streamFilter` and `traceContext` to invocations; both
/// decode to `None` when a v1 peer omits them.
pub const PROTOCOL_VERSION_MAX: u32 = 2;
/// The version stamped on outgoing invocations.
pub const PROTOCOL_VERSION: u32 = 2;

/// An opaque binary payload.
///
/// Argument values, results, and stream items are carried as `Blob`s; the
/// core never interprets their contents.  On the wire a blob is a base64
/// string (standard alphabet, padded).
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Blob(bytes.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Blob(bytes)
    }
}

impl From<&[u8]> for Blob {
    fn from(bytes: &[u8]) -> Self {
        Blob(bytes.to_vec())
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Blob)
            .map_err(serde::de::Error::custom)
    }
}
