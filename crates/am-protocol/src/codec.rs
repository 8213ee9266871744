//! Envelope encode/decode.
//!
//! Decoding validates the discriminator before handing the value to serde
//! so that an unknown `type` tag is distinguishable from a structurally
//! broken frame.

use crate::envelope::Envelope;
use serde_json::Value;
use thiserror::Error;

/// The seven frozen discriminator tags.
const KNOWN_TAGS: [&str; 7] = [
    "invocation",
    "response",
    "streamStart",
    "streamData",
    "streamEnd",
    "streamError",
    "streamResume",
];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("unknown envelope variant `{0}`")]
    UnknownVariant(String),
    #[error("missing required field `{0}`")]
    MissingRequiredField(&'static str),
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),
}

/// Encode an envelope to its wire bytes.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(|e| CodecError::SerializationFailed(e.to_string()))
}

/// Decode wire bytes into an envelope.
///
/// Unknown fields inside the payload are ignored; optional fields absent
/// from older-version envelopes come back as their defaults.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| CodecError::MalformedEnvelope(e.to_string()))?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingRequiredField("type"))?;
    if !KNOWN_TAGS.contains(&tag) {
        return Err(CodecError::UnknownVariant(tag.to_owned()));
    }
    if value.get("payload").is_none() {
        return Err(CodecError::MissingRequiredField("payload"));
    }
    serde_json::from_value(value).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
}
