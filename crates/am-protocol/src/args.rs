//! Argument marshalling.
//!
//! The encoder records arguments in call order; the decoder hands them
//! back in the same order, one `next` call per argument.  Requesting more
//! arguments than were recorded fails with `deserialization-failed`.

use crate::codec::CodecError;
use crate::Blob;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Records invocation arguments, in order, as opaque JSON blobs.
#[derive(Debug, Default)]
pub struct ArgumentWriter {
    arguments: Vec<Blob>,
}

impl ArgumentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one argument.
    pub fn record<T: Serialize>(&mut self, value: &T) -> Result<(), CodecError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
        self.arguments.push(Blob(bytes));
        Ok(())
    }

    pub fn finish(self) -> Vec<Blob> {
        self.arguments
    }
}

/// Replays recorded arguments in order.
#[derive(Debug)]
pub struct ArgumentReader {
    arguments: std::vec::IntoIter<Blob>,
}

impl ArgumentReader {
    pub fn new(arguments: Vec<Blob>) -> Self {
        ArgumentReader {
            arguments: arguments.into_iter(),
        }
    }

    /// Decode the next argument.
    pub fn next_argument<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        let blob = self.arguments.next().ok_or_else(|| {
            CodecError::DeserializationFailed("argument list exhausted".to_owned())
        })?;
        serde_json::from_slice(&blob.0).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }

    /// Arguments not yet consumed.
    pub fn remaining(&self) -> usize {
        self.arguments.len()
    }
}
