//! Stream filter descriptors and the delta payload wrapper.
//!
//! Filter *evaluation* lives in the runtime's stream engine; this module
//! only defines the transmittable shapes.

use crate::Blob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Server-side predicate selection for a stream subscription.
///
/// `Custom` filters are not transmittable; a receiver treats one as
/// pass-everything (fail open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FilterSpec {
    /// Pass every value.
    All,
    /// One of the built-in filters, selected by name.
    Predefined {
        name: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, String>,
    },
    /// Caller-supplied predicate; never crosses the wire intact.
    Custom,
}

impl FilterSpec {
    /// Convenience constructor for a parameterless predefined filter.
    pub fn predefined(name: impl Into<String>) -> Self {
        FilterSpec::Predefined {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Convenience constructor with parameters.
    pub fn predefined_with(
        name: impl Into<String>,
        params: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        FilterSpec::Predefined {
            name: name.into(),
            params: params.into_iter().collect(),
        }
    }
}

/// Opt-in envelope around stream payloads when delta encoding is active.
///
/// The first frame of a stream is always full; a delta requires the
/// receiver to hold the prior full value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPayload {
    pub is_full: bool,
    pub data: Blob,
}
