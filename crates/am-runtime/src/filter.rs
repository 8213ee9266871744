//! Server-side filter evaluation.
//!
//! Filters decide whether a stream value is transmitted.  Evaluation is
//! fail-open everywhere the spec of a filter cannot be satisfied: unknown
//! predefined names, `custom` filters received off the wire, unparseable
//! parameters, and failed value extraction all pass the frame through.

use am_protocol::FilterSpec;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Per-stream filter memory.
///
/// `previous` is the last *accepted* payload; the `changed` filter updates
/// it on accept only, so a run of equal values keeps comparing against the
/// value that actually went out.
#[derive(Debug, Default)]
pub struct FilterState {
    previous: Option<Vec<u8>>,
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Decide whether `payload` passes `spec`.
pub fn evaluate(spec: &FilterSpec, state: &mut FilterState, payload: &[u8]) -> bool {
    match spec {
        FilterSpec::All => true,
        FilterSpec::Custom => {
            // Custom predicates are not transmittable; fail open.
            debug!("custom filter received over the wire; passing");
            true
        }
        FilterSpec::Predefined { name, params } => match name.as_str() {
            "changed" => changed(state, payload),
            "nonEmpty" => non_empty(payload),
            "threshold" => threshold(params, payload),
            other => {
                debug!(filter = other, "unknown predefined filter; passing");
                true
            }
        },
    }
}

fn changed(state: &mut FilterState, payload: &[u8]) -> bool {
    if state.previous.as_deref() == Some(payload) {
        return false;
    }
    state.previous = Some(payload.to_vec());
    true
}

fn non_empty(payload: &[u8]) -> bool {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Array(items)) => !items.is_empty(),
        Ok(Value::Object(fields)) => !fields.is_empty(),
        Ok(Value::String(s)) => !s.is_empty(),
        // Numbers, booleans, null, and undecodable payloads pass.
        _ => true,
    }
}

fn threshold(params: &BTreeMap<String, String>, payload: &[u8]) -> bool {
    let Some(limit) = params.get("value").and_then(|v| v.parse::<f64>().ok()) else {
        return true;
    };
    let Some(comparison) = params.get("comparison") else {
        return true;
    };
    let Some(actual) = extract_number(params.get("field"), payload) else {
        return true;
    };
    match comparison.as_str() {
        "gt" => actual > limit,
        "gte" => actual >= limit,
        "lt" => actual < limit,
        "lte" => actual <= limit,
        "eq" => actual == limit,
        "neq" => actual != limit,
        _ => true,
    }
}

fn extract_number(field: Option<&String>, payload: &[u8]) -> Option<f64> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    match field {
        Some(name) => value.get(name)?.as_f64(),
        None => value.as_f64(),
    }
}
