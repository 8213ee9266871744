//! Delta encoding for stream payloads.
//!
//! Opt-in per streaming method: the server keeps the last domain value it
//! sent and asks the strategy for a delta against it; the client reverses
//! the process, which requires a prior full value.

use crate::error::{RuntimeError, RuntimeResult};
use am_protocol::{Blob, DeltaPayload};
use std::sync::Arc;

/// How a domain type computes and applies deltas.
///
/// `delta` returning `None` means "no compact delta exists"; the manager
/// then transmits the full value.
pub trait DeltaStrategy: Send + Sync {
    fn delta(&self, previous: &[u8], current: &[u8]) -> Option<Vec<u8>>;
    fn apply(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>, String>;
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Wraps outgoing payloads; the first frame is always full.
pub struct DeltaManager {
    strategy: Arc<dyn DeltaStrategy>,
    last: Option<Vec<u8>>,
}

impl DeltaManager {
    pub fn new(strategy: Arc<dyn DeltaStrategy>) -> Self {
        DeltaManager {
            strategy,
            last: None,
        }
    }

    pub fn wrap(&mut self, value: &[u8]) -> DeltaPayload {
        let payload = match &self.last {
            Some(previous) => match self.strategy.delta(previous, value) {
                Some(delta) => DeltaPayload {
                    is_full: false,
                    data: Blob::new(delta),
                },
                None => DeltaPayload {
                    is_full: true,
                    data: Blob::new(value.to_vec()),
                },
            },
            None => DeltaPayload {
                is_full: true,
                data: Blob::new(value.to_vec()),
            },
        };
        self.last = Some(value.to_vec());
        payload
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Unwraps incoming payloads back into full domain values.
pub struct DeltaApplier {
    strategy: Arc<dyn DeltaStrategy>,
    base: Option<Vec<u8>>,
}

impl DeltaApplier {
    pub fn new(strategy: Arc<dyn DeltaStrategy>) -> Self {
        DeltaApplier {
            strategy,
            base: None,
        }
    }

    /// Recover the full value.  A delta without a prior full value fails
    /// with `no-base-value`.
    pub fn unwrap(&mut self, payload: DeltaPayload) -> RuntimeResult<Vec<u8>> {
        if payload.is_full {
            let value = payload.data.into_bytes();
            self.base = Some(value.clone());
            return Ok(value);
        }
        let base = self.base.as_deref().ok_or(RuntimeError::NoBaseValue)?;
        let value = self
            .strategy
            .apply(base, payload.data.as_bytes())
            .map_err(RuntimeError::RemoteInvocationFailed)?;
        self.base = Some(value.clone());
        Ok(value)
    }
}
