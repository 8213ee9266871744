//! Retry-and-rebase update loop on top of the compare-and-swap contract.

use crate::{StateError, StateResult, StateStore};
use am_protocol::ActorId;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Load the actor's state, apply `transform`, and save with a version
/// check; on conflict, back off (200 ms doubling per attempt), reload, and
/// rebase.  Returns the bytes that were stored.
///
/// `transform` must be a pure function of the current state — it runs once
/// per attempt, so side effects inside it are a caller bug.
pub async fn update_with_retry<S, F>(
    store: &S,
    actor_id: &ActorId,
    transform: F,
    max_retries: u32,
) -> StateResult<Vec<u8>>
where
    S: StateStore + ?Sized,
    F: Fn(Option<&[u8]>) -> Vec<u8>,
{
    for attempt in 1..=max_retries {
        let current = store.load(actor_id).await?;
        let (bytes, version) = match &current {
            Some(record) => (Some(record.state.as_slice()), record.version),
            None => (None, 0),
        };
        let next = transform(bytes);
        match store.save_if_version(actor_id, &next, version).await {
            Ok(_) => return Ok(next),
            Err(StateError::VersionConflict { expected, actual }) => {
                let delay = BACKOFF_BASE * 2u32.pow(attempt - 1);
                debug!(
                    actor_id = %actor_id,
                    attempt,
                    expected,
                    actual,
                    delay_ms = delay.as_millis() as u64,
                    "version conflict, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
    Err(StateError::MaxRetriesExceeded(max_retries))
}
