// am-state: persisted actor state with optimistic concurrency.
//
// The runtime does not pick a storage engine; it defines the contract every
// backend satisfies (load / save / compare-and-swap save / version query,
// plus a change-notification feed) and ships three reference backends:
// in-memory, embedded SQLite, and replicated Postgres with a trigger on the
// `actor_state_changes` channel.

mod fanout;
mod memory;
mod postgres;
mod sqlite;
mod update;

pub use fanout::ChangeFanout;
pub use memory::MemoryStore;
pub use postgres::{PgStore, STATE_CHANGE_CHANNEL};
pub use sqlite::SqliteStore;
pub use update::{update_with_retry, DEFAULT_MAX_RETRIES};

use am_protocol::{ActorId, StateChangeNotification};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("version conflict: expected {expected}, stored {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("update abandoned after {0} attempts")]
    MaxRetriesExceeded(u32),
    #[error("state serialization: {0}")]
    Serialization(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StateError {
    fn from(e: rusqlite::Error) -> Self {
        StateError::Backend(e.to_string())
    }
}

impl From<sqlx::Error> for StateError {
    fn from(e: sqlx::Error) -> Self {
        StateError::Backend(e.to_string())
    }
}

pub type StateResult<T> = Result<T, StateError>;

/// One persisted state row.
///
/// `version` increases strictly monotonically on every successful save for
/// a given actor; it starts at 1 on first save (an absent record reads as
/// version 0 for compare-and-swap purposes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub actor_id: ActorId,
    pub state: Vec<u8>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Contract every state backend satisfies.
///
/// `changes()` yields a [`StateChangeNotification`] after every successful
/// save visible to this process.  For the Postgres backend the feed is
/// driven by the database trigger, so it also carries saves performed by
/// other replicas.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Latest record for an actor, if any.
    async fn load(&self, actor_id: &ActorId) -> StateResult<Option<StateRecord>>;

    /// Unconditional write; returns the new version.
    async fn save(&self, actor_id: &ActorId, state: &[u8]) -> StateResult<u64>;

    /// Compare-and-swap write: succeeds iff the stored version equals
    /// `expected_version` (0 when the record does not exist yet).
    async fn save_if_version(
        &self,
        actor_id: &ActorId,
        state: &[u8],
        expected_version: u64,
    ) -> StateResult<u64>;

    /// Stored version, if the record exists.
    async fn get_version(&self, actor_id: &ActorId) -> StateResult<Option<u64>>;

    /// Subscribe to the change-notification feed.
    fn changes(&self) -> broadcast::Receiver<StateChangeNotification>;
}
