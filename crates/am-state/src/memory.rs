//! In-memory reference backend.
//!
//! Used by tests and single-process deployments.  Change notifications are
//! emitted in-process on every successful save.

use crate::{StateError, StateRecord, StateResult, StateStore};
use am_protocol::{ActorId, StateChangeNotification};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

pub struct MemoryStore {
    records: RwLock<HashMap<String, StateRecord>>,
    changes_tx: broadcast::Sender<StateChangeNotification>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(256);
        MemoryStore {
            records: RwLock::new(HashMap::new()),
            changes_tx,
        }
    }

    fn notify(&self, actor_id: &ActorId, version: u64) {
        // Zero subscribers is fine; the send error only means nobody is
        // listening right now.
        let _ = self.changes_tx.send(StateChangeNotification {
            actor_id: actor_id.to_string(),
            sequence: version,
            timestamp_seconds: Utc::now().timestamp(),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, actor_id: &ActorId) -> StateResult<Option<StateRecord>> {
        Ok(self.records.read().await.get(&actor_id.to_string()).cloned())
    }

    async fn save(&self, actor_id: &ActorId, state: &[u8]) -> StateResult<u64> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        let record = records
            .entry(actor_id.to_string())
            .and_modify(|r| {
                r.state = state.to_vec();
                r.version += 1;
                r.updated_at = now;
            })
            .or_insert_with(|| StateRecord {
                actor_id: actor_id.clone(),
                state: state.to_vec(),
                version: 1,
                updated_at: now,
                created_at: now,
            });
        let version = record.version;
        drop(records);
        self.notify(actor_id, version);
        Ok(version)
    }

    async fn save_if_version(
        &self,
        actor_id: &ActorId,
        state: &[u8],
        expected_version: u64,
    ) -> StateResult<u64> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        let actual = records
            .get(&actor_id.to_string())
            .map(|r| r.version)
            .unwrap_or(0);
        if actual != expected_version {
            return Err(StateError::VersionConflict {
                expected: expected_version,
                actual,
            });
        }
        let version = actual + 1;
        let created_at = records
            .get(&actor_id.to_string())
            .map(|r| r.created_at)
            .unwrap_or(now);
        records.insert(
            actor_id.to_string(),
            StateRecord {
                actor_id: actor_id.clone(),
                state: state.to_vec(),
                version,
                updated_at: now,
                created_at,
            },
        );
        drop(records);
        self.notify(actor_id, version);
        Ok(version)
    }

    async fn get_version(&self, actor_id: &ActorId) -> StateResult<Option<u64>> {
        Ok(self
            .records
            .read()
            .await
            .get(&actor_id.to_string())
            .map(|r| r.version))
    }

    fn changes(&self) -> broadcast::Receiver<StateChangeNotification> {
        self.changes_tx.subscribe()
    }
}
