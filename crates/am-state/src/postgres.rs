//! Replicated Postgres backend.
//!
//! Saves go through single-statement upserts/guarded updates so the
//! version check holds under concurrent replicas without explicit
//! transactions.  A database trigger publishes every insert/update on the
//! `actor_state_changes` channel; [`PgStore::spawn_change_listener`] owns a
//! dedicated listening connection and re-broadcasts decoded notifications
//! in-process, so `changes()` carries saves from *every* replica, not just
//! this one.

use crate::{StateError, StateRecord, StateResult, StateStore};
use am_protocol::{ActorId, StateChangeNotification};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// Channel name the trigger publishes on.
pub const STATE_CHANGE_CHANNEL: &str = "actor_state_changes";

const PG_SCHEMA_SQL: &str = include_str!("pg_schema.sql");

pub struct PgStore {
    pool: PgPool,
    changes_tx: broadcast::Sender<StateChangeNotification>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        let (changes_tx, _) = broadcast::channel(256);
        PgStore { pool, changes_tx }
    }

    /// Create the table, index, and notify trigger if absent.
    pub async fn apply_schema(&self) -> StateResult<()> {
        sqlx::raw_sql(PG_SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Spawn the long-lived listener that feeds `changes()`.
    ///
    /// The task owns its own connection; `PgListener` transparently
    /// re-establishes it after connection loss.
    pub async fn spawn_change_listener(&self) -> StateResult<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(STATE_CHANGE_CHANNEL).await?;
        let tx = self.changes_tx.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<StateChangeNotification>(
                            notification.payload(),
                        ) {
                            Ok(change) => {
                                let _ = tx.send(change);
                            }
                            Err(e) => {
                                warn!(error = %e, payload = notification.payload(), "undecodable state change notification");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "state change listener error");
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn load(&self, actor_id: &ActorId) -> StateResult<Option<StateRecord>> {
        let row = sqlx::query(
            "SELECT state, version, updated_at, created_at
             FROM actor_state WHERE actor_id = $1",
        )
        .bind(actor_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StateRecord {
            actor_id: actor_id.clone(),
            state: r.get::<Vec<u8>, _>("state"),
            version: r.get::<i64, _>("version") as u64,
            updated_at: r.get::<DateTime<Utc>, _>("updated_at"),
            created_at: r.get::<DateTime<Utc>, _>("created_at"),
        }))
    }

    async fn save(&self, actor_id: &ActorId, state: &[u8]) -> StateResult<u64> {
        let row = sqlx::query(
            "INSERT INTO actor_state (actor_id, state, version, updated_at, created_at)
             VALUES ($1, $2, 1, now(), now())
             ON CONFLICT (actor_id) DO UPDATE
                 SET state = EXCLUDED.state,
                     version = actor_state.version + 1,
                     updated_at = now()
             RETURNING version",
        )
        .bind(actor_id.to_string())
        .bind(state)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("version") as u64)
    }

    async fn save_if_version(
        &self,
        actor_id: &ActorId,
        state: &[u8],
        expected_version: u64,
    ) -> StateResult<u64> {
        let key = actor_id.to_string();
        let written: Option<i64> = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO actor_state (actor_id, state, version, updated_at, created_at)
                 VALUES ($1, $2, 1, now(), now())
                 ON CONFLICT (actor_id) DO NOTHING
                 RETURNING version",
            )
            .bind(&key)
            .bind(state)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.get("version"))
        } else {
            sqlx::query(
                "UPDATE actor_state
                 SET state = $2, version = version + 1, updated_at = now()
                 WHERE actor_id = $1 AND version = $3
                 RETURNING version",
            )
            .bind(&key)
            .bind(state)
            .bind(expected_version as i64)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.get("version"))
        };
        match written {
            Some(version) => Ok(version as u64),
            None => {
                let actual = self.get_version(actor_id).await?.unwrap_or(0);
                Err(StateError::VersionConflict {
                    expected: expected_version,
                    actual,
                })
            }
        }
    }

    async fn get_version(&self, actor_id: &ActorId) -> StateResult<Option<u64>> {
        let row = sqlx::query("SELECT version FROM actor_state WHERE actor_id = $1")
            .bind(actor_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u64))
    }

    fn changes(&self) -> broadcast::Receiver<StateChangeNotification> {
        self.changes_tx.subscribe()
    }
}
