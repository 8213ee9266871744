//! Embedded SQLite backend.
//!
//! Suited to single-node deployments and durable client-side state.  The
//! connection sits behind an async mutex; each operation runs its reads
//! and writes under one acquisition, which is what makes the
//! compare-and-swap atomic.

use crate::{StateError, StateRecord, StateResult, StateStore};
use am_protocol::{ActorId, StateChangeNotification};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::{broadcast, Mutex};

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes_tx: broadcast::Sender<StateChangeNotification>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StateResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StateResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StateResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        let (changes_tx, _) = broadcast::channel(256);
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            changes_tx,
        })
    }

    fn notify(&self, actor_id: &ActorId, version: u64, at: DateTime<Utc>) {
        let _ = self.changes_tx.send(StateChangeNotification {
            actor_id: actor_id.to_string(),
            sequence: version,
            timestamp_seconds: at.timestamp(),
        });
    }

    fn current_version(conn: &Connection, key: &str) -> StateResult<Option<u64>> {
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM actor_state WHERE actor_id = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    fn write(
        conn: &Connection,
        actor_id: &ActorId,
        state: &[u8],
        version: u64,
        now: DateTime<Utc>,
    ) -> StateResult<()> {
        conn.execute(
            "INSERT INTO actor_state (actor_id, state, version, updated_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (actor_id) DO UPDATE
                 SET state = excluded.state,
                     version = excluded.version,
                     updated_at = excluded.updated_at",
            params![actor_id.to_string(), state, version as i64, now.to_rfc3339()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load(&self, actor_id: &ActorId) -> StateResult<Option<StateRecord>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT state, version, updated_at, created_at
                 FROM actor_state WHERE actor_id = ?1",
                params![actor_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((state, version, updated_at, created_at)) => Ok(Some(StateRecord {
                actor_id: actor_id.clone(),
                state,
                version: version as u64,
                updated_at: parse_timestamp(&updated_at)?,
                created_at: parse_timestamp(&created_at)?,
            })),
        }
    }

    async fn save(&self, actor_id: &ActorId, state: &[u8]) -> StateResult<u64> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let version = Self::current_version(&conn, &actor_id.to_string())?.unwrap_or(0) + 1;
        Self::write(&conn, actor_id, state, version, now)?;
        drop(conn);
        self.notify(actor_id, version, now);
        Ok(version)
    }

    async fn save_if_version(
        &self,
        actor_id: &ActorId,
        state: &[u8],
        expected_version: u64,
    ) -> StateResult<u64> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let actual = Self::current_version(&conn, &actor_id.to_string())?.unwrap_or(0);
        if actual != expected_version {
            return Err(StateError::VersionConflict {
                expected: expected_version,
                actual,
            });
        }
        let version = actual + 1;
        Self::write(&conn, actor_id, state, version, now)?;
        drop(conn);
        self.notify(actor_id, version, now);
        Ok(version)
    }

    async fn get_version(&self, actor_id: &ActorId) -> StateResult<Option<u64>> {
        let conn = self.conn.lock().await;
        Self::current_version(&conn, &actor_id.to_string())
    }

    fn changes(&self) -> broadcast::Receiver<StateChangeNotification> {
        self.changes_tx.subscribe()
    }
}

fn parse_timestamp(text: &str) -> StateResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::Backend(format!("bad timestamp `{text}`: {e}")))
}
