//! Cross-replica change fan-out.
//!
//! One task consumes the store's change feed; for every notification it
//! reloads the actor's state and re-broadcasts the fresh record to the
//! local watchers registered for that actor.  Stream publishers driven by
//! persisted state subscribe here rather than polling the store.

use crate::{StateRecord, StateStore};
use am_protocol::ActorId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type WatcherRegistry = RwLock<HashMap<String, broadcast::Sender<StateRecord>>>;

pub struct ChangeFanout {
    store: Arc<dyn StateStore>,
    watchers: WatcherRegistry,
}

impl ChangeFanout {
    pub fn new(store: Arc<dyn StateStore>) -> Arc<Self> {
        Arc::new(ChangeFanout {
            store,
            watchers: RwLock::new(HashMap::new()),
        })
    }

    /// Subscribe to fresh state records for one actor.
    pub async fn watch(&self, actor_id: &ActorId) -> broadcast::Receiver<StateRecord> {
        let key = actor_id.to_string();
        {
            let watchers = self.watchers.read().await;
            if let Some(tx) = watchers.get(&key) {
                return tx.subscribe();
            }
        }
        let mut watchers = self.watchers.write().await;
        if let Some(tx) = watchers.get(&key) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(64);
        watchers.insert(key, tx);
        rx
    }

    /// Spawn the fan-out task.  It runs until the store's change feed
    /// closes.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let fanout = Arc::clone(self);
        let mut changes = fanout.store.changes();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => fanout.dispatch(&change.actor_id).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Reloads always fetch the latest record, so lagging
                        // only costs intermediate versions.
                        debug!(skipped, "change feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn dispatch(&self, actor_key: &str) {
        let tx = {
            let watchers = self.watchers.read().await;
            match watchers.get(actor_key) {
                Some(tx) => tx.clone(),
                None => return,
            }
        };
        let actor_id: ActorId = match actor_key.parse() {
            Ok(id) => id,
            Err(e) => {
                warn!(actor_id = actor_key, error = %e, "unparseable actor id in change notification");
                return;
            }
        };
        match self.store.load(&actor_id).await {
            Ok(Some(record)) => {
                let _ = tx.send(record);
            }
            Ok(None) => {
                debug!(actor_id = actor_key, "state vanished between notify and reload");
            }
            Err(e) => {
                warn!(actor_id = actor_key, error = %e, "reload after change notification failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn id(s: &str) -> ActorId {
        ActorId::local(s)
    }

    #[tokio::test]
    async fn watchers_receive_reloaded_records() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let fanout = ChangeFanout::new(Arc::clone(&store));
        let mut rx = fanout.watch(&id("counter")).await;
        let _task = fanout.spawn();

        store.save(&id("counter"), b"{\"count\":1}").await.unwrap();
        let record = rx.recv().await.unwrap();
        assert_eq!(record.state, b"{\"count\":1}");
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn unwatched_actors_are_ignored() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let fanout = ChangeFanout::new(Arc::clone(&store));
        let mut rx = fanout.watch(&id("watched")).await;
        let _task = fanout.spawn();

        store.save(&id("ignored"), b"x").await.unwrap();
        store.save(&id("watched"), b"y").await.unwrap();
        // Only the watched actor's record arrives.
        let record = rx.recv().await.unwrap();
        assert_eq!(record.actor_id, id("watched"));
        assert_eq!(record.state, b"y");
    }

    #[tokio::test]
    async fn second_watcher_shares_the_channel() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let fanout = ChangeFanout::new(Arc::clone(&store));
        let mut rx1 = fanout.watch(&id("a")).await;
        let mut rx2 = fanout.watch(&id("a")).await;
        let _task = fanout.spawn();

        store.save(&id("a"), b"z").await.unwrap();
        assert_eq!(rx1.recv().await.unwrap().version, 1);
        assert_eq!(rx2.recv().await.unwrap().version, 1);
    }
}
