//! Optimistic concurrency: compare-and-swap conflicts recover by
//! retry-and-rebase with no lost update.

use am_protocol::ActorId;
use am_state::{update_with_retry, MemoryStore, StateError, StateStore};
use serde_json::json;

fn counter(bytes: Option<&[u8]>) -> i64 {
    bytes
        .and_then(|b| serde_json::from_slice::<serde_json::Value>(b).ok())
        .and_then(|v| v.get("count").and_then(|c| c.as_i64()))
        .unwrap_or(0)
}

fn encode(count: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({ "count": count })).unwrap()
}

/// Seed `{count: 5}` at version 3.
async fn seed(store: &MemoryStore, id: &ActorId) {
    for _ in 0..3 {
        store.save(id, &encode(5)).await.unwrap();
    }
    assert_eq!(store.get_version(id).await.unwrap(), Some(3));
}

#[tokio::test(start_paused = true)]
async fn losing_writer_rebases_and_preserves_both_updates() {
    let store = MemoryStore::new();
    let id = ActorId::local("counter");
    seed(&store, &id).await;

    // Both writers load version 3.
    let first = store.load(&id).await.unwrap().unwrap();
    let second = store.load(&id).await.unwrap().unwrap();
    assert_eq!(first.version, 3);
    assert_eq!(second.version, 3);

    // The first save wins, producing {count: 6} at version 4.
    let v4 = store
        .save_if_version(&id, &encode(counter(Some(&first.state)) + 1), 3)
        .await
        .unwrap();
    assert_eq!(v4, 4);

    // The second writer's stale save conflicts...
    let err = store
        .save_if_version(&id, &encode(counter(Some(&second.state)) + 1), 3)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StateError::VersionConflict { expected: 3, actual: 4 }
    ));

    // ...and the retry loop reloads version 4, rebases, and lands at 5.
    let stored = update_with_retry(&store, &id, |state| encode(counter(state) + 1), 3)
        .await
        .unwrap();
    assert_eq!(counter(Some(&stored)), 7);

    let record = store.load(&id).await.unwrap().unwrap();
    assert_eq!(record.version, 5);
    assert_eq!(counter(Some(&record.state)), 7);
}

#[tokio::test(start_paused = true)]
async fn concurrent_updates_never_lose_an_increment() {
    let store = std::sync::Arc::new(MemoryStore::new());
    let id = ActorId::local("counter");
    seed(&store, &id).await;

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let store = std::sync::Arc::clone(&store);
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            update_with_retry(store.as_ref(), &id, |state| encode(counter(state) + 1), 3).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let record = store.load(&id).await.unwrap().unwrap();
    assert_eq!(counter(Some(&record.state)), 7, "one increment was lost");
    assert_eq!(record.version, 5);
}
