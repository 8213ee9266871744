//! Client-side sequence discipline: duplicate frames are delivered exactly
//! once, and dropping the consumer unsubscribes server side.

use am_protocol::{Blob, Envelope, StreamData, StreamEnd, StreamEndReason, StreamStart};
use am_runtime::{
    ActorRegistry, Client, EventHooks, ReconnectPolicy, Server, StreamSettings,
};
use am_test_utils::{init_tracing, MockServer, SequenceActor};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn data(stream_id: Uuid, seq: u64, payload: &[u8]) -> Envelope {
    Envelope::StreamData(StreamData {
        stream_id,
        seq,
        payload: Blob::new(payload.to_vec()),
        timestamp: Utc::now(),
    })
}

#[tokio::test]
async fn duplicate_sequence_numbers_deliver_once() {
    init_tracing();
    let mut mock = MockServer::start().await.unwrap();
    let client = Client::connect_with(
        &mock.host(),
        mock.port(),
        ReconnectPolicy::disabled(),
        StreamSettings::default(),
    )
    .await
    .unwrap();

    let mut subscription = client.resolve("feed").subscribe("watch").await.unwrap();

    let mut conn = mock.accept().await;
    let Some(Envelope::StreamStart(request)) = conn.recv().await else {
        panic!("expected subscribe request");
    };
    let canonical = Uuid::new_v4();
    conn.send(&Envelope::StreamStart(StreamStart {
        stream_id: canonical,
        call_id: request.call_id,
        actor_id: request.actor_id.clone(),
        method: request.method.clone(),
        filter: None,
    }))
    .await;

    // Same sequence number twice, then the next one.
    conn.send(&data(canonical, 1, b"x")).await;
    conn.send(&data(canonical, 1, b"y")).await;
    conn.send(&data(canonical, 2, b"z")).await;
    conn.send(&Envelope::StreamEnd(StreamEnd {
        stream_id: canonical,
        reason: StreamEndReason::Completed,
    }))
    .await;

    let mut received = Vec::new();
    while let Some(item) = subscription.next().await {
        received.push(item.unwrap());
    }
    assert_eq!(received, vec![b"x".to_vec(), b"z".to_vec()]);
    assert_eq!(subscription.end_reason(), Some(StreamEndReason::Completed));

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_consumer_unsubscribes() {
    init_tracing();
    let registry = ActorRegistry::new();
    registry
        .register(
            am_protocol::ActorId::local("feed"),
            Arc::new(
                SequenceActor::of_strs(&["a", "b", "c", "d", "e", "f"])
                    .paced(Duration::from_millis(20)),
            ),
        )
        .await;
    let ended = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&ended);
    let server = Server::builder(registry)
        .hooks(EventHooks {
            on_stream_end: Some(Arc::new(move |_id, _method| {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        })
        .bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr();
    let client = Client::connect_with(
        &addr.ip().to_string(),
        addr.port(),
        ReconnectPolicy::disabled(),
        StreamSettings::default(),
    )
    .await
    .unwrap();

    let mut subscription = client.resolve("feed").subscribe("watch").await.unwrap();
    let first = subscription.next().await.unwrap().unwrap();
    assert_eq!(first, b"a".to_vec());
    drop(subscription);

    // The server ends the publisher with client-unsubscribed; the hook
    // records the single terminator.
    tokio::time::timeout(Duration::from_secs(2), async {
        while ended.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stream end hook fired");
    assert_eq!(ended.load(Ordering::SeqCst), 1);

    client.close().await;
}
