//! Frames racing the consumer into existence are buffered and flushed in
//! order: the server may push data immediately after the canonical
//! StreamStart, before the subscriber has observably attached.

use am_protocol::{Blob, Envelope, StreamData, StreamEnd, StreamEndReason, StreamStart};
use am_runtime::{Client, ReconnectPolicy, StreamSettings};
use am_test_utils::{init_tracing, MockServer};
use chrono::Utc;
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
async fn early_frames_arrive_in_order_before_later_ones() {
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
    // Reply and push two frames back-to-back, racing the client's attach;
    // then a third after the earlier ones must already be queued.
    conn.send(&Envelope::StreamStart(StreamStart {
        stream_id: canonical,
        call_id: request.call_id,
        actor_id: request.actor_id.clone(),
        method: request.method.clone(),
        filter: None,
    }))
    .await;
    conn.send(&data(canonical, 1, b"first")).await;
    conn.send(&data(canonical, 2, b"second")).await;
    conn.send(&data(canonical, 3, b"third")).await;
    conn.send(&Envelope::StreamEnd(StreamEnd {
        stream_id: canonical,
        reason: StreamEndReason::Completed,
    }))
    .await;

    let mut received = Vec::new();
    while let Some(item) = subscription.next().await {
        received.push(String::from_utf8(item.unwrap()).unwrap());
    }
    assert_eq!(received, vec!["first", "second", "third"]);

    client.close().await;
}
