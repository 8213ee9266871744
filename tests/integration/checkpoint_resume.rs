//! Resume after reconnect: the client replays its checkpoint, the server
//! continues past it, and the consumer sees no gap and no re-delivery.

use am_protocol::{Blob, Envelope, StreamData, StreamEnd, StreamEndReason, StreamStart};
use am_runtime::{Client, ClientEvent, ConnectionState, ReconnectPolicy, StreamSettings};
use am_test_utils::{init_tracing, MockServer};
use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

fn data(stream_id: Uuid, seq: u64) -> Envelope {
    Envelope::StreamData(StreamData {
        stream_id,
        seq,
        payload: Blob::new(seq.to_string().into_bytes()),
        timestamp: Utc::now(),
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_resumes_from_checkpoint_without_gap_or_redelivery() {
    init_tracing();
    let mut mock = MockServer::start().await.unwrap();
    let client = Client::connect_with(
        &mock.host(),
        mock.port(),
        ReconnectPolicy {
            max_attempts: Some(5),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
        },
        StreamSettings::default(),
    )
    .await
    .unwrap();
    let mut events = client.events();
    let mut states = client.state();

    let mut subscription = client.resolve("feed").subscribe("watch").await.unwrap();

    // First connection: confirm the stream and deliver seq 1..=10.
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
    for seq in 1..=10 {
        conn.send(&data(canonical, seq)).await;
    }

    let mut received = Vec::new();
    for _ in 0..10 {
        let payload = subscription.next().await.unwrap().unwrap();
        received.push(String::from_utf8(payload).unwrap());
    }
    assert_eq!(received.last().map(String::as_str), Some("10"));

    // Simulate transport loss.
    conn.abort();

    // Second connection: the client leads with its checkpoint.
    let mut conn = mock.accept().await;
    let Some(Envelope::StreamResume(resume)) = conn.recv().await else {
        panic!("expected stream resume");
    };
    assert_eq!(resume.stream_id, canonical);
    assert_eq!(resume.last_seq, 10);
    assert_eq!(resume.method, "watch");

    // Replay overlap (8..=10 again) plus the new tail; overlap must be
    // suppressed by the client's sequence filter.
    for seq in 8..=13 {
        conn.send(&data(canonical, seq)).await;
    }
    conn.send(&Envelope::StreamEnd(StreamEnd {
        stream_id: canonical,
        reason: StreamEndReason::Completed,
    }))
    .await;

    while let Some(item) = subscription.next().await {
        received.push(String::from_utf8(item.unwrap()).unwrap());
    }
    let expected: Vec<String> = (1..=13).map(|n| n.to_string()).collect();
    assert_eq!(received, expected);
    assert_eq!(subscription.end_reason(), Some(StreamEndReason::Completed));

    // Observers saw the disconnect/reconnect cycle.
    let mut saw_disconnect = false;
    let mut saw_reconnect = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ClientEvent::DidDisconnect => saw_disconnect = true,
            ClientEvent::DidConnect if saw_disconnect => saw_reconnect = true,
            _ => {}
        }
    }
    assert!(saw_disconnect && saw_reconnect);
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_reconnects_fail_the_streams() {
    init_tracing();
    let mut mock = MockServer::start().await.unwrap();
    let client = Client::connect_with(
        &mock.host(),
        mock.port(),
        ReconnectPolicy {
            max_attempts: Some(1),
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
        },
        StreamSettings::default(),
    )
    .await
    .unwrap();
    let mut states = client.state();

    let mut subscription = client.resolve("feed").subscribe("watch").await.unwrap();
    let mut conn = mock.accept().await;
    let Some(Envelope::StreamStart(request)) = conn.recv().await else {
        panic!("expected subscribe request");
    };
    let canonical = Uuid::new_v4();
    conn.send(&Envelope::StreamStart(StreamStart {
        stream_id: canonical,
        call_id: request.call_id,
        actor_id: request.actor_id,
        method: request.method,
        filter: None,
    }))
    .await;
    conn.send(&data(canonical, 1)).await;
    assert_eq!(
        subscription.next().await.unwrap().unwrap(),
        b"1".to_vec()
    );

    // Kill the server entirely (listener first, so the reconnect attempt
    // cannot race into a half-dead acceptor), then the live session.
    drop(mock);
    conn.abort();

    // The consumer terminates instead of hanging.
    assert!(subscription.next().await.is_none());
    assert_eq!(
        subscription.end_reason(),
        Some(StreamEndReason::ConnectionClosed)
    );

    // And the manager parked in `failed`.
    loop {
        if *states.borrow_and_update() == ConnectionState::Failed {
            break;
        }
        states.changed().await.unwrap();
    }

    client.close().await;
}
