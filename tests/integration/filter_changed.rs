//! Server-side filtering end to end: a `changed` filter collapses runs of
//! equal values.

use am_protocol::{ActorId, FilterSpec, StreamEndReason};
use am_runtime::{ActorRegistry, Client, ReconnectPolicy, Server, StreamSettings};
use am_test_utils::{init_tracing, SequenceActor};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread")]
async fn changed_filter_collapses_equal_runs() {
    init_tracing();
    let registry = ActorRegistry::new();
    registry
        .register(
            ActorId::local("feed"),
            Arc::new(SequenceActor::of_strs(&["A", "A", "B", "B", "C"])),
        )
        .await;
    let server = Server::bind("127.0.0.1:0", registry).await.unwrap();
    let addr = server.local_addr();
    let client = Client::connect_with(
        &addr.ip().to_string(),
        addr.port(),
        ReconnectPolicy::disabled(),
        StreamSettings::default(),
    )
    .await
    .unwrap();

    let mut subscription = client
        .resolve("feed")
        .subscribe_with("watch", Some(FilterSpec::predefined("changed")), None)
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Some(item) = subscription.next().await {
        received.push(String::from_utf8(item.unwrap()).unwrap());
    }
    assert_eq!(received, vec!["A", "B", "C"]);
    assert_eq!(subscription.end_reason(), Some(StreamEndReason::Completed));

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unfiltered_stream_delivers_everything() {
    init_tracing();
    let registry = ActorRegistry::new();
    registry
        .register(
            ActorId::local("feed"),
            Arc::new(SequenceActor::of_strs(&["A", "A", "B"])),
        )
        .await;
    let server = Server::bind("127.0.0.1:0", registry).await.unwrap();
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
    let mut received = Vec::new();
    while let Some(item) = subscription.next().await {
        received.push(String::from_utf8(item.unwrap()).unwrap());
    }
    assert_eq!(received, vec!["A", "A", "B"]);

    client.close().await;
}
