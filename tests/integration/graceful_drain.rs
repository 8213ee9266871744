//! Graceful drain: in-flight invocations finish, health reports draining,
//! and shutdown returns without cancelling anything.

use am_protocol::{ActorId, ArgumentWriter};
use am_runtime::{
    ActorRegistry, Client, DrainOutcome, HealthStatus, ReconnectPolicy, Server, StreamSettings,
};
use am_test_utils::{init_tracing, SleeperActor};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn sleep_args(millis: u64) -> ArgumentWriter {
    let mut args = ArgumentWriter::new();
    args.record(&millis).unwrap();
    args
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_waits_for_in_flight_work() {
    init_tracing();
    let registry = ActorRegistry::new();
    // Three distinct actors so the 500 ms sleeps run concurrently instead
    // of queueing on one actor's turn.
    for i in 0..3 {
        registry
            .register(ActorId::local(format!("sleeper-{i}")), Arc::new(SleeperActor))
            .await;
    }
    let server = Server::bind("127.0.0.1:0", registry).await.unwrap();
    let addr = server.local_addr();
    let probe = server.health_probe();
    assert_eq!(probe.report().status, HealthStatus::Healthy);

    let client = Client::connect_with(
        &addr.ip().to_string(),
        addr.port(),
        ReconnectPolicy::disabled(),
        StreamSettings::default(),
    )
    .await
    .unwrap();

    let mut calls = Vec::new();
    for i in 0..3 {
        let reference = client.resolve(&format!("sleeper-{i}"));
        calls.push(tokio::spawn(async move {
            reference.invoke_void("sleep", sleep_args(500)).await
        }));
    }

    // Let the invocations reach the server before draining.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(probe.report().inflight, 3);

    let started = Instant::now();
    let shutdown = tokio::spawn(server.shutdown(Duration::from_secs(2)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(probe.report().status, HealthStatus::Draining);

    let outcome = shutdown.await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(outcome, DrainOutcome::Drained);
    assert!(elapsed < Duration::from_millis(1500), "drain took {elapsed:?}");
    assert_eq!(probe.report().inflight, 0);
    assert_eq!(probe.report().status, HealthStatus::Unhealthy);

    // No call was cancelled: all three completed normally.
    for call in calls {
        call.await.unwrap().unwrap();
    }

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_timeout_cancels_stragglers() {
    init_tracing();
    let registry = ActorRegistry::new();
    registry
        .register(ActorId::local("sleeper-0"), Arc::new(SleeperActor))
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

    let reference = client.resolve("sleeper-0");
    let straggler =
        tokio::spawn(async move { reference.invoke_void("sleep", sleep_args(10_000)).await });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let outcome = server.shutdown(Duration::from_millis(200)).await;
    assert_eq!(outcome, DrainOutcome::TimedOut);

    // The caller observes the connection closing, not a silent hang.
    let err = straggler.await.unwrap().unwrap_err();
    assert!(
        matches!(
            err,
            am_runtime::RuntimeError::ConnectionClosed | am_runtime::RuntimeError::SystemNotRunning
        ),
        "got {err:?}"
    );

    client.close().await;
}
