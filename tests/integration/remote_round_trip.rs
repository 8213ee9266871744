//! Remote invocation over loopback: value calls, void calls, error
//! propagation, middleware rejection, and invocation hooks.

use am_protocol::{ActorId, ArgumentWriter, Invocation, TraceContext};
use am_runtime::{
    ActorRegistry, Client, EventHooks, InvocationGate, InvokeOptions, ReconnectPolicy,
    RuntimeError, Server, StreamSettings,
};
use am_test_utils::{init_tracing, EchoActor};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn echo_args(input: &str) -> ArgumentWriter {
    let mut args = ArgumentWriter::new();
    args.record(&input).unwrap();
    args
}

async fn connect(addr: std::net::SocketAddr) -> Client {
    Client::connect_with(
        &addr.ip().to_string(),
        addr.port(),
        ReconnectPolicy::disabled(),
        StreamSettings::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn five_sequential_calls_round_trip_in_order() {
    init_tracing();
    let registry = ActorRegistry::new();
    registry
        .register(ActorId::local("echo"), Arc::new(EchoActor))
        .await;
    let server = Server::bind("127.0.0.1:0", registry).await.unwrap();
    let client = connect(server.local_addr()).await;

    let reference = client.resolve("echo");
    for i in 0..5 {
        let input = format!("Call {i}");
        let result: String = reference.invoke("echo", echo_args(&input)).await.unwrap();
        assert_eq!(result, format!("Echo: Call {i}"));
    }

    client.close().await;
}

#[tokio::test]
async fn void_calls_and_remote_errors_propagate() {
    init_tracing();
    let registry = ActorRegistry::new();
    registry
        .register(ActorId::local("echo"), Arc::new(EchoActor))
        .await;
    let server = Server::bind("127.0.0.1:0", registry).await.unwrap();
    let client = connect(server.local_addr()).await;
    let reference = client.resolve("echo");

    reference.invoke_void("ping", ArgumentWriter::new()).await.unwrap();

    let err = reference
        .invoke_void("fail", ArgumentWriter::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RuntimeError::RemoteInvocationFailed(ref m) if m == "intentional failure"),
        "got {err:?}"
    );

    let err = client
        .resolve("missing")
        .invoke_void("ping", ArgumentWriter::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ActorNotFound(_)), "got {err:?}");

    client.close().await;
}

struct DenyFail;

#[async_trait]
impl InvocationGate for DenyFail {
    async fn check(&self, invocation: &Invocation) -> Result<(), String> {
        if invocation.method == "fail" {
            Err("method is blocked by policy".to_owned())
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn middleware_rejection_becomes_an_error_response() {
    init_tracing();
    let registry = ActorRegistry::new();
    registry
        .register(ActorId::local("echo"), Arc::new(EchoActor))
        .await;
    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&invocations);
    let server = Server::builder(registry)
        .hooks(EventHooks {
            on_invocation: Some(Arc::new(move |_id, _method| {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        })
        .gate(Arc::new(DenyFail))
        .bind("127.0.0.1:0")
        .await
        .unwrap();
    let client = connect(server.local_addr()).await;
    let reference = client.resolve("echo");

    // Rejected before dispatch; the connection survives and the hook never
    // fires for the blocked call.
    let err = reference
        .invoke_void("fail", ArgumentWriter::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RuntimeError::RemoteInvocationFailed(ref m) if m.contains("blocked")),
        "got {err:?}"
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    // Subsequent traffic on the same connection still works, with a trace
    // context attached.
    let trace = TraceContext::root();
    let result: String = reference
        .invoke_with(
            "echo",
            echo_args("after"),
            InvokeOptions {
                trace: Some(trace.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, "Echo: after");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    client.close().await;
}
