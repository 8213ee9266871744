//! Local short-circuit: a co-located actor executes in-process, without
//! any transport traffic.

use am_protocol::{ActorId, ArgumentWriter};
use am_runtime::{ActorRegistry, Client, ReconnectPolicy, StreamSettings};
use am_test_utils::{init_tracing, spawn_server, EchoActor};
use std::sync::Arc;

fn echo_args(input: &str) -> ArgumentWriter {
    let mut args = ArgumentWriter::new();
    args.record(&input).unwrap();
    args
}

#[tokio::test]
async fn local_actor_echoes_without_transport() {
    init_tracing();
    let registry = ActorRegistry::new();
    registry
        .register(ActorId::local("echo"), Arc::new(EchoActor))
        .await;

    let result = registry
        .invoke_local(&ActorId::local("echo"), "echo", echo_args("Hello").finish())
        .await
        .unwrap()
        .expect("echo returns a value");
    let decoded: String = serde_json::from_slice(result.as_bytes()).unwrap();
    assert_eq!(decoded, "Echo: Hello");
}

#[tokio::test]
async fn client_short_circuits_co_located_actors() {
    init_tracing();
    // The server hosts nothing; if the call crossed the wire it would fail
    // with actor-not-found.  The local registry answering proves the
    // short-circuit path never touched the transport.
    let server = spawn_server(ActorRegistry::new()).await.unwrap();
    let addr = server.local_addr();
    let client = Client::connect_with(
        &addr.ip().to_string(),
        addr.port(),
        ReconnectPolicy::disabled(),
        StreamSettings::default(),
    )
    .await
    .unwrap();

    let local = ActorRegistry::new();
    local
        .register(ActorId::local("echo"), Arc::new(EchoActor))
        .await;
    client.set_local_registry(local);

    let reference = client.resolve("echo");
    let result: String = reference.invoke("echo", echo_args("Hello")).await.unwrap();
    assert_eq!(result, "Echo: Hello");

    client.close().await;
}
