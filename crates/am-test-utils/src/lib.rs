// am-test-utils: shared fixtures for runtime tests.
//
// An in-memory frame transport, a handful of sample actors, and a server
// spawner.  Each test spins up its own isolated instances.

mod actors;
mod channel_link;
mod mock_server;

pub use actors::{EchoActor, SequenceActor, SleeperActor};
pub use channel_link::{link_pair, ChannelLink};
pub use mock_server::{MockConnection, MockServer};

use am_runtime::{ActorRegistry, RuntimeResult, Server};
use std::sync::Arc;

/// Bind a server on a random loopback port.
pub async fn spawn_server(registry: Arc<ActorRegistry>) -> RuntimeResult<Server> {
    Server::bind("127.0.0.1:0", registry).await
}

/// Install a test tracing subscriber honoring `RUST_LOG`; repeated calls
/// are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
