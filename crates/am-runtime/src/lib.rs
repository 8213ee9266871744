// am-runtime: the distributed-actor RPC runtime.
//
// A server process hosts actor instances behind a message-framed
// transport; clients resolve remote references, invoke methods, and
// subscribe to resumable push streams.  Wire types live in `am-protocol`,
// the state-store contract in `am-state`; this crate owns the transport
// boundary, invocation dispatch, the stream engine, the actor registry,
// server lifecycle, and the client connection manager.

pub mod client;
pub mod config;
pub mod delta;
mod dispatch;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod link;
pub mod registry;
pub mod server;

pub use client::{
    Checkpoint, Client, ClientEvent, ConnectionState, InvokeOptions, ReconnectPolicy, RemoteRef,
    Subscription,
};
pub use config::{load_config, parse_config, RuntimeConfig, ServerSettings, StreamSettings};
pub use delta::{DeltaApplier, DeltaManager, DeltaStrategy};
pub use error::{RuntimeError, RuntimeResult};
pub use filter::{evaluate, FilterState};
pub use hooks::{EventCallback, EventHooks, InvocationGate};
pub use link::{ws_accept, ws_connect, FrameLink, WsLink};
pub use registry::{
    ActorHandle, ActorProvider, ActorRegistry, InvocationContext, RegisteredActor, ValueStream,
};
pub use server::{
    DrainOutcome, HealthProbe, HealthReport, HealthStatus, Server, ServerBuilder,
    ACTOR_NOT_FOUND_PREFIX,
};
