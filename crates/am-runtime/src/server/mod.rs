//! Server lifecycle: accept loop, drain, health.

mod conn;
mod inflight;
mod publish;

pub use conn::ACTOR_NOT_FOUND_PREFIX;
pub use inflight::{HealthReport, HealthStatus};

use crate::config::StreamSettings;
use crate::error::{RuntimeError, RuntimeResult};
use crate::hooks::{EventHooks, InvocationGate};
use crate::link::ws_accept;
use crate::registry::ActorRegistry;
use inflight::Inflight;
use publish::PublisherRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Running,
    Draining,
    Stopped,
}

pub(crate) struct ServerShared {
    pub registry: Arc<ActorRegistry>,
    pub publishers: PublisherRegistry,
    pub hooks: EventHooks,
    pub gates: Vec<Arc<dyn InvocationGate>>,
    pub inflight: Arc<Inflight>,
    pub phase_tx: watch::Sender<Phase>,
}

/// Outcome of [`Server::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight invocation completed inside the timeout.
    Drained,
    /// The timeout elapsed; outstanding operations were cancelled.
    TimedOut,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ServerBuilder {
    registry: Arc<ActorRegistry>,
    hooks: EventHooks,
    gates: Vec<Arc<dyn InvocationGate>>,
    settings: StreamSettings,
}

impl ServerBuilder {
    pub fn hooks(mut self, hooks: EventHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Append a middleware gate; gates run in registration order.
    pub fn gate(mut self, gate: Arc<dyn InvocationGate>) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn stream_settings(mut self, settings: StreamSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn bind(self, addr: &str) -> RuntimeResult<Server> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            let (host, port) = split_addr(addr);
            RuntimeError::ConnectionFailed {
                host,
                port,
                cause: e.to_string(),
            }
        })?;
        let local_addr = listener.local_addr().map_err(|e| RuntimeError::InvalidConfiguration(
            format!("bound listener has no local addr: {e}"),
        ))?;

        let (phase_tx, _) = watch::channel(Phase::Running);
        let shared = Arc::new(ServerShared {
            registry: self.registry,
            publishers: PublisherRegistry::new(self.settings.replay_capacity),
            hooks: self.hooks,
            gates: self.gates,
            inflight: Inflight::new(),
            phase_tx,
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        info!(addr = %local_addr, "server listening");
        Ok(Server {
            shared,
            local_addr,
            accept_task,
        })
    }
}

fn split_addr(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_owned(), port.parse().unwrap_or(0)),
        None => (addr.to_owned(), 0),
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct Server {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Server {
    pub fn builder(registry: Arc<ActorRegistry>) -> ServerBuilder {
        ServerBuilder {
            registry,
            hooks: EventHooks::default(),
            gates: Vec::new(),
            settings: StreamSettings::default(),
        }
    }

    /// Bind with default hooks and settings.
    pub async fn bind(addr: &str, registry: Arc<ActorRegistry>) -> RuntimeResult<Server> {
        Self::builder(registry).bind(addr).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ActorRegistry> {
        &self.shared.registry
    }

    pub fn inflight(&self) -> u64 {
        self.shared.inflight.count()
    }

    pub fn health(&self) -> HealthReport {
        self.health_probe().report()
    }

    /// A cloneable probe that keeps reporting through and after shutdown;
    /// the piece a health endpoint holds on to.
    pub fn health_probe(&self) -> HealthProbe {
        HealthProbe {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Graceful drain.
    ///
    /// Marks health as draining (probes should now report not-ready),
    /// stops accepting connections, and waits for the in-flight counter to
    /// reach zero.  On timeout, outstanding operations are cancelled and
    /// every session is closed.
    pub async fn shutdown(self, timeout: Duration) -> DrainOutcome {
        let _ = self.shared.phase_tx.send(Phase::Draining);
        info!(inflight = self.shared.inflight.count(), "draining");

        let drained = tokio::select! {
            () = self.shared.inflight.wait_zero() => true,
            () = tokio::time::sleep(timeout) => false,
        };

        let _ = self.shared.phase_tx.send(Phase::Stopped);
        self.accept_task.abort();
        if drained {
            info!("drained cleanly");
            DrainOutcome::Drained
        } else {
            warn!(
                inflight = self.shared.inflight.count(),
                "drain timed out; cancelling outstanding operations"
            );
            DrainOutcome::TimedOut
        }
    }
}

#[derive(Clone)]
pub struct HealthProbe {
    shared: Arc<ServerShared>,
}

impl HealthProbe {
    pub fn report(&self) -> HealthReport {
        let status = match *self.shared.phase_tx.borrow() {
            Phase::Running => HealthStatus::Healthy,
            Phase::Draining => HealthStatus::Draining,
            Phase::Stopped => HealthStatus::Unhealthy,
        };
        HealthReport {
            status,
            inflight: self.shared.inflight.count(),
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    let mut phase_rx = shared.phase_tx.subscribe();
    loop {
        tokio::select! {
            _ = phase_rx.changed() => {
                if *phase_rx.borrow() != Phase::Running {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        match ws_accept(socket).await {
                            Ok(link) => {
                                conn::run_connection(Box::new(link), shared, peer.to_string())
                                    .await;
                            }
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
    // Dropping the listener is what stops new connections.
}
