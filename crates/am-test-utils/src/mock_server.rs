//! A scriptable mock server for client-side protocol tests.
//!
//! Binds to port 0 (random) and exposes the bound port; each test spins up
//! its own isolated instance.  Accepted connections are handed to the test
//! as [`MockConnection`]s, which speak whole envelopes so a test can reply
//! with exactly the frames (or frame abuse) the scenario needs —
//! duplicates, out-of-order sequences, abrupt closes.

use am_protocol::{decode_envelope, encode_envelope, Envelope};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

pub struct MockServer {
    addr: SocketAddr,
    connections: mpsc::Receiver<MockConnection>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (conn_tx, connections) = mpsc::channel(8);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _peer)) = listener.accept().await else {
                    break;
                };
                let Ok(ws) = tokio_tungstenite::accept_async(socket).await else {
                    continue;
                };
                if conn_tx.send(MockConnection { ws }).await.is_err() {
                    break;
                }
            }
        });
        Ok(MockServer {
            addr,
            connections,
            accept_task,
        })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The next client connection (e.g. the reconnect after a drop).
    pub async fn accept(&mut self) -> MockConnection {
        self.connections
            .recv()
            .await
            .expect("mock server accept loop ended")
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        // Stop accepting and release the port so tests can assert
        // reconnect failure deterministically.
        self.accept_task.abort();
    }
}

pub struct MockConnection {
    ws: WebSocketStream<TcpStream>,
}

impl MockConnection {
    pub async fn send(&mut self, envelope: &Envelope) {
        let bytes = encode_envelope(envelope).expect("test envelope encodes");
        let text = String::from_utf8(bytes).expect("envelope is JSON text");
        self.ws
            .send(Message::Text(text.into()))
            .await
            .expect("mock send");
    }

    /// Next decoded envelope; `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(
                        decode_envelope(text.as_bytes()).expect("client sent a valid envelope"),
                    );
                }
                Ok(Message::Ping(data)) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drop the connection without a close handshake, as a crashed server
    /// would.
    pub fn abort(self) {
        drop(self.ws);
    }
}
