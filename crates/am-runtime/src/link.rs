//! Transport boundary.
//!
//! The runtime treats the transport as an ordered, message-framed,
//! full-duplex channel with explicit connect/disconnect.  It never reads
//! partial frames and never assumes re-delivery across reconnect.  The
//! reference implementation rides JSON envelopes in WebSocket text frames.

use crate::error::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// One whole-message frame channel.
///
/// `recv` returning `None` means the session closed; errors are fatal to
/// the session.  `send` completing only once the frame is accepted by the
/// substrate is the engine's back-pressure signal.
#[async_trait]
pub trait FrameLink: Send {
    async fn send(&mut self, frame: Vec<u8>) -> RuntimeResult<()>;
    async fn recv(&mut self) -> Option<RuntimeResult<Vec<u8>>>;
    async fn shutdown(&mut self);
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

/// [`FrameLink`] over any WebSocket stream (server- or client-side).
pub struct WsLink<S> {
    ws: WebSocketStream<S>,
}

impl<S> WsLink<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        WsLink { ws }
    }
}

#[async_trait]
impl<S> FrameLink for WsLink<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Vec<u8>) -> RuntimeResult<()> {
        let text = String::from_utf8(frame)
            .map_err(|e| RuntimeError::SerializationFailed(e.to_string()))?;
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(ws_session_error)
    }

    async fn recv(&mut self) -> Option<RuntimeResult<Vec<u8>>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_bytes().to_vec())),
                Ok(Message::Binary(bytes)) => return Some(Ok(bytes.to_vec())),
                Ok(Message::Ping(data)) => {
                    // Answer pings inline; other control frames are
                    // handled by tungstenite itself.
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(ws_session_error(e))),
            }
        }
    }

    async fn shutdown(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Mid-session transport failures all collapse to `connection-closed`; the
/// session is over either way, and the cause is only interesting in logs.
fn ws_session_error(e: WsError) -> RuntimeError {
    tracing::debug!(error = %e, "websocket session error");
    RuntimeError::ConnectionClosed
}

/// Dial a server endpoint.
pub async fn ws_connect(
    host: &str,
    port: u16,
) -> RuntimeResult<WsLink<MaybeTlsStream<TcpStream>>> {
    let url = format!("ws://{host}:{port}/");
    let (ws, _response) =
        tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| RuntimeError::ConnectionFailed {
                host: host.to_owned(),
                port,
                cause: e.to_string(),
            })?;
    Ok(WsLink::new(ws))
}

/// Upgrade an accepted TCP socket into a frame link (server side).
pub async fn ws_accept(socket: TcpStream) -> RuntimeResult<WsLink<TcpStream>> {
    let ws = tokio_tungstenite::accept_async(socket)
        .await
        .map_err(|e| RuntimeError::ConnectionFailed {
            host: String::new(),
            port: 0,
            cause: e.to_string(),
        })?;
    Ok(WsLink::new(ws))
}
