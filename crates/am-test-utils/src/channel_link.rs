//! In-memory frame transport.
//!
//! A pair of linked endpoints satisfying the runtime's transport boundary
//! without sockets.  Frames preserve boundaries and order; closing either
//! end terminates the peer's inbound sequence.

use am_runtime::{FrameLink, RuntimeError, RuntimeResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;

pub struct ChannelLink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Two connected endpoints; frames sent on one arrive on the other.
pub fn link_pair() -> (ChannelLink, ChannelLink) {
    let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        ChannelLink {
            tx: Some(a_tx),
            rx: b_rx,
        },
        ChannelLink {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl FrameLink for ChannelLink {
    async fn send(&mut self, frame: Vec<u8>) -> RuntimeResult<()> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| RuntimeError::ConnectionClosed),
            None => Err(RuntimeError::ConnectionClosed),
        }
    }

    async fn recv(&mut self) -> Option<RuntimeResult<Vec<u8>>> {
        self.rx.recv().await.map(Ok)
    }

    async fn shutdown(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
