//! Pluggable byte-oriented, message-framed transport.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::SyncError;

/// A bidirectional, message-framed channel to one peer. Implementations:
/// in-memory (tests), framed TCP on the LAN, BLE/WebRTC later.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame.
    async fn send(&self, frame: Vec<u8>) -> Result<(), SyncError>;

    /// Receive the next frame.
    async fn recv(&self) -> Result<Vec<u8>, SyncError>;
}

/// In-memory transport; [`MemoryTransport::pair`] returns the two ends.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryTransport {
    /// Create a connected pair of transports.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                tx: a_tx,
                rx: Mutex::new(a_rx),
            },
            MemoryTransport {
                tx: b_tx,
                rx: Mutex::new(b_rx),
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), SyncError> {
        self.tx
            .send(frame)
            .map_err(|_| SyncError::Transport("peer hung up".into()))
    }

    async fn recv(&self) -> Result<Vec<u8>, SyncError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SyncError::Transport("peer hung up".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_the_pair_in_order() {
        let (a, b) = MemoryTransport::pair();
        a.send(b"one".to_vec()).await.unwrap();
        a.send(b"two".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"one");
        assert_eq!(b.recv().await.unwrap(), b"two");

        b.send(b"back".to_vec()).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), b"back");
    }

    #[tokio::test]
    async fn dropped_peer_surfaces_as_transport_error() {
        let (a, b) = MemoryTransport::pair();
        drop(b);
        assert!(a.send(b"x".to_vec()).await.is_err());
    }
}
