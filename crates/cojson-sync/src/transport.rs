//! Transport abstraction for the sync protocol.
//!
//! A transport carries frames (see [`crate::codec`]) over any
//! bidirectional byte stream. Implementations may use WebSockets, an
//! in-process channel, or anything else.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A bidirectional frame pipe to one peer.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Receive the next frame. `Ok(None)` means the other side hung up.
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Stop sending. The other side's `recv` returns `None` once drained.
    async fn close(&self);
}

/// Opens new transports, for reconnecting.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&self, frame: Bytes) -> Result<()> {
        (**self).send(frame).await
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        (**self).recv().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// In-process transports built on channels.
pub mod memory {
    use super::*;
    use crate::error::SyncError;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, RwLock};

    const CHANNEL_CAPACITY: usize = 1000;

    /// One end of an in-memory connection.
    pub struct MemoryTransport {
        sender: Mutex<Option<mpsc::Sender<Bytes>>>,
        receiver: RwLock<mpsc::Receiver<Bytes>>,
    }

    /// Two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            MemoryTransport {
                sender: Mutex::new(Some(a_tx)),
                receiver: RwLock::new(b_rx),
            },
            MemoryTransport {
                sender: Mutex::new(Some(b_tx)),
                receiver: RwLock::new(a_rx),
            },
        )
    }

    impl MemoryTransport {
        fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
            self.sender
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, frame: Bytes) -> Result<()> {
            let sender = self
                .sender()
                .ok_or_else(|| SyncError::PeerDisconnected("transport closed".into()))?;
            sender
                .send(frame)
                .await
                .map_err(|_| SyncError::PeerDisconnected("other side hung up".into()))
        }

        async fn recv(&self) -> Result<Option<Bytes>> {
            let mut rx = self.receiver.write().await;
            Ok(rx.recv().await)
        }

        async fn close(&self) {
            self.sender
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
        }
    }

    /// Connector whose every `connect` hands the far end to a
    /// [`MemoryListener`].
    pub struct MemoryConnector {
        accept: mpsc::UnboundedSender<MemoryTransport>,
    }

    /// Receives the far ends of connections made through a
    /// [`MemoryConnector`].
    pub struct MemoryListener {
        incoming: mpsc::UnboundedReceiver<MemoryTransport>,
    }

    pub fn listener() -> (MemoryConnector, MemoryListener) {
        let (accept, incoming) = mpsc::unbounded_channel();
        (MemoryConnector { accept }, MemoryListener { incoming })
    }

    impl MemoryListener {
        /// Wait for the next connection.
        pub async fn accept(&mut self) -> Option<MemoryTransport> {
            self.incoming.recv().await
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            let (near, far) = pair();
            self.accept
                .send(far)
                .map_err(|_| SyncError::Transport("listener gone".into()))?;
            Ok(Box::new(near))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{listener, pair};
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_send_recv() {
        let (a, b) = pair();
        a.send(Bytes::from_static(b"hello")).await.unwrap();
        b.send(Bytes::from_static(b"back")).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(Bytes::from_static(b"hello")));
        assert_eq!(a.recv().await.unwrap(), Some(Bytes::from_static(b"back")));
    }

    #[tokio::test]
    async fn test_close_ends_the_other_side() {
        let (a, b) = pair();
        a.send(Bytes::from_static(b"last")).await.unwrap();
        a.close().await;

        // Frames sent before the close are still delivered.
        assert_eq!(b.recv().await.unwrap(), Some(Bytes::from_static(b"last")));
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(a.send(Bytes::from_static(b"late")).await.is_err());
    }

    #[tokio::test]
    async fn test_connector_hands_far_end_to_listener() {
        let (connector, mut listener) = listener();
        let near = connector.connect().await.unwrap();
        let far = listener.accept().await.unwrap();

        near.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(far.recv().await.unwrap(), Some(Bytes::from_static(b"ping")));
    }
}
