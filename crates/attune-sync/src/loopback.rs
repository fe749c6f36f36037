//! In-process loopback transport.
//!
//! Wires two endpoints back to back so the whole engine can be exercised
//! without a real transport. Used by the integration tests and handy for
//! host development.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use attune_core::SyncError;

use crate::transport::DataChannel;

/// One end of a loopback pair. Implements [`DataChannel`]; everything the
/// peer sends arrives on [`LoopbackEndpoint::incoming`].
pub struct LoopbackEndpoint {
    tx: mpsc::UnboundedSender<(u32, Bytes)>,
    open: Arc<AtomicBool>,
    peer_open: Arc<AtomicBool>,
    channels: u32,
}

/// Receiving half: `(channel_index, bytes)` in send order.
pub type LoopbackIncoming = mpsc::UnboundedReceiver<(u32, Bytes)>;

/// Build a connected pair with `channels` sub-channels each.
pub fn pair(channels: u32) -> ((Arc<LoopbackEndpoint>, LoopbackIncoming), (Arc<LoopbackEndpoint>, LoopbackIncoming)) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a_open = Arc::new(AtomicBool::new(true));
    let b_open = Arc::new(AtomicBool::new(true));

    let a = Arc::new(LoopbackEndpoint {
        tx: a_tx,
        open: a_open.clone(),
        peer_open: b_open.clone(),
        channels,
    });
    let b = Arc::new(LoopbackEndpoint {
        tx: b_tx,
        open: b_open,
        peer_open: a_open,
        channels,
    });
    ((a, a_rx), (b, b_rx))
}

impl LoopbackEndpoint {
    /// Simulate transport loss for this endpoint.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn reopen(&self) {
        self.open.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataChannel for LoopbackEndpoint {
    async fn send(&self, bytes: Bytes, channel: u32) -> Result<(), SyncError> {
        if channel >= self.channels {
            return Err(SyncError::Protocol(format!(
                "channel {channel} out of range (have {})",
                self.channels
            )));
        }
        if !self.is_open(channel) {
            return Err(SyncError::TransportClosed);
        }
        self.tx
            .send((channel, bytes))
            .map_err(|_| SyncError::TransportClosed)
    }

    fn is_open(&self, _channel: u32) -> bool {
        self.open.load(Ordering::SeqCst) && self.peer_open.load(Ordering::SeqCst)
    }

    fn channel_count(&self) -> u32 {
        self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_arrive_in_order_with_channel_index() {
        let ((a, _a_rx), (_b, mut b_rx)) = pair(2);
        a.send(Bytes::from_static(b"one"), 0).await.unwrap();
        a.send(Bytes::from_static(b"two"), 1).await.unwrap();

        assert_eq!(b_rx.recv().await.unwrap(), (0, Bytes::from_static(b"one")));
        assert_eq!(b_rx.recv().await.unwrap(), (1, Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn closed_endpoint_rejects_sends() {
        let ((a, _a_rx), (b, _b_rx)) = pair(1);
        b.close();
        assert!(!a.is_open(0));
        assert!(matches!(
            a.send(Bytes::from_static(b"x"), 0).await,
            Err(SyncError::TransportClosed)
        ));

        b.reopen();
        assert!(a.send(Bytes::from_static(b"x"), 0).await.is_ok());
    }

    #[tokio::test]
    async fn out_of_range_channel_rejected() {
        let ((a, _a_rx), _) = pair(1);
        assert!(matches!(
            a.send(Bytes::from_static(b"x"), 5).await,
            Err(SyncError::Protocol(_))
        ));
    }
}
