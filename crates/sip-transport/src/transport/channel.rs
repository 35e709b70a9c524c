//! In-memory loopback transport

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::transport::{Transport, TransportEvent};

/// Transport that delivers every sent message to the receiving half of a
/// tokio channel
///
/// [`ChannelTransport::pair`] creates two connected ends, which is enough to
/// run a UAC and a UAS against each other in-process.
#[derive(Clone)]
pub struct ChannelTransport {
    inner: Arc<ChannelTransportInner>,
}

struct ChannelTransportInner {
    name: String,
    peer_tx: mpsc::UnboundedSender<TransportEvent>,
    reliable: bool,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Creates a transport whose sends arrive on the returned receiver.
    pub fn new(name: impl Into<String>, reliable: bool) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport {
            inner: Arc::new(ChannelTransportInner {
                name: name.into(),
                peer_tx,
                reliable,
                closed: AtomicBool::new(false),
            }),
        };
        (transport, peer_rx)
    }

    /// Creates two connected ends. Each end's receiver yields what the other
    /// end sends.
    pub fn pair(
        reliable: bool,
    ) -> (
        (Self, mpsc::UnboundedReceiver<TransportEvent>),
        (Self, mpsc::UnboundedReceiver<TransportEvent>),
    ) {
        let (a, to_b) = Self::new("a", reliable);
        let (b, to_a) = Self::new("b", reliable);
        ((a, to_a), (b, to_b))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        trace!(transport = %self.inner.name, bytes = data.len(), "Sending message over channel");
        self.inner
            .peer_tx
            .send(TransportEvent::MessageReceived { data, source: None })
            .map_err(|_| TransportError::SendFailed("peer receiver dropped".to_string()))
    }

    fn is_reliable(&self) -> bool {
        self.inner.reliable
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::Relaxed) {
            debug!(transport = %self.inner.name, "Channel transport closed");
            let _ = self.inner.peer_tx.send(TransportEvent::Closed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelTransport({})", self.inner.name)
    }
}
