pub mod channel;
pub mod udp;

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Events emitted by a transport's receive side
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A datagram or framed message arrived
    MessageReceived {
        data: Bytes,
        source: Option<SocketAddr>,
    },

    /// Receiving failed; the transport may still be usable
    Error { error: String },

    /// The transport was closed
    Closed,
}

/// Sends serialized SIP messages to the peer
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends one serialized message. No retry is attempted.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Reliable transports (stream based) zero out the completion timers
    /// D, I, J and K.
    fn is_reliable(&self) -> bool;

    /// Stops the transport; later sends fail with `Closed`.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}
