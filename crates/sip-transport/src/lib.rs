//! Transport contract for the sipua user-agent core
//!
//! The core never frames or routes bytes itself. It hands a serialized
//! message to a [`Transport`] and is told asynchronously whether the send
//! succeeded. Transports do not retry.
//!
//! Two implementations are provided:
//!
//! - [`ChannelTransport`]: in-memory loopback over tokio channels, used to
//!   wire two user agents together in tests
//! - [`UdpTransport`]: a UDP socket bound locally that sends to one peer

pub mod error;
pub mod transport;


pub use error::{Result, TransportError};
pub use transport::channel::ChannelTransport;
pub use transport::udp::UdpTransport;
pub use transport::{Transport, TransportEvent};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{ChannelTransport, Result, Transport, TransportError, TransportEvent, UdpTransport};
}
