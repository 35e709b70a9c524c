//! UDP transport bound to one local address and talking to one peer

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::transport::{Transport, TransportEvent};

// Largest datagram we accept
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Unreliable transport sending every message to a single remote address
///
/// Received datagrams are forwarded, unparsed, to the receiver returned by
/// [`UdpTransport::bind`], the same shape [`ChannelTransport`] uses, so
/// either can feed a user agent.
///
/// [`ChannelTransport`]: crate::ChannelTransport
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    socket: UdpSocket,
    remote: SocketAddr,
    closed: AtomicBool,
    shutdown: Notify,
}

impl UdpTransport {
    /// Binds `local` and starts receiving. Sends go to `remote`.
    pub async fn bind(local: SocketAddr, remote: SocketAddr) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let socket = UdpSocket::bind(local).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = UdpTransport {
            inner: Arc::new(UdpInner {
                socket,
                remote,
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        };
        info!(local = %transport.local_addr()?, remote = %remote, "UDP transport bound");
        tokio::spawn(transport.clone().receive_loop(events_tx));
        Ok((transport, events_rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    async fn receive_loop(self, events: mpsc::UnboundedSender<TransportEvent>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                _ = self.inner.shutdown.notified() => break,
                received = self.inner.socket.recv_from(&mut buf) => received,
            };
            let event = match received {
                Ok((len, source)) => {
                    trace!(source = %source, bytes = len, "Datagram received");
                    TransportEvent::MessageReceived {
                        data: Bytes::copy_from_slice(&buf[..len]),
                        source: Some(source),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    TransportEvent::Error { error: e.to_string() }
                }
            };
            if events.send(event).is_err() {
                debug!("Event receiver dropped, stopping UDP receive loop");
                return;
            }
        }
        let _ = events.send(TransportEvent::Closed);
        debug!("UDP receive loop stopped");
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        trace!(remote = %self.inner.remote, bytes = data.len(), "Sending datagram");
        let sent = self.inner.socket.send_to(&data, self.inner.remote).await?;
        if sent != data.len() {
            return Err(TransportError::SendFailed(format!(
                "short datagram: {} of {} bytes",
                sent,
                data.len()
            )));
        }
        Ok(())
    }

    fn is_reliable(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::Relaxed) {
            // notify_one stores a permit if the loop is not waiting yet
            self.inner.shutdown.notify_one();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.socket.local_addr() {
            Ok(addr) => write!(f, "UdpTransport({} -> {})", addr, self.inner.remote),
            Err(_) => write!(f, "UdpTransport(-> {})", self.inner.remote),
        }
    }
}
