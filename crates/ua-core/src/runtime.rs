//! Tokio driver for [`UserAgentCore`]
//!
//! [`UserAgent::spawn`] moves a core into a task that owns it and feeds it
//! everything it waits on: messages from the transport, timer firings from
//! a [`TokioScheduler`] and commands from [`UserAgentHandle`]s. Outgoing
//! messages are handed to the transport in order; a failed send is reported
//! back to the transaction that produced it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sipua_core::{RequestOptions, UserAgent, UserAgentCoreConfig};
//! use sipua_transport::ChannelTransport;
//!
//! # async fn example() -> sipua_core::Result<()> {
//! let (transport, inbound) = ChannelTransport::new("alice", false);
//! let config = UserAgentCoreConfig::new("sip:alice@atlanta.com", "sip:alice@192.0.2.10");
//! let (handle, mut events, _task) = UserAgent::spawn(config, Arc::new(transport), inbound)?;
//!
//! let uac = handle
//!     .with_core(|core| core.invite("sip:bob@biloxi.com", RequestOptions::new()))
//!     .await??;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # let _ = uac;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use sipua_transport::{Transport, TransportEvent};

use crate::config::UserAgentCoreConfig;
use crate::core::{UserAgentCore, UserAgentEvent};
use crate::error::{Error, Result};
use crate::services::Outgoing;
use crate::timer::{TimerFired, TokioScheduler};
use crate::tokens::RandomTokens;

type CoreFn = Box<dyn FnOnce(&mut UserAgentCore) + Send>;

enum Command {
    WithCore(CoreFn),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable access to a running [`UserAgent`]
#[derive(Clone)]
pub struct UserAgentHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl UserAgentHandle {
    /// Runs `f` on the core inside the driver task and returns its result.
    ///
    /// Every core operation is reachable this way, for example
    /// `handle.with_core(|core| core.bye(&dialog, RequestOptions::new()))`.
    pub async fn with_core<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut UserAgentCore) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::WithCore(Box::new(move |core| {
            let _ = tx.send(f(core));
        })))?;
        Ok(rx.await?)
    }

    /// Disposes the core and stops the driver task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Shutdown(tx))?;
        Ok(rx.await?)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// A [`UserAgentCore`] driven by tokio
pub struct UserAgent {
    core: UserAgentCore,
    transport: Arc<dyn Transport>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    outbound: mpsc::UnboundedReceiver<Outgoing>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl UserAgent {
    /// Spawns the driver on the current runtime.
    ///
    /// `inbound` is the receive side of `transport`. The reliable flag of
    /// the configuration is taken from the transport.
    pub fn spawn(
        config: UserAgentCoreConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<(UserAgentHandle, mpsc::UnboundedReceiver<UserAgentEvent>, JoinHandle<()>)> {
        let (scheduler, timers) = TokioScheduler::new()?;
        let config = config.with_reliable_transport(transport.is_reliable());
        let (core, events, outbound) = UserAgentCore::new(config, Arc::new(scheduler), Arc::new(RandomTokens));
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let agent = UserAgent {
            core,
            transport,
            inbound,
            timers,
            outbound,
            commands,
        };
        let span = info_span!("user_agent", aor = %agent.core.config().aor);
        let task = tokio::spawn(agent.run().instrument(span));
        Ok((UserAgentHandle { commands: commands_tx }, events, task))
    }

    async fn run(mut self) {
        info!(aor = %self.core.config().aor, "User agent started");
        loop {
            tokio::select! {
                // Drain what the core queued before taking new input
                biased;

                Some(outgoing) = self.outbound.recv() => self.send(outgoing).await,

                Some(fired) = self.timers.recv() => self.core.on_timer(fired),

                event = self.inbound.recv() => match event {
                    Some(TransportEvent::MessageReceived { data, source }) => {
                        trace!(source = ?source, bytes = data.len(), "Message received");
                        self.core.receive(&data);
                    }
                    Some(TransportEvent::Error { error }) => warn!(error = %error, "Transport receive error"),
                    Some(TransportEvent::Closed) | None => {
                        info!("Transport closed, stopping user agent");
                        break;
                    }
                },

                command = self.commands.recv() => match command {
                    Some(Command::WithCore(f)) => f(&mut self.core),
                    Some(Command::Shutdown(done)) => {
                        self.stop().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        debug!("All handles dropped, stopping user agent");
                        break;
                    }
                },
            }
        }
        self.stop().await;
    }

    async fn send(&mut self, outgoing: Outgoing) {
        let Outgoing { message, key } = outgoing;
        if let Err(e) = self.transport.send(message.to_bytes()).await {
            match key {
                Some(key) => self.core.on_transport_error(&key, &e.to_string()),
                None => warn!(error = %e, "Send failed"),
            }
        }
    }

    async fn stop(&mut self) {
        self.core.dispose();
        // Flush what dispose and the last operations queued
        while let Ok(outgoing) = self.outbound.try_recv() {
            if let Err(e) = self.transport.send(outgoing.message.to_bytes()).await {
                debug!(error = %e, "Dropping message after shutdown");
                break;
            }
        }
        if let Err(e) = self.transport.close().await {
            error!(error = %Error::from(e), "Failed to close transport");
        }
        info!("User agent stopped");
    }
}
