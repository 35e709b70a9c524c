//! Shared handles passed to every state machine
//!
//! Transactions, dialogs and user agents do not own I/O. They send through
//! the outbound queue and arm timers through the scheduler held here; the
//! core owns the single `Services` value and lends it out per call.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use sipua_message::{Message, Request, Response, header_names as names};

use crate::config::UserAgentCoreConfig;
use crate::timer::{Scheduler, TimerSettings};
use crate::tokens::TokenGenerator;
use crate::transaction::TransactionKey;

/// A message waiting to be handed to the transport
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub message: Message,
    /// Transaction to blame if the send fails
    pub key: Option<TransactionKey>,
}

pub struct Services {
    pub config: Arc<UserAgentCoreConfig>,
    pub scheduler: Arc<dyn Scheduler>,
    pub tokens: Arc<dyn TokenGenerator>,
    outbound: mpsc::UnboundedSender<Outgoing>,
}

impl Services {
    pub fn new(
        config: Arc<UserAgentCoreConfig>,
        scheduler: Arc<dyn Scheduler>,
        tokens: Arc<dyn TokenGenerator>,
        outbound: mpsc::UnboundedSender<Outgoing>,
    ) -> Self {
        Self {
            config,
            scheduler,
            tokens,
            outbound,
        }
    }

    pub fn timers(&self) -> &TimerSettings {
        &self.config.timers
    }

    pub fn reliable(&self) -> bool {
        self.config.reliable_transport
    }

    /// Queues a message for the transport.
    pub fn send(&self, message: impl Into<Message>, key: Option<&TransactionKey>) {
        let message = message.into();
        if self
            .outbound
            .send(Outgoing {
                message,
                key: key.cloned(),
            })
            .is_err()
        {
            warn!("Outbound queue closed, message dropped");
        }
    }

    /// Answers `request` without creating a transaction.
    pub fn send_stateless(&self, request: &Request, status: u16, headers: &[(&str, String)]) {
        let mut response = Response::for_request(request, status, None);
        if response.to_tag().is_none() && status > 100 {
            response = response.with_to_tag(&self.tokens.token());
        }
        for (name, value) in headers {
            response.headers.add(name, value.clone());
        }
        debug!(
            status = status,
            method = %request.method,
            call_id = request.call_id().unwrap_or_default(),
            "Replying statelessly"
        );
        self.send(response, None);
    }

    /// Via header value for a new client transaction.
    pub fn via(&self, branch: &str) -> String {
        format!(
            "SIP/2.0/{} {};branch={}",
            self.config.via_transport, self.config.via_host, branch
        )
    }

    /// Adds User-Agent and Supported as configured.
    pub fn decorate_request(&self, request: &mut Request) {
        if let Some(user_agent) = &self.config.user_agent_header_field_value {
            if !request.headers.contains(names::USER_AGENT) {
                request.headers.add(names::USER_AGENT, user_agent.clone());
            }
        }
        if !self.config.supported_option_tags.is_empty() && !request.headers.contains(names::SUPPORTED) {
            request
                .headers
                .add(names::SUPPORTED, self.config.supported_option_tags.join(", "));
        }
    }
}
