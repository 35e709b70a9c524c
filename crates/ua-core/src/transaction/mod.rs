//! RFC 3261 §17 transactions
//!
//! # Overview
//!
//! A transaction is one request and every response to it. Four state
//! machines cover the combinations of side and method:
//!
//! ```text
//!  InviteClientTransaction      Calling → Proceeding → {Accepted, Completed} → Terminated
//!  NonInviteClientTransaction   Trying → Proceeding → Completed → Terminated
//!  InviteServerTransaction      Proceeding → {Accepted, Completed → Confirmed} → Terminated
//!  NonInviteServerTransaction   Trying → Proceeding → Completed → Terminated
//! ```
//!
//! The Accepted state comes from RFC 6026: a 2xx to an INVITE does not end
//! the transaction, it keeps absorbing (server) or forwarding (client) 2xx
//! retransmissions until Timer L / Timer M fire.
//!
//! Transactions are plain state machines. Every input returns the
//! [`TransactionEvent`]s it produced and the [`UserAgentCore`](crate::UserAgentCore)
//! routes those to the owning user agent. Sending and timers go through
//! [`Services`].
//!
//! # Keys
//!
//! A transaction is identified by its top Via branch, its method and its
//! side ([`TransactionKey`]). ACK folds into INVITE so the ACK for a non-2xx
//! final reaches the INVITE server transaction; CANCEL shares the INVITE's
//! branch but is its own transaction.

pub mod client;
pub mod server;

pub use client::{InviteClientTransaction, NonInviteClientTransaction};
pub use server::{InviteServerTransaction, NonInviteServerTransaction};

use std::fmt;
use std::time::Duration;

use tracing::{debug, error};

use sipua_message::{Method, Request, Response};

use crate::error::{Error, Result};
use crate::services::Services;
use crate::timer::{TimerHandle, TimerKind, TimerOwner, TimerSlots};

/// Identifies a transaction: top Via branch, method and side
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    /// Creates a key, folding ACK into INVITE.
    pub fn new(branch: impl Into<String>, method: Method, is_server: bool) -> Self {
        let method = if method == Method::Ack { Method::Invite } else { method };
        Self {
            branch: branch.into(),
            method,
            is_server,
        }
    }

    pub fn from_request(request: &Request, is_server: bool) -> Option<Self> {
        let branch = request.via_branch()?;
        Some(Self::new(branch, request.method.clone(), is_server))
    }

    /// Client-side key a response belongs to (top Via branch + CSeq method).
    pub fn from_response(response: &Response) -> Option<Self> {
        let branch = response.via_branch()?;
        let cseq = response.cseq()?;
        Some(Self::new(branch, cseq.method, false))
    }

    /// Server-side key of the transaction a CANCEL refers to.
    pub fn cancelled_by(cancel: &Request) -> Option<Self> {
        let branch = cancel.via_branch()?;
        Some(Self::new(branch, Method::Invite, true))
    }

    pub fn is_invite(&self) -> bool {
        self.method == Method::Invite
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.is_server { "server" } else { "client" };
        write!(f, "Key({}:{}:{})", self.branch, self.method, side)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::InviteClient => "InviteClientTransaction",
            TransactionKind::NonInviteClient => "NonInviteClientTransaction",
            TransactionKind::InviteServer => "InviteServerTransaction",
            TransactionKind::NonInviteServer => "NonInviteServerTransaction",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// INVITE client: request sent, nothing received
    Calling,
    /// Non-INVITE: request sent/received, no provisional yet
    Trying,
    Proceeding,
    /// 2xx to an INVITE sent or received (RFC 6026)
    Accepted,
    Completed,
    /// INVITE server: ACK received for a non-2xx final
    Confirmed,
    Terminated,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Checks a transition against the edges of the kind's state machine.
pub fn validate_transition(kind: TransactionKind, from: TransactionState, to: TransactionState) -> Result<()> {
    use TransactionState::*;

    let allowed = match kind {
        TransactionKind::InviteClient => matches!(
            (from, to),
            (Calling, Proceeding)
                | (Calling, Accepted)
                | (Calling, Completed)
                | (Calling, Terminated)
                | (Proceeding, Accepted)
                | (Proceeding, Completed)
                | (Proceeding, Terminated)
                | (Accepted, Terminated)
                | (Completed, Terminated)
        ),
        TransactionKind::NonInviteClient => matches!(
            (from, to),
            (Trying, Proceeding)
                | (Trying, Completed)
                | (Trying, Terminated)
                | (Proceeding, Completed)
                | (Proceeding, Terminated)
                | (Completed, Terminated)
        ),
        TransactionKind::InviteServer => matches!(
            (from, to),
            (Proceeding, Accepted)
                | (Proceeding, Completed)
                | (Accepted, Terminated)
                | (Completed, Confirmed)
                | (Completed, Terminated)
                | (Confirmed, Terminated)
        ),
        TransactionKind::NonInviteServer => matches!(
            (from, to),
            (Trying, Proceeding)
                | (Trying, Completed)
                | (Proceeding, Completed)
                | (Completed, Terminated)
        ),
    };

    if allowed {
        Ok(())
    } else {
        Err(Error::InvalidStateTransition {
            entity: kind.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// What a transaction reports to its user
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    StateChanged(TransactionState),
    /// A response to forward to the client transaction's user
    Response(Response),
    /// Timer B or F elapsed, or a 408 arrived on a non-INVITE transaction
    Timeout,
    /// The transport failed to send one of this transaction's messages
    TransportError(String),
    /// Timer H elapsed without an ACK
    Failure(String),
}

/// State shared by the four transaction kinds
#[derive(Debug)]
pub(crate) struct TransactionBase {
    pub key: TransactionKey,
    pub kind: TransactionKind,
    pub state: TransactionState,
    pub request: Request,
    pub timers: TimerSlots,
}

impl TransactionBase {
    pub fn new(kind: TransactionKind, key: TransactionKey, request: Request, state: TransactionState) -> Self {
        Self {
            timers: TimerSlots::new(TimerOwner::Transaction(key.clone())),
            key,
            kind,
            state,
            request,
        }
    }

    /// Moves to `to` along a valid edge. Entering Terminated cancels every timer.
    pub fn transition(
        &mut self,
        to: TransactionState,
        services: &Services,
        events: &mut Vec<TransactionEvent>,
    ) -> Result<()> {
        if let Err(e) = validate_transition(self.kind, self.state, to) {
            error!(id = %self.key, error = %e, "Rejected transaction state transition");
            return Err(e);
        }
        debug!(id = %self.key, from = %self.state, to = %to, "Transaction state changed");
        self.state = to;
        if to == TransactionState::Terminated {
            self.timers.cancel_all(services.scheduler.as_ref());
        }
        events.push(TransactionEvent::StateChanged(to));
        Ok(())
    }

    /// Terminates from any state, skipping edge validation.
    pub fn force_terminate(&mut self, services: &Services, events: &mut Vec<TransactionEvent>) {
        if self.state == TransactionState::Terminated {
            return;
        }
        debug!(id = %self.key, from = %self.state, "Transaction forced to Terminated");
        self.state = TransactionState::Terminated;
        self.timers.cancel_all(services.scheduler.as_ref());
        events.push(TransactionEvent::StateChanged(TransactionState::Terminated));
    }

    /// Arms a wait timer, or terminates right away when its duration is zero
    /// (reliable transports).
    pub fn arm_or_terminate(
        &mut self,
        kind: TimerKind,
        after: Duration,
        services: &Services,
        events: &mut Vec<TransactionEvent>,
    ) -> Result<()> {
        if after.is_zero() {
            self.transition(TransactionState::Terminated, services, events)
        } else {
            self.timers.arm(services.scheduler.as_ref(), kind, after);
            Ok(())
        }
    }

    pub fn arm(&mut self, kind: TimerKind, after: Duration, services: &Services) {
        self.timers.arm(services.scheduler.as_ref(), kind, after);
    }

    pub fn cancel(&mut self, kind: TimerKind, services: &Services) {
        self.timers.cancel(services.scheduler.as_ref(), kind);
    }

    pub fn take_timer(&mut self, kind: TimerKind, handle: TimerHandle) -> bool {
        self.timers.take(kind, handle)
    }

    pub fn transport_error(&mut self, error: &str, services: &Services) -> Vec<TransactionEvent> {
        if self.state == TransactionState::Terminated {
            return Vec::new();
        }
        let mut events = vec![TransactionEvent::TransportError(error.to_string())];
        self.force_terminate(services, &mut events);
        events
    }

    pub fn send(&self, message: impl Into<sipua_message::Message>, services: &Services) {
        services.send(message, Some(&self.key));
    }
}

/// Any of the four transaction kinds
#[derive(Debug)]
pub enum Transaction {
    InviteClient(InviteClientTransaction),
    NonInviteClient(NonInviteClientTransaction),
    InviteServer(InviteServerTransaction),
    NonInviteServer(NonInviteServerTransaction),
}

impl Transaction {
    fn base(&self) -> &TransactionBase {
        match self {
            Transaction::InviteClient(t) => &t.base,
            Transaction::NonInviteClient(t) => &t.base,
            Transaction::InviteServer(t) => &t.base,
            Transaction::NonInviteServer(t) => &t.base,
        }
    }

    fn base_mut(&mut self) -> &mut TransactionBase {
        match self {
            Transaction::InviteClient(t) => &mut t.base,
            Transaction::NonInviteClient(t) => &mut t.base,
            Transaction::InviteServer(t) => &mut t.base,
            Transaction::NonInviteServer(t) => &mut t.base,
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.base().key
    }

    pub fn kind(&self) -> TransactionKind {
        self.base().kind
    }

    pub fn state(&self) -> TransactionState {
        self.base().state
    }

    pub fn request(&self) -> &Request {
        &self.base().request
    }

    pub fn on_timer(&mut self, kind: TimerKind, handle: TimerHandle, services: &Services) -> Result<Vec<TransactionEvent>> {
        match self {
            Transaction::InviteClient(t) => t.on_timer(kind, handle, services),
            Transaction::NonInviteClient(t) => t.on_timer(kind, handle, services),
            Transaction::InviteServer(t) => t.on_timer(kind, handle, services),
            Transaction::NonInviteServer(t) => t.on_timer(kind, handle, services),
        }
    }

    /// Reports a failed send; the transaction terminates from any state.
    pub fn on_transport_error(&mut self, error: &str, services: &Services) -> Vec<TransactionEvent> {
        self.base_mut().transport_error(error, services)
    }

    /// Cancels every timer without emitting events.
    pub fn dispose(&mut self, services: &Services) {
        let base = self.base_mut();
        base.timers.cancel_all(services.scheduler.as_ref());
        base.state = TransactionState::Terminated;
    }
}
