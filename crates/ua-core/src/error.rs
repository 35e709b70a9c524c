//! Error types for the user-agent core
//!
//! Protocol-level failures (timeouts, transport errors, rejected requests)
//! are never returned from the core's API: they surface as
//! [`UserAgentEvent`](crate::UserAgentEvent)s. The errors here cover misuse of
//! the API and internal invariant violations.

use thiserror::Error;

use sipua_transport::TransportError;

use crate::dialog::DialogId;
use crate::transaction::TransactionKey;

/// A type alias for handling `Result`s with [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A state machine was asked to move along an edge it does not have.
    /// This is a programming error, never a protocol event.
    #[error("Invalid state transition for {entity}: {from} -> {to}")]
    InvalidStateTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// The operation is not valid in the entity's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A peer violated the protocol (e.g. CSeq went backwards)
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Dialog not found: {0}")]
    DialogNotFound(DialogId),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionKey),

    /// No UAC or UAS is registered under the given id
    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Message error: {0}")]
    Message(#[from] sipua_message::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal channel closed")]
    ChannelClosed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}
