use thiserror::Error;

/// A type alias for handling `Result`s with [`TransportError`]
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors reported by a transport send
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport has been closed
    #[error("Transport closed")]
    Closed,

    /// The message could not be delivered
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}
