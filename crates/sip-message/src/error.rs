use thiserror::Error;

/// A type alias for handling `Result`s with [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing or building SIP messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The start line or overall framing could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A header value failed its structural check.
    #[error("Invalid header {name}: {value}")]
    InvalidHeader {
        /// Canonical header name
        name: String,
        /// Raw value that was rejected
        value: String,
    },

    /// The message head was not valid UTF-8.
    #[error("Message head is not valid UTF-8")]
    Utf8,

    /// A required header is missing.
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),
}
