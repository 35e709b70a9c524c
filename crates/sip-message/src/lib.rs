//! SIP message model for the sipua user-agent core
//!
//! This crate provides the data types the transaction and dialog layers work
//! with, together with the RFC 3261 wire framing:
//!
//! - [`Request`], [`Response`] and [`Message`]: parsed SIP messages
//! - [`Headers`]: ordered, case-insensitive, multi-valued header map
//! - [`Body`]: opaque payload with content type and disposition
//! - [`Method`]: SIP request methods
//! - [`parse_message`]: start line, headers (folded and compact forms) and a
//!   `Content-Length` framed body
//!
//! Header values are kept as text. Only the fields the core needs for
//! matching and sequencing (tags, branch, CSeq, URIs and parameters) are
//! extracted, see [`headers`].
//!
//! ## Example
//!
//! ```rust
//! use sipua_message::{parse_message, Message, Method};
//!
//! let raw = b"OPTIONS sip:bob@example.com SIP/2.0\r\n\
//!     Via: SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds\r\n\
//!     From: <sip:alice@example.com>;tag=1928301774\r\n\
//!     To: <sip:bob@example.com>\r\n\
//!     Call-ID: a84b4c76e66710\r\n\
//!     CSeq: 63104 OPTIONS\r\n\
//!     Content-Length: 0\r\n\r\n";
//!
//! let message = parse_message(raw).unwrap();
//! let Message::Request(request) = message else { panic!("expected request") };
//! assert_eq!(request.method, Method::Options);
//! assert_eq!(request.via_branch(), Some("z9hG4bK776asdhds".to_string()));
//! ```

pub mod error;
pub mod headers;
pub mod message;
pub mod method;
pub mod parser;
pub mod status;

pub use error::{Error, Result};
pub use headers::{CSeq, Headers, NameAddr, header_names, header_param, split_list, uri_host, uri_param, uri_scheme, uri_user};
pub use message::{Body, Message, Request, Response};
pub use method::Method;
pub use parser::parse_message;
pub use status::reason_phrase;
