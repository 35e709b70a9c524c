//! SIP user-agent core for the sipua stack
//!
//! This crate implements the protocol machinery between a SIP transport and
//! an application:
//!
//! - [`transaction`]: the four RFC 3261 §17 transaction state machines, with
//!   the RFC 6026 Accepted state for INVITE 2xx
//! - [`dialog`]: dialogs and their session (offer/answer) and subscription
//!   (RFC 6665) usages
//! - [`user_agent`]: UAC/UAS request and response handling, digest
//!   authentication
//! - [`UserAgentCore`]: the registry and router tying them together
//!
//! The core is sans-IO. Outgoing messages are queued as [`Outgoing`], timers
//! go through a [`Scheduler`], and everything the application must know is
//! reported as a [`UserAgentEvent`]. [`UserAgent`] drives a core on tokio
//! with a [`sipua_transport::Transport`]; tests drive it by hand with a
//! [`ManualScheduler`] and [`SequentialTokens`].
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use sipua_core::{ManualScheduler, RequestOptions, SequentialTokens, UserAgentCore, UserAgentCoreConfig};
//!
//! let config = UserAgentCoreConfig::new("sip:alice@atlanta.com", "sip:alice@192.0.2.10");
//! let (mut core, _events, mut outbound) = UserAgentCore::new(
//!     config,
//!     Arc::new(ManualScheduler::new()),
//!     Arc::new(SequentialTokens::default()),
//! );
//!
//! core.request(sipua_message::Method::Options, "sip:bob@biloxi.com", RequestOptions::new())
//!     .unwrap();
//! let sent = outbound.try_recv().unwrap();
//! assert!(sent.key.is_some());
//! ```

pub mod config;
pub mod core;
pub mod dialog;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod services;
pub mod timer;
pub mod tokens;
pub mod transaction;
pub mod user_agent;

pub use crate::core::{UserAgentCore, UserAgentEvent};
pub use config::{AckTimeoutPolicy, AuthenticationFactory, UserAgentCoreConfig};
pub use dialog::{
    BodyDirection, Dialog, DialogId, DialogUsage, SessionDialog, SignalingState, SubscriberKey, SubscriptionDialog,
    SubscriptionRole, SubscriptionState,
};
pub use error::{Error, Result};
pub use runtime::{UserAgent, UserAgentHandle};
pub use services::Outgoing;
pub use timer::{ManualScheduler, Scheduler, TimerFired, TimerSettings, TokioScheduler};
pub use tokens::{RandomTokens, SequentialTokens, TokenGenerator};
pub use transaction::{TransactionKey, TransactionState};
pub use user_agent::auth::{Challenge, Credentials, DigestCredentials};
pub use user_agent::{RequestOptions, ResponseOptions, UacId, UasId};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        DialogId, Error, RequestOptions, ResponseOptions, Result, UacId, UasId, UserAgent, UserAgentCore,
        UserAgentCoreConfig, UserAgentEvent, UserAgentHandle,
    };
}
