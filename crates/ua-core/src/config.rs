//! Configuration for [`UserAgentCore`](crate::UserAgentCore)
//!
//! ## Overview
//!
//! One [`UserAgentCoreConfig`] describes the local endpoint: the address of
//! record and contact used to build requests, the Via sent-by, the outbound
//! route set, and which out-of-dialog methods the application wants to see.
//! Everything has a sensible default so only the identity usually needs to be
//! set.
//!
//! ## Example
//!
//! ```rust
//! use sipua_core::config::{AckTimeoutPolicy, UserAgentCoreConfig};
//! use sipua_message::Method;
//!
//! let config = UserAgentCoreConfig::new("sip:alice@atlanta.com", "sip:alice@192.0.2.10:5060")
//!     .with_via_host("192.0.2.10:5060")
//!     .with_delegated_method(Method::Invite)
//!     .with_ack_timeout_policy(AckTimeoutPolicy::Notify);
//!
//! assert!(config.is_delegated(&Method::Invite));
//! assert!(!config.is_delegated(&Method::Message));
//! ```
//!
//! The configuration is serde (de)serializable. Fields left out take their
//! defaults; the authentication factory cannot be serialized and is always
//! set in code.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use sipua_message::Method;

use crate::timer::TimerSettings;
use crate::user_agent::auth::Credentials;

/// Produces credentials when a request is challenged
pub type AuthenticationFactory = Arc<dyn Fn() -> Option<Box<dyn Credentials>> + Send + Sync>;

/// What to do when the ACK for a sent 2xx never arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AckTimeoutPolicy {
    /// Only report [`UserAgentEvent::AckTimeout`](crate::UserAgentEvent::AckTimeout)
    Notify,
    /// Report and end the dialog with a BYE
    #[default]
    SendBye,
}

/// Methods the core accepts; anything else is answered 405 with this list in Allow
pub const ALLOWED_METHODS: &[Method] = &[
    Method::Ack,
    Method::Bye,
    Method::Cancel,
    Method::Info,
    Method::Invite,
    Method::Message,
    Method::Notify,
    Method::Options,
    Method::Prack,
    Method::Refer,
    Method::Register,
    Method::Subscribe,
    Method::Update,
];

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAgentCoreConfig {
    /// Address of record, used in From and for Request-URI ownership checks
    pub aor: String,

    /// Contact URI placed in dialog-creating requests and responses
    pub contact: String,

    /// Display name for the From header
    pub display_name: Option<String>,

    /// Via sent-by (`host[:port]`)
    pub via_host: String,

    /// Via transport token (`UDP`, `TCP`, `TLS`, `WS`)
    pub via_transport: String,

    /// Whether the transport is reliable (zeroes Timers D, I, J and K)
    pub reliable_transport: bool,

    /// Pre-loaded route set for out-of-dialog requests
    pub route_set: Vec<String>,

    /// Option tags advertised in Supported
    pub supported_option_tags: Vec<String>,

    /// Content types advertised in Accept
    pub accepted_content_types: Vec<String>,

    /// Value of the User-Agent header, omitted when unset
    pub user_agent_header_field_value: Option<String>,

    /// Max-Forwards for outgoing requests
    pub max_forwards: u32,

    pub timers: TimerSettings,

    /// Out-of-dialog methods handed to the application; the rest get the
    /// core's default reply
    pub delegated_methods: Vec<Method>,

    pub ack_timeout_policy: AckTimeoutPolicy,

    /// Re-SUBSCRIBE automatically at 90 % of the expiration
    pub subscription_auto_refresh: bool,

    /// Called to obtain credentials when a request is challenged
    #[serde(skip)]
    pub authentication_factory: Option<AuthenticationFactory>,
}

impl Default for UserAgentCoreConfig {
    fn default() -> Self {
        Self {
            aor: "sip:anonymous@anonymous.invalid".to_string(),
            contact: "sip:anonymous@127.0.0.1:5060".to_string(),
            display_name: None,
            via_host: "127.0.0.1:5060".to_string(),
            via_transport: "UDP".to_string(),
            reliable_transport: false,
            route_set: Vec::new(),
            supported_option_tags: vec!["100rel".to_string()],
            accepted_content_types: vec!["application/sdp".to_string()],
            user_agent_header_field_value: Some(format!("sipua/{}", env!("CARGO_PKG_VERSION"))),
            max_forwards: 70,
            timers: TimerSettings::default(),
            delegated_methods: Vec::new(),
            ack_timeout_policy: AckTimeoutPolicy::default(),
            subscription_auto_refresh: true,
            authentication_factory: None,
        }
    }
}

impl UserAgentCoreConfig {
    pub fn new(aor: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            aor: aor.into(),
            contact: contact.into(),
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_via_host(mut self, via_host: impl Into<String>) -> Self {
        self.via_host = via_host.into();
        self
    }

    pub fn with_via_transport(mut self, transport: impl Into<String>) -> Self {
        self.via_transport = transport.into();
        self
    }

    pub fn with_reliable_transport(mut self, reliable: bool) -> Self {
        self.reliable_transport = reliable;
        self
    }

    pub fn with_route_set(mut self, route_set: Vec<String>) -> Self {
        self.route_set = route_set;
        self
    }

    pub fn with_supported_option_tag(mut self, tag: impl Into<String>) -> Self {
        self.supported_option_tags.push(tag.into());
        self
    }

    pub fn with_user_agent(mut self, value: impl Into<String>) -> Self {
        self.user_agent_header_field_value = Some(value.into());
        self
    }

    pub fn with_max_forwards(mut self, max_forwards: u32) -> Self {
        self.max_forwards = max_forwards;
        self
    }

    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_delegated_method(mut self, method: Method) -> Self {
        if !self.delegated_methods.contains(&method) {
            self.delegated_methods.push(method);
        }
        self
    }

    pub fn with_ack_timeout_policy(mut self, policy: AckTimeoutPolicy) -> Self {
        self.ack_timeout_policy = policy;
        self
    }

    pub fn with_subscription_auto_refresh(mut self, enabled: bool) -> Self {
        self.subscription_auto_refresh = enabled;
        self
    }

    pub fn with_authentication_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Option<Box<dyn Credentials>> + Send + Sync + 'static,
    {
        self.authentication_factory = Some(Arc::new(factory));
        self
    }

    pub fn is_delegated(&self, method: &Method) -> bool {
        self.delegated_methods.contains(method)
    }

    /// Allow header value listing [`ALLOWED_METHODS`].
    pub fn allow_header(&self) -> String {
        ALLOWED_METHODS
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Debug for UserAgentCoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAgentCoreConfig")
            .field("aor", &self.aor)
            .field("contact", &self.contact)
            .field("display_name", &self.display_name)
            .field("via_host", &self.via_host)
            .field("via_transport", &self.via_transport)
            .field("reliable_transport", &self.reliable_transport)
            .field("route_set", &self.route_set)
            .field("supported_option_tags", &self.supported_option_tags)
            .field("max_forwards", &self.max_forwards)
            .field("timers", &self.timers)
            .field("delegated_methods", &self.delegated_methods)
            .field("ack_timeout_policy", &self.ack_timeout_policy)
            .field("subscription_auto_refresh", &self.subscription_auto_refresh)
            .field("authentication_factory", &self.authentication_factory.is_some())
            .finish()
    }
}
