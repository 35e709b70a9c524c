//! RFC 3261 §12 dialogs
//!
//! A [`Dialog`] is the peer-to-peer state shared by the requests of one
//! call or subscription: Call-ID, tags, CSeq numbers in both directions,
//! route set and remote target. Two usages build on it:
//!
//! - [`SessionDialog`]: INVITE dialogs, with the offer/answer signaling
//!   state, 2xx retransmission until the ACK and re-INVITE collision checks
//! - [`SubscriptionDialog`]: SUBSCRIBE/REFER dialogs (RFC 6665), with the
//!   subscription state and refresh scheduling
//!
//! Dialogs live in the [`UserAgentCore`](crate::UserAgentCore) registry,
//! keyed by [`DialogId`].

pub mod session;
pub mod subscription;

pub use session::{BodyDirection, SessionDialog, SignalingState};
pub use subscription::{
    DEFAULT_SUBSCRIPTION_EXPIRES, NotifyOutcome, Subscriber, SubscriberKey, SubscriptionDialog, SubscriptionRole,
    SubscriptionState, event_package,
};

use std::fmt;

use tracing::{debug, trace, warn};

use sipua_message::{Method, NameAddr, Request, Response, header_names as names, uri_param};

use crate::error::{Error, Result};
use crate::services::Services;
use crate::timer::{TimerHandle, TimerKind};
use crate::user_agent::RequestOptions;

/// Dialog identifier: Call-ID, local tag and remote tag concatenated
///
/// The same dialog has a different id at each peer since the tags swap
/// places.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DialogId(String);

impl DialogId {
    pub fn new(call_id: &str, local_tag: &str, remote_tag: &str) -> Self {
        Self(format!("{}{}{}", call_id, local_tag, remote_tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Methods whose requests (and 2xx responses) replace the remote target
pub fn is_target_refresh(method: &Method) -> bool {
    matches!(
        method,
        Method::Invite | Method::Update | Method::Subscribe | Method::Notify | Method::Refer
    )
}

/// A SIP dialog as defined in RFC 3261 §12
#[derive(Debug, Clone)]
pub struct Dialog {
    /// Call-ID ⧺ local tag ⧺ remote tag
    pub id: DialogId,

    pub call_id: String,

    pub local_tag: String,

    pub remote_tag: String,

    /// Local party (From of our requests), without tag
    pub local_party: NameAddr,

    /// Remote party (To of our requests), without tag
    pub remote_party: NameAddr,

    /// Last CSeq number we used; empty until the first request
    pub local_seq: Option<u32>,

    /// Last CSeq number the peer used; empty until the first request
    pub remote_seq: Option<u32>,

    /// Where in-dialog requests go (the peer's Contact)
    pub remote_target: String,

    /// Route set, in the order Route headers are written
    pub route_set: Vec<String>,

    /// Created by a provisional response and not confirmed yet
    pub early: bool,
}

fn without_tag(mut party: NameAddr) -> NameAddr {
    party.params.retain(|(name, _)| name != "tag");
    party
}

fn missing(what: &str) -> Error {
    Error::Protocol(format!("cannot create dialog: missing {}", what))
}

impl Dialog {
    /// Dialog at the UAC, from the request we sent and the 1xx/2xx that
    /// established it (RFC 3261 §12.1.2).
    pub fn uac(request: &Request, response: &Response) -> Result<Self> {
        let call_id = request.call_id().ok_or_else(|| missing("Call-ID"))?.to_string();
        let local_tag = request.from_tag().ok_or_else(|| missing("From tag"))?;
        let remote_tag = response.to_tag().ok_or_else(|| missing("To tag"))?;
        let local_party = without_tag(request.from().ok_or_else(|| missing("From"))?);
        let remote_party = without_tag(response.to().ok_or_else(|| missing("To"))?);
        let local_seq = request.cseq().map(|c| c.seq);

        let remote_target = match response.contact_uri() {
            Some(uri) => uri,
            None => {
                warn!(call_id = %call_id, "Dialog-creating response has no Contact, using Request-URI");
                request.uri.clone()
            }
        };

        let mut route_set = response.headers.get_list(names::RECORD_ROUTE);
        route_set.reverse();

        let dialog = Self {
            id: DialogId::new(&call_id, &local_tag, &remote_tag),
            call_id,
            local_tag,
            remote_tag,
            local_party,
            remote_party,
            local_seq,
            remote_seq: None,
            remote_target,
            route_set,
            early: response.is_provisional(),
        };
        debug!(dialog = %dialog.id, early = dialog.early, "Created UAC dialog");
        Ok(dialog)
    }

    /// Dialog at the UAS, from the request we received and the local tag
    /// our responses carry (RFC 3261 §12.1.1).
    pub fn uas(request: &Request, local_tag: &str) -> Result<Self> {
        let call_id = request.call_id().ok_or_else(|| missing("Call-ID"))?.to_string();
        let remote_tag = request.from_tag().ok_or_else(|| missing("From tag"))?;
        let local_party = without_tag(request.to().ok_or_else(|| missing("To"))?);
        let remote_party = without_tag(request.from().ok_or_else(|| missing("From"))?);
        let remote_target = request.contact_uri().ok_or_else(|| missing("Contact"))?;
        let remote_seq = request.cseq().map(|c| c.seq);

        let dialog = Self {
            id: DialogId::new(&call_id, local_tag, &remote_tag),
            call_id,
            local_tag: local_tag.to_string(),
            remote_tag,
            local_party,
            remote_party,
            local_seq: None,
            remote_seq,
            remote_target,
            route_set: request.headers.get_list(names::RECORD_ROUTE),
            early: false,
        };
        debug!(dialog = %dialog.id, "Created UAS dialog");
        Ok(dialog)
    }

    /// Confirms an early dialog with its 2xx.
    ///
    /// The route set is recomputed from the 2xx. The 2xx Contact replaces the
    /// remote target learned from a provisional (RFC 3261 §12.1.2); a 2xx
    /// without Contact keeps the current one. Calling this on a confirmed
    /// dialog only refreshes the target.
    pub fn confirm(&mut self, response: &Response) {
        if self.early {
            self.recompute_route_set(response);
            self.early = false;
            debug!(dialog = %self.id, "Early dialog confirmed");
        }
        self.refresh_target(response.contact_uri());
    }

    /// Replaces the route set with the reversed Record-Route of `response`.
    pub fn recompute_route_set(&mut self, response: &Response) {
        let mut route_set = response.headers.get_list(names::RECORD_ROUTE);
        route_set.reverse();
        self.route_set = route_set;
    }

    pub fn refresh_target(&mut self, contact: Option<String>) {
        if let Some(contact) = contact {
            if contact != self.remote_target {
                trace!(dialog = %self.id, target = %contact, "Remote target refreshed");
                self.remote_target = contact;
            }
        }
    }

    /// Checks the CSeq of an in-dialog request, replying 500 statelessly
    /// when it went backwards. Returns false when the request was rejected.
    pub fn sequence_guard(&self, request: &Request, services: &Services) -> bool {
        if request.method == Method::Ack {
            return true;
        }
        let Some(cseq) = request.cseq() else {
            services.send_stateless(request, 400, &[]);
            return false;
        };
        match self.remote_seq {
            Some(remote) if cseq.seq <= remote => {
                debug!(
                    dialog = %self.id,
                    cseq = cseq.seq,
                    remote_seq = remote,
                    "Out of order in-dialog request"
                );
                services.send_stateless(request, 500, &[]);
                false
            }
            _ => true,
        }
    }

    /// Adopts the CSeq of a request that passed [`sequence_guard`](Self::sequence_guard)
    /// and refreshes the remote target for target refresh requests.
    pub fn receive_request(&mut self, request: &Request) -> Result<()> {
        if request.method == Method::Ack {
            return Ok(());
        }
        let cseq = request
            .cseq()
            .ok_or_else(|| Error::Protocol("in-dialog request without CSeq".to_string()))?;
        if let Some(remote) = self.remote_seq {
            if cseq.seq <= remote {
                return Err(Error::Protocol(format!(
                    "CSeq {} is not above the remote sequence number {}",
                    cseq.seq, remote
                )));
            }
        }
        self.remote_seq = Some(cseq.seq);
        if is_target_refresh(&request.method) {
            self.refresh_target(request.contact_uri());
        }
        Ok(())
    }

    /// Next local CSeq number, consumed.
    pub fn next_local_seq(&mut self) -> u32 {
        let next = self.local_seq.map_or(1, |seq| seq.wrapping_add(1));
        self.local_seq = Some(next);
        next
    }

    /// Builds an in-dialog request (RFC 3261 §12.2.1.1).
    ///
    /// ACK and CANCEL take their CSeq number from `options.cseq` (the
    /// INVITE they belong to); every other method consumes the next local
    /// number.
    pub fn create_outgoing_request(&mut self, method: Method, options: RequestOptions, services: &Services) -> Request {
        let seq = match (&method, options.cseq) {
            (Method::Ack | Method::Cancel, Some(seq)) => seq,
            (Method::Ack | Method::Cancel, None) => self.local_seq.unwrap_or(1),
            (_, Some(seq)) => {
                self.local_seq = Some(seq);
                seq
            }
            (_, None) => self.next_local_seq(),
        };

        let (request_uri, routes) = self.request_target();
        let mut request = Request::new(method.clone(), request_uri);
        request.headers.add(names::VIA, services.via(&services.tokens.branch()));
        request
            .headers
            .add(names::MAX_FORWARDS, services.config.max_forwards.to_string());
        request.headers.add(
            names::TO,
            self.remote_party.clone().with_param("tag", Some(self.remote_tag.as_str())).to_string(),
        );
        request.headers.add(
            names::FROM,
            self.local_party.clone().with_param("tag", Some(self.local_tag.as_str())).to_string(),
        );
        request.headers.add(names::CALL_ID, self.call_id.clone());
        request.headers.add(names::CSEQ, format!("{} {}", seq, method));
        for route in routes {
            request.headers.add(names::ROUTE, route);
        }
        if is_target_refresh(&method) {
            request
                .headers
                .add(names::CONTACT, format!("<{}>", services.config.contact));
        }
        for (name, value) in options.headers {
            request.headers.add(&name, value);
        }
        if method != Method::Ack && method != Method::Cancel {
            services.decorate_request(&mut request);
        }
        request.body = options.body;
        request
    }

    /// Request-URI and Route values for the next request.
    fn request_target(&self) -> (String, Vec<String>) {
        let Some(first) = self.route_set.first() else {
            return (self.remote_target.clone(), Vec::new());
        };
        let first_uri = first
            .parse::<NameAddr>()
            .map(|addr| addr.uri)
            .unwrap_or_else(|_| first.trim_matches(['<', '>']).to_string());

        if uri_param(&first_uri, "lr").is_some() {
            (self.remote_target.clone(), self.route_set.clone())
        } else {
            // Strict router: it becomes the Request-URI, the remote target goes last
            let mut routes: Vec<String> = self.route_set[1..].to_vec();
            routes.push(format!("<{}>", self.remote_target));
            (first_uri, routes)
        }
    }
}

/// A dialog together with the usage that created it
#[derive(Debug)]
pub enum DialogUsage {
    Session(SessionDialog),
    Subscription(SubscriptionDialog),
}

/// What a dialog timer asks the core to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogTimerOutcome {
    /// A subscription refresh is due
    Refresh,
    /// The dialog ended
    Terminated(String),
}

impl DialogUsage {
    pub fn dialog(&self) -> &Dialog {
        match self {
            DialogUsage::Session(s) => &s.dialog,
            DialogUsage::Subscription(s) => &s.dialog,
        }
    }

    pub fn dialog_mut(&mut self) -> &mut Dialog {
        match self {
            DialogUsage::Session(s) => &mut s.dialog,
            DialogUsage::Subscription(s) => &mut s.dialog,
        }
    }

    pub fn id(&self) -> &DialogId {
        &self.dialog().id
    }

    pub fn as_session(&self) -> Option<&SessionDialog> {
        match self {
            DialogUsage::Session(s) => Some(s),
            DialogUsage::Subscription(_) => None,
        }
    }

    pub fn as_session_mut(&mut self) -> Option<&mut SessionDialog> {
        match self {
            DialogUsage::Session(s) => Some(s),
            DialogUsage::Subscription(_) => None,
        }
    }

    pub fn as_subscription(&self) -> Option<&SubscriptionDialog> {
        match self {
            DialogUsage::Subscription(s) => Some(s),
            DialogUsage::Session(_) => None,
        }
    }

    pub fn as_subscription_mut(&mut self) -> Option<&mut SubscriptionDialog> {
        match self {
            DialogUsage::Subscription(s) => Some(s),
            DialogUsage::Session(_) => None,
        }
    }

    pub fn on_timer(
        &mut self,
        kind: TimerKind,
        handle: TimerHandle,
        services: &Services,
    ) -> Option<DialogTimerOutcome> {
        match self {
            DialogUsage::Session(s) => {
                s.on_timer(kind, handle, services);
                None
            }
            DialogUsage::Subscription(s) => s.on_timer(kind, handle, services),
        }
    }

    /// Cancels the usage's timers.
    pub fn dispose(&mut self, services: &Services) {
        match self {
            DialogUsage::Session(s) => s.dispose(services),
            DialogUsage::Subscription(s) => s.dispose(services),
        }
    }
}
