//! User agent client and server
//!
//! A [`UserAgentClient`] is one outgoing request and the client transaction
//! carrying it; a [`UserAgentServer`] is one incoming request and its server
//! transaction. Method specific behavior is selected by a [`ClientRole`] or
//! [`ServerRole`] instead of one type per method; the
//! [`UserAgentCore`](crate::UserAgentCore) interprets the role when responses
//! and timers arrive.

pub mod auth;

use std::fmt;

use tracing::{debug, warn};

use sipua_message::{Body, Method, Request, Response, header_names as names};

use crate::dialog::{DialogId, SubscriberKey, is_target_refresh};
use crate::error::{Error, Result};
use crate::services::Services;
use crate::transaction::TransactionKey;
use auth::Challenge;

/// Identifies a [`UserAgentClient`] in events and core calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UacId(pub u64);

impl fmt::Display for UacId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uac-{}", self.0)
    }
}

/// Identifies a [`UserAgentServer`] in events and core calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UasId(pub u64);

impl fmt::Display for UasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uas-{}", self.0)
    }
}

/// Extra content for an outgoing request
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// CSeq number to use instead of the next one
    pub cseq: Option<u32>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_cseq(mut self, cseq: u32) -> Self {
        self.cseq = Some(cseq);
        self
    }
}

/// Extra content for a response sent by a UAS
#[derive(Debug, Clone, Default)]
pub struct ResponseOptions {
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
}

impl ResponseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }
}

/// The class a response status falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 100
    Trying,
    /// 101-199
    Progress,
    /// 2xx
    Accept,
    /// 3xx
    Redirect,
    /// 4xx-6xx
    Reject,
}

impl ResponseClass {
    pub fn of(status: u16) -> Option<Self> {
        match status {
            100 => Some(Self::Trying),
            101..=199 => Some(Self::Progress),
            200..=299 => Some(Self::Accept),
            300..=399 => Some(Self::Redirect),
            400..=699 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// What an outgoing request means to the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRole {
    /// No special handling beyond reporting responses
    Generic,
    /// Out-of-dialog INVITE; 1xx/2xx with a To-tag create session dialogs
    Invite,
    /// INVITE inside an existing session dialog
    ReInvite,
    /// Out-of-dialog SUBSCRIBE or REFER, waiting for its first NOTIFY
    Subscribe(SubscriberKey),
    /// SUBSCRIBE refreshing (or ending, with Expires 0) a subscription dialog
    Refresh,
    /// The dialog ends once this request completes (BYE, final NOTIFY)
    EndsDialog,
}

/// What an incoming request means to the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Generic,
    /// Out-of-dialog INVITE; provisional and 2xx responses create a session dialog
    Invite,
    /// INVITE inside an existing session dialog
    ReInvite,
    /// Out-of-dialog SUBSCRIBE; a 2xx creates a notifier dialog
    Subscribe,
    /// Out-of-dialog REFER; a 2xx creates a notifier dialog for `refer`
    Refer,
    /// SUBSCRIBE inside an existing notifier dialog
    Refresh,
}

impl ServerRole {
    pub fn creates_dialog(&self, status: u16) -> bool {
        match self {
            ServerRole::Invite => (101..300).contains(&status),
            ServerRole::Subscribe | ServerRole::Refer => (200..300).contains(&status),
            _ => false,
        }
    }
}

/// One outgoing request and its client transaction
#[derive(Debug)]
pub struct UserAgentClient {
    pub id: UacId,
    pub role: ClientRole,
    /// The request as last sent
    pub request: Request,
    pub transaction: TransactionKey,
    /// Dialog the request was sent in
    pub dialog: Option<DialogId>,
    /// Dialogs created by responses to this request
    pub dialogs: Vec<DialogId>,
    challenged: bool,
    stale: bool,
    pub(crate) cancel_pending: Option<RequestOptions>,
}

impl UserAgentClient {
    pub fn new(
        id: UacId,
        role: ClientRole,
        request: Request,
        transaction: TransactionKey,
        dialog: Option<DialogId>,
    ) -> Self {
        Self {
            id,
            role,
            request,
            transaction,
            dialog,
            dialogs: Vec::new(),
            challenged: false,
            stale: false,
            cancel_pending: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    pub fn cseq(&self) -> u32 {
        self.request.cseq().map(|c| c.seq).unwrap_or_default()
    }

    /// Answers a 401/407 with credentials from the configured factory.
    ///
    /// Returns the header name and value to retry with, or `None` when the
    /// challenge is invalid, no credentials are available, or the same
    /// challenge was already answered.
    pub(crate) fn authorization(&mut self, response: &Response, services: &Services) -> Option<(&'static str, String)> {
        let challenge = match Challenge::from_response(response) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!(uac = %self.id, error = %e, "Ignoring invalid challenge");
                return None;
            }
        };
        if self.challenged && (self.stale || !challenge.stale) {
            debug!(uac = %self.id, status = response.status, "Challenge already answered, giving up");
            return None;
        }
        let factory = services.config.authentication_factory.as_ref()?;
        let credentials = factory()?;
        let value = credentials.authenticate(&self.request, &challenge)?;
        self.challenged = true;
        self.stale = challenge.stale;
        Some((challenge.authorization_header(), value))
    }

    /// Copy of the request with a new branch, CSeq number and credentials.
    pub(crate) fn reissue(&mut self, header: &str, value: String, cseq: u32, services: &Services) -> Request {
        let mut request = self.request.clone();
        request.headers.set(names::VIA, services.via(&services.tokens.branch()));
        request
            .headers
            .set(names::CSEQ, format!("{} {}", cseq, request.method));
        request.headers.set(header, value);
        self.request = request.clone();
        request
    }

    /// CANCEL for the INVITE (RFC 3261 §9.1).
    pub(crate) fn build_cancel(&self, options: RequestOptions) -> Result<Request> {
        if self.request.method != Method::Invite {
            return Err(Error::InvalidState(format!("cannot CANCEL a {}", self.request.method)));
        }
        let invite = &self.request;
        let mut cancel = Request::new(Method::Cancel, invite.uri.clone());
        if let Some(via) = invite.top_via() {
            cancel.headers.add(names::VIA, via);
        }
        cancel
            .headers
            .add(names::MAX_FORWARDS, invite.max_forwards().unwrap_or(70).to_string());
        for name in [names::TO, names::FROM, names::CALL_ID] {
            if let Some(value) = invite.header(name) {
                cancel.headers.add(name, value);
            }
        }
        cancel.headers.add(names::CSEQ, format!("{} CANCEL", self.cseq()));
        for route in invite.headers.get_all(names::ROUTE) {
            cancel.headers.add(names::ROUTE, route);
        }
        for (name, value) in options.headers {
            cancel.headers.add(&name, value);
        }
        Ok(cancel)
    }
}

/// One incoming request and its server transaction
#[derive(Debug)]
pub struct UserAgentServer {
    pub id: UasId,
    pub role: ServerRole,
    pub request: Request,
    pub transaction: TransactionKey,
    /// Dialog the request arrived in, or the one our responses created
    pub dialog: Option<DialogId>,
    local_tag: Option<String>,
    pub(crate) final_sent: bool,
}

impl UserAgentServer {
    pub fn new(
        id: UasId,
        role: ServerRole,
        request: Request,
        transaction: TransactionKey,
        dialog: Option<DialogId>,
    ) -> Self {
        let local_tag = request.to_tag();
        Self {
            id,
            role,
            request,
            transaction,
            dialog,
            local_tag,
            final_sent: false,
        }
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    /// To-tag of our responses; generated once when the request has none.
    pub fn local_tag(&mut self, services: &Services) -> String {
        self.local_tag
            .get_or_insert_with(|| services.tokens.token())
            .clone()
    }

    /// Builds a response of `class` to the request.
    pub(crate) fn build_response(
        &mut self,
        class: ResponseClass,
        status: u16,
        options: ResponseOptions,
        services: &Services,
    ) -> Result<Response> {
        if ResponseClass::of(status) != Some(class) {
            return Err(Error::InvalidState(format!("{} is not a {:?} status", status, class)));
        }
        if self.final_sent {
            return Err(Error::InvalidState(format!("{} already answered with a final response", self.id)));
        }

        let mut response = Response::for_request(&self.request, status, options.reason.as_deref());
        if status > 100 {
            let tag = self.local_tag(services);
            response = response.with_to_tag(&tag);
        }

        if self.role.creates_dialog(status) {
            for record_route in self.request.headers.get_all(names::RECORD_ROUTE) {
                response.headers.add(names::RECORD_ROUTE, record_route);
            }
        }
        let refreshes = (101..300).contains(&status)
            && is_target_refresh(&self.request.method)
            && self.request.method != Method::Notify;
        if refreshes && (self.role.creates_dialog(status) || self.dialog.is_some()) {
            response
                .headers
                .add(names::CONTACT, format!("<{}>", services.config.contact));
        }
        for (name, value) in options.headers {
            response.headers.add(&name, value);
        }
        response.body = options.body;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::test_support::{Harness, request};

    fn uas(method: Method, role: ServerRole) -> UserAgentServer {
        let req = request(method, "z9hG4bKuas").with_header(names::RECORD_ROUTE, "<sip:p1.example.com;lr>");
        let key = TransactionKey::from_request(&req, true).unwrap();
        UserAgentServer::new(UasId(1), role, req, key, None)
    }

    #[test]
    fn test_response_class() {
        assert_eq!(ResponseClass::of(100), Some(ResponseClass::Trying));
        assert_eq!(ResponseClass::of(183), Some(ResponseClass::Progress));
        assert_eq!(ResponseClass::of(302), Some(ResponseClass::Redirect));
        assert_eq!(ResponseClass::of(603), Some(ResponseClass::Reject));
        assert_eq!(ResponseClass::of(700), None);
    }

    #[test]
    fn test_to_tag_generated_once() {
        let harness = Harness::new(false);
        let mut server = uas(Method::Invite, ServerRole::Invite);

        let trying = server
            .build_response(ResponseClass::Trying, 100, ResponseOptions::new(), &harness.services)
            .unwrap();
        assert_eq!(trying.to_tag(), None);

        let ringing = server
            .build_response(ResponseClass::Progress, 180, ResponseOptions::new(), &harness.services)
            .unwrap();
        let ok = server
            .build_response(ResponseClass::Accept, 200, ResponseOptions::new(), &harness.services)
            .unwrap();
        assert!(ringing.to_tag().is_some());
        assert_eq!(ringing.to_tag(), ok.to_tag());
        assert_eq!(ok.header(names::RECORD_ROUTE), Some("<sip:p1.example.com;lr>"));
        assert!(ok.contact_uri().is_some());
    }

    #[test]
    fn test_class_mismatch_is_usage_error() {
        let harness = Harness::new(false);
        let mut server = uas(Method::Message, ServerRole::Generic);
        let result = server.build_response(ResponseClass::Accept, 486, ResponseOptions::new(), &harness.services);
        assert!(matches!(result, Err(Error::InvalidState(_))));

        let ok = server
            .build_response(ResponseClass::Accept, 200, ResponseOptions::new(), &harness.services)
            .unwrap();
        assert_eq!(ok.header(names::RECORD_ROUTE), None);
        assert_eq!(ok.header(names::CONTACT), None);
    }

    #[test]
    fn test_cancel_mirrors_invite() {
        let invite = request(Method::Invite, "z9hG4bKinv");
        let key = TransactionKey::from_request(&invite, false).unwrap();
        let client = UserAgentClient::new(UacId(1), ClientRole::Invite, invite.clone(), key.clone(), None);
        let cancel = client.build_cancel(RequestOptions::new()).unwrap();

        assert_eq!(cancel.uri, invite.uri);
        assert_eq!(cancel.via_branch(), invite.via_branch());
        assert_eq!(cancel.cseq().unwrap().seq, invite.cseq().unwrap().seq);
        assert_eq!(cancel.cseq().unwrap().method, Method::Cancel);
        assert_eq!(cancel.header(names::ROUTE), invite.header(names::ROUTE));
        assert_eq!(TransactionKey::cancelled_by(&cancel), Some(TransactionKey { is_server: true, ..key }));

        let message = request(Method::Message, "z9hG4bKmsg");
        let key = TransactionKey::from_request(&message, false).unwrap();
        let client = UserAgentClient::new(UacId(2), ClientRole::Generic, message, key, None);
        assert!(client.build_cancel(RequestOptions::new()).is_err());
    }
}
