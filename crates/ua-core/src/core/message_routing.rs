//! Incoming message routing
//!
//! Requests go through the checks of RFC 3261 §8.2 and §12.2.2 in this order:
//!
//! ```text
//! ACK ──────────────► INVITE server transaction, else the session dialog
//! retransmission ───► its server transaction
//! method ───────────► 405 + Allow
//! URI scheme ───────► 416
//! Request-URI user ─► 404
//! Max-Forwards 0 ───► 483 (except OPTIONS)
//! CANCEL ───────────► 200/481, 487 for the INVITE
//! To-tag ───────────► dialog, subscriber NOTIFY, else 481
//! merged request ───► 482
//! out-of-dialog ────► application (delegated) or the default reply
//! ```

use tracing::{debug, trace, warn};

use sipua_message::{
    Message, Method, Request, Response, header_names as names, parse_message, uri_scheme, uri_user,
};

use super::{UserAgentCore, UserAgentEvent};
use crate::config::ALLOWED_METHODS;
use crate::dialog::{
    BodyDirection, Dialog, DialogId, DialogUsage, SubscriberKey, SubscriptionDialog, SubscriptionRole,
    SubscriptionState,
};
use crate::transaction::{
    NonInviteServerTransaction, Transaction, TransactionKey, TransactionState,
};
use crate::user_agent::{ClientRole, ServerRole};

impl UserAgentCore {
    /// Parses and routes one message from the transport. Unparseable input
    /// is dropped.
    pub fn receive(&mut self, data: &[u8]) {
        match parse_message(data) {
            Ok(message) => self.receive_message(message),
            Err(e) => warn!(error = %e, bytes = data.len(), "Dropping unparseable message"),
        }
    }

    /// Routes one parsed message.
    pub fn receive_message(&mut self, message: Message) {
        match message {
            Message::Request(request) => self.receive_request(request),
            Message::Response(response) => self.receive_response(response),
        }
    }

    fn receive_request(&mut self, request: Request) {
        let Some(key) = TransactionKey::from_request(&request, true) else {
            warn!(method = %request.method, "Dropping request without Via branch");
            return;
        };
        if request.call_id().is_none() || request.cseq().is_none() || request.from().is_none() || request.to().is_none()
        {
            warn!(method = %request.method, "Dropping request missing a mandatory header");
            return;
        }

        if request.method == Method::Ack {
            self.receive_ack(request, key);
            return;
        }

        if self.transactions.contains_key(&key) {
            self.receive_retransmission(&request, &key);
            return;
        }

        if !ALLOWED_METHODS.contains(&request.method) {
            debug!(method = %request.method, "Method not allowed");
            self.services
                .send_stateless(&request, 405, &[(names::ALLOW, self.services.config.allow_header())]);
            return;
        }

        if !matches!(uri_scheme(&request.uri).as_deref(), Some("sip" | "sips" | "tel")) {
            debug!(uri = %request.uri, "Unsupported URI scheme");
            self.services.send_stateless(&request, 416, &[]);
            return;
        }

        if !self.owns_request_uri(&request) {
            debug!(uri = %request.uri, "Request-URI is not ours");
            self.services.send_stateless(&request, 404, &[]);
            return;
        }

        if request.max_forwards() == Some(0) && request.method != Method::Options {
            debug!(method = %request.method, "Max-Forwards exhausted");
            self.services.send_stateless(&request, 483, &[]);
            return;
        }

        if request.method == Method::Cancel {
            self.receive_cancel(request, key);
            return;
        }

        if request.to_tag().is_some() {
            self.receive_in_dialog(request);
            return;
        }

        if self.is_merged(&request) {
            debug!(method = %request.method, "Merged request");
            self.respond_statefully(&request, 482, Vec::new());
            return;
        }

        self.receive_out_of_dialog(request);
    }

    /// A Request-URI user part must name our AOR or contact.
    fn owns_request_uri(&self, request: &Request) -> bool {
        let Some(user) = uri_user(&request.uri) else {
            return true;
        };
        let config = &self.services.config;
        uri_user(&config.aor).as_deref() == Some(user.as_str())
            || uri_user(&config.contact).as_deref() == Some(user.as_str())
    }

    fn receive_ack(&mut self, ack: Request, key: TransactionKey) {
        // ACK for a non-2xx shares the INVITE's branch
        if let Some(Transaction::InviteServer(tx)) = self.transactions.get_mut(&key) {
            if tx.state() != TransactionState::Accepted {
                let events = tx.receive_request(&ack, &self.services);
                match events {
                    Ok(events) => self.handle_server_events(&key, events),
                    Err(e) => warn!(id = %key, error = %e, "ACK rejected by transaction"),
                }
                return;
            }
        }

        let (Some(call_id), Some(to_tag), Some(from_tag)) = (ack.call_id(), ack.to_tag(), ack.from_tag()) else {
            trace!("Dropping ACK outside any transaction or dialog");
            return;
        };
        let id = DialogId::new(call_id, &to_tag, &from_tag);
        let Some(session) = self.dialogs.get_mut(&id).and_then(DialogUsage::as_session_mut) else {
            trace!(dialog = %id, "Dropping ACK for unknown dialog");
            return;
        };
        if session.receive_ack(&ack, &self.services) {
            self.emit(UserAgentEvent::AckReceived { dialog: id, ack });
        }
    }

    fn receive_retransmission(&mut self, request: &Request, key: &TransactionKey) {
        let events = match self.transactions.get_mut(key) {
            Some(Transaction::InviteServer(tx)) => tx.receive_request(request, &self.services),
            Some(Transaction::NonInviteServer(tx)) => {
                tx.receive_request(request, &self.services);
                Ok(Vec::new())
            }
            _ => return,
        };
        match events {
            Ok(events) => self.handle_server_events(key, events),
            Err(e) => warn!(id = %key, error = %e, "Retransmission rejected by transaction"),
        }
    }

    fn receive_cancel(&mut self, cancel: Request, key: TransactionKey) {
        let Some(invite_key) = TransactionKey::cancelled_by(&cancel) else {
            return;
        };
        let invite_state = match self.transactions.get(&invite_key) {
            Some(Transaction::InviteServer(tx)) => Some(tx.state()),
            _ => None,
        };

        let transaction = match NonInviteServerTransaction::new(cancel.clone()) {
            Ok(tx) => tx,
            Err(e) => {
                warn!(error = %e, "Cannot handle CANCEL");
                return;
            }
        };
        self.transactions
            .insert(key.clone(), Transaction::NonInviteServer(transaction));

        let uas = self.server_by_transaction.get(&invite_key).copied();
        let status = if invite_state.is_some() { 200 } else { 481 };
        let mut response = Response::for_request(&cancel, status, None);
        let tag = match uas.and_then(|id| self.servers.get_mut(&id)) {
            Some(server) => server.local_tag(&self.services),
            None => self.services.tokens.token(),
        };
        response = response.with_to_tag(&tag);
        debug!(id = %invite_key, status, "Answering CANCEL");
        match self.server_transaction_respond(&key, response) {
            Ok(events) => self.handle_server_events(&key, events),
            Err(e) => warn!(id = %key, error = %e, "Failed to answer CANCEL"),
        }

        if invite_state != Some(TransactionState::Proceeding) {
            return;
        }
        let Some(uas) = uas else {
            return;
        };
        match self.reject(uas, 487, Default::default()) {
            Ok(()) => self.emit(UserAgentEvent::Cancelled { uas, request: cancel }),
            Err(e) => warn!(uas = %uas, error = %e, "Could not terminate cancelled INVITE"),
        }
    }

    fn receive_in_dialog(&mut self, request: Request) {
        let (Some(call_id), Some(to_tag), Some(from_tag)) = (request.call_id(), request.to_tag(), request.from_tag())
        else {
            self.respond_statefully(&request, 481, Vec::new());
            return;
        };
        let id = DialogId::new(call_id, &to_tag, &from_tag);

        let Some(usage) = self.dialogs.get_mut(&id) else {
            if request.method == Method::Notify {
                if let Some(key) = SubscriberKey::for_notify(&request) {
                    if self.subscribers.contains_key(&key) {
                        self.receive_first_notify(key, request);
                        return;
                    }
                }
            }
            debug!(dialog = %id, method = %request.method, "No dialog for request");
            self.respond_statefully(&request, 481, Vec::new());
            return;
        };

        if !usage.dialog().sequence_guard(&request, &self.services) {
            return;
        }
        if let Err(e) = usage.dialog_mut().receive_request(&request) {
            warn!(dialog = %id, error = %e, "In-dialog request refused");
            return;
        }

        let is_session = usage.as_session().is_some();
        let notifier = usage.as_subscription().map(|s| s.role == SubscriptionRole::Notifier);
        let method = request.method.clone();
        match (method, is_session, notifier) {
            (Method::Bye, _, _) => {
                self.respond_statefully(&request, 200, Vec::new());
                self.terminate_dialog(&id, "BYE received");
                self.terminate_pending_invite(&id);
            }
            (Method::Invite, true, _) => self.receive_reinvite(id, request),
            (Method::Notify, false, Some(false)) => self.receive_notify(id, request),
            (Method::Subscribe, false, Some(true)) => self.dispatch(request, ServerRole::Refresh, Some(id)),
            (method, true, _) => {
                if method == Method::Update || method == Method::Prack {
                    if let Some(session) = self.dialogs.get_mut(&id).and_then(DialogUsage::as_session_mut) {
                        session.on_request(&request, BodyDirection::Inbound);
                    }
                }
                self.dispatch(request, ServerRole::Generic, Some(id));
            }
            _ => self.dispatch(request, ServerRole::Generic, Some(id)),
        }
    }

    /// A BYE in an early dialog ends the INVITE that created it with 487
    /// (RFC 3261 §15.1.2).
    fn terminate_pending_invite(&mut self, id: &DialogId) {
        let pending = self
            .servers
            .values()
            .find(|s| s.role == ServerRole::Invite && !s.final_sent && s.dialog.as_ref() == Some(id))
            .map(|s| s.id);
        let Some(uas) = pending else {
            return;
        };
        debug!(dialog = %id, uas = %uas, "BYE in early dialog, terminating the INVITE");
        if let Err(e) = self.reject(uas, 487, Default::default()) {
            warn!(uas = %uas, error = %e, "Could not terminate INVITE after BYE");
        }
    }

    fn receive_reinvite(&mut self, id: DialogId, request: Request) {
        let Some(session) = self.dialogs.get_mut(&id).and_then(DialogUsage::as_session_mut) else {
            return;
        };
        if let Some((status, headers)) = session.reinvite_rejection(&self.services) {
            debug!(dialog = %id, status, "re-INVITE collides with one in progress");
            self.respond_statefully(&request, status, headers);
            return;
        }
        session.on_request(&request, BodyDirection::Inbound);
        let key = TransactionKey::from_request(&request, true);
        session.reinvite_server = key;
        self.dispatch(request, ServerRole::ReInvite, Some(id));
    }

    /// The first NOTIFY of a subscription creates its dialog (RFC 6665 §4.1.2.4).
    fn receive_first_notify(&mut self, key: SubscriberKey, notify: Request) {
        let Some(mut subscriber) = self.subscribers.remove(&key) else {
            return;
        };
        subscriber.dispose(&self.services);
        let local_tag = notify.to_tag().unwrap_or_default();
        let mut dialog = match Dialog::uas(&notify, &local_tag) {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!(subscriber = %key, error = %e, "Cannot create subscription dialog");
                self.respond_statefully(&notify, 400, Vec::new());
                return;
            }
        };
        dialog.local_seq = subscriber.request.cseq().map(|c| c.seq);
        let id = dialog.id.clone();
        let subscription =
            SubscriptionDialog::subscriber(dialog, &subscriber.event, subscriber.requested_expires, &self.services);
        debug!(subscriber = %key, dialog = %id, "Subscription dialog created");
        self.dialogs
            .insert(id.clone(), DialogUsage::Subscription(subscription));
        for client in self.clients.values_mut() {
            if client.role == ClientRole::Subscribe(key.clone()) {
                client.dialogs.push(id.clone());
            }
        }
        self.receive_notify(id, notify);
    }

    fn receive_notify(&mut self, id: DialogId, notify: Request) {
        let Some(subscription) = self.dialogs.get_mut(&id).and_then(DialogUsage::as_subscription_mut) else {
            return;
        };
        let outcome = match subscription.on_notify(&notify, &self.services) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(dialog = %id, error = %e, "Bad NOTIFY");
                self.respond_statefully(&notify, 400, Vec::new());
                return;
            }
        };
        let expires = subscription.expires();
        self.respond_statefully(&notify, 200, Vec::new());
        self.emit(UserAgentEvent::Notify {
            dialog: id.clone(),
            request: notify,
        });
        if outcome.changed {
            self.emit(UserAgentEvent::SubscriptionStateChanged {
                dialog: id.clone(),
                state: outcome.state,
                expires,
            });
        }
        if outcome.state == SubscriptionState::Terminated {
            let reason = outcome.reason.unwrap_or_else(|| "terminated by notifier".to_string());
            self.terminate_dialog(&id, &reason);
        }
    }

    /// Same From-tag, Call-ID and CSeq as a request already being served
    /// (RFC 3261 §8.2.2.2).
    fn is_merged(&self, request: &Request) -> bool {
        let (Some(call_id), Some(from_tag), Some(cseq)) = (request.call_id(), request.from_tag(), request.cseq()) else {
            return false;
        };
        self.transactions.iter().any(|(key, tx)| {
            let other = tx.request();
            key.is_server
                && other.method == request.method
                && other.call_id() == Some(call_id)
                && other.from_tag().as_deref() == Some(from_tag.as_str())
                && other.cseq().map(|c| c.seq) == Some(cseq.seq)
        })
    }

    fn receive_out_of_dialog(&mut self, request: Request) {
        let method = request.method.clone();
        let config = self.services.config.clone();

        if method == Method::Options && !config.is_delegated(&method) {
            let mut headers = vec![(names::ALLOW, config.allow_header())];
            if !config.accepted_content_types.is_empty() {
                headers.push((names::ACCEPT, config.accepted_content_types.join(", ")));
            }
            if !config.supported_option_tags.is_empty() {
                headers.push((names::SUPPORTED, config.supported_option_tags.join(", ")));
            }
            self.services.send_stateless(&request, 200, &headers);
            return;
        }

        if !config.is_delegated(&method) {
            let status = match method {
                Method::Invite | Method::Subscribe => 480,
                Method::Message => 200,
                Method::Refer | Method::Register => 405,
                _ => 481,
            };
            let headers = if status == 405 {
                vec![(names::ALLOW.to_string(), config.allow_header())]
            } else {
                Vec::new()
            };
            debug!(method = %method, status, "Method not delegated, default reply");
            self.respond_statefully(&request, status, headers);
            return;
        }

        let dialog_creating = matches!(method, Method::Invite | Method::Subscribe | Method::Refer);
        if dialog_creating && request.contact_uri().is_none() {
            self.respond_statefully(&request, 400, Vec::new());
            return;
        }
        if method == Method::Subscribe && request.header(names::EVENT).is_none() {
            self.respond_statefully(&request, 489, Vec::new());
            return;
        }
        if method == Method::Refer && request.header(names::REFER_TO).is_none() {
            self.respond_statefully(&request, 400, Vec::new());
            return;
        }

        let role = match method {
            Method::Invite => ServerRole::Invite,
            Method::Subscribe => ServerRole::Subscribe,
            Method::Refer => ServerRole::Refer,
            _ => ServerRole::Generic,
        };
        self.dispatch(request, role, None);
    }

    /// Hands a request to the application through a new UAS.
    fn dispatch(&mut self, request: Request, role: ServerRole, dialog: Option<DialogId>) {
        match self.start_server(request.clone(), role, dialog.clone()) {
            Ok(uas) => self.emit(UserAgentEvent::IncomingRequest { uas, dialog, request }),
            Err(e) => warn!(method = %request.method, error = %e, "Cannot serve request"),
        }
    }
}
