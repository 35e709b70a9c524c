//! Requests the application sends
//!
//! Out-of-dialog requests are built from the configuration; in-dialog
//! requests from the dialog state (RFC 3261 §12.2.1.1). Either way the
//! request goes out over a new client transaction owned by a new UAC whose
//! id is returned.

use tracing::{debug, warn};

use sipua_message::{Method, NameAddr, Request, header_names as names};

use super::UserAgentCore;
use crate::dialog::{
    BodyDirection, DEFAULT_SUBSCRIPTION_EXPIRES, DialogId, DialogUsage, Subscriber, SubscriptionRole,
    SubscriptionState, is_target_refresh,
};
use crate::error::{Error, Result};
use crate::transaction::{NonInviteClientTransaction, Transaction, TransactionState};
use crate::user_agent::{ClientRole, RequestOptions, UacId};

impl UserAgentCore {
    /// Sends an out-of-dialog request to `target`.
    ///
    /// INVITE, SUBSCRIBE and REFER are routed to [`invite`], [`subscribe`]
    /// and [`refer`] so that their dialogs get tracked.
    ///
    /// [`invite`]: UserAgentCore::invite
    /// [`subscribe`]: UserAgentCore::subscribe
    /// [`refer`]: UserAgentCore::refer
    pub fn request(&mut self, method: Method, target: &str, options: RequestOptions) -> Result<UacId> {
        match method {
            Method::Invite => self.invite(target, options),
            Method::Ack | Method::Cancel => Err(Error::InvalidState(format!(
                "{} is only sent for an existing INVITE",
                method
            ))),
            Method::Subscribe => {
                let event = options
                    .headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(names::EVENT))
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| Error::InvalidState("SUBSCRIBE without Event".to_string()))?;
                let options = RequestOptions {
                    headers: options
                        .headers
                        .into_iter()
                        .filter(|(name, _)| !name.eq_ignore_ascii_case(names::EVENT))
                        .collect(),
                    ..options
                };
                self.subscribe(target, &event, DEFAULT_SUBSCRIPTION_EXPIRES, options)
            }
            _ => {
                let request = self.out_of_dialog_request(method, target, options);
                self.start_client(request, ClientRole::Generic, None)
            }
        }
    }

    /// Starts a session with `target`; put the offer in `options.body`.
    pub fn invite(&mut self, target: &str, options: RequestOptions) -> Result<UacId> {
        let request = self.out_of_dialog_request(Method::Invite, target, options);
        self.start_client(request, ClientRole::Invite, None)
    }

    /// Subscribes to `event` at `target` (RFC 6665 §4.1.2.1).
    ///
    /// The subscription dialog is created by the first NOTIFY; until then
    /// Timer N runs.
    pub fn subscribe(&mut self, target: &str, event: &str, expires: u32, options: RequestOptions) -> Result<UacId> {
        let options = options
            .with_header(names::EVENT, event)
            .with_header(names::EXPIRES, expires.to_string());
        let request = self.out_of_dialog_request(Method::Subscribe, target, options);
        self.start_subscriber(request, event, expires)
    }

    /// Asks `target` to contact `refer_to` (RFC 3515). Progress comes back
    /// as NOTIFYs for the implicit `refer` subscription.
    pub fn refer(&mut self, target: &str, refer_to: &str, options: RequestOptions) -> Result<UacId> {
        let options = options.with_header(names::REFER_TO, format!("<{}>", refer_to));
        let request = self.out_of_dialog_request(Method::Refer, target, options);
        self.start_subscriber(request, "refer", DEFAULT_SUBSCRIPTION_EXPIRES)
    }

    fn start_subscriber(&mut self, request: Request, event: &str, expires: u32) -> Result<UacId> {
        let subscriber = Subscriber::new(request.clone(), event, expires, &self.services)?;
        let key = subscriber.key.clone();
        self.subscribers.insert(key.clone(), subscriber);
        match self.start_client(request, ClientRole::Subscribe(key.clone()), None) {
            Ok(uac) => Ok(uac),
            Err(e) => {
                if let Some(mut subscriber) = self.subscribers.remove(&key) {
                    subscriber.dispose(&self.services);
                }
                Err(e)
            }
        }
    }

    /// Out-of-dialog request (RFC 3261 §8.1.1).
    fn out_of_dialog_request(&self, method: Method, target: &str, options: RequestOptions) -> Request {
        let services = &self.services;
        let config = &services.config;

        let mut from = NameAddr::new(config.aor.clone());
        if let Some(display_name) = &config.display_name {
            from = from.with_display_name(display_name.clone());
        }
        let from = from.with_param("tag", Some(services.tokens.token().as_str()));
        let seq = options.cseq.unwrap_or_else(|| services.tokens.pick(1, 10_000));

        let mut request = Request::new(method.clone(), target);
        request.headers.add(names::VIA, services.via(&services.tokens.branch()));
        request.headers.add(names::MAX_FORWARDS, config.max_forwards.to_string());
        request.headers.add(names::TO, NameAddr::new(target).to_string());
        request.headers.add(names::FROM, from.to_string());
        request.headers.add(names::CALL_ID, services.tokens.token());
        request.headers.add(names::CSEQ, format!("{} {}", seq, method));
        for route in &config.route_set {
            request.headers.add(names::ROUTE, route.clone());
        }
        if is_target_refresh(&method) || matches!(method, Method::Subscribe | Method::Refer | Method::Register) {
            request.headers.add(names::CONTACT, format!("<{}>", config.contact));
        }
        for (name, value) in options.headers {
            request.headers.add(&name, value);
        }
        services.decorate_request(&mut request);
        request.body = options.body;
        request
    }

    /// Sends `method` inside `dialog`.
    ///
    /// BYE and INVITE go through [`bye`] and [`reinvite`]. ACK and CANCEL
    /// have their own operations.
    ///
    /// [`bye`]: UserAgentCore::bye
    /// [`reinvite`]: UserAgentCore::reinvite
    pub fn dialog_request(&mut self, dialog: &DialogId, method: Method, options: RequestOptions) -> Result<UacId> {
        match method {
            Method::Ack | Method::Cancel => {
                return Err(Error::InvalidState(format!("use the dedicated operation to send {}", method)));
            }
            Method::Bye => return self.bye(dialog, options),
            Method::Invite => return self.reinvite(dialog, options),
            _ => {}
        }
        let usage = self
            .dialogs
            .get_mut(dialog)
            .ok_or_else(|| Error::DialogNotFound(dialog.clone()))?;
        let request = usage
            .dialog_mut()
            .create_outgoing_request(method, options, &self.services);
        if let DialogUsage::Session(session) = usage {
            if matches!(request.method, Method::Update | Method::Prack) {
                session.on_request(&request, BodyDirection::Outbound);
            }
        }
        self.start_client(request, ClientRole::Generic, Some(dialog.clone()))
    }

    /// Ends `dialog` with a BYE. The dialog is terminated once the BYE
    /// completes, whatever the response.
    pub fn bye(&mut self, dialog: &DialogId, options: RequestOptions) -> Result<UacId> {
        let usage = self
            .dialogs
            .get_mut(dialog)
            .ok_or_else(|| Error::DialogNotFound(dialog.clone()))?;
        let request = usage
            .dialog_mut()
            .create_outgoing_request(Method::Bye, options, &self.services);
        debug!(dialog = %dialog, "Sending BYE");
        self.start_client(request, ClientRole::EndsDialog, Some(dialog.clone()))
    }

    /// Sends a re-INVITE in a session dialog.
    ///
    /// Fails while another INVITE transaction is in progress in the dialog,
    /// in either direction (RFC 3261 §14.1).
    pub fn reinvite(&mut self, dialog: &DialogId, options: RequestOptions) -> Result<UacId> {
        let session = self
            .dialogs
            .get_mut(dialog)
            .ok_or_else(|| Error::DialogNotFound(dialog.clone()))?
            .as_session_mut()
            .ok_or_else(|| Error::InvalidState(format!("{} is not a session dialog", dialog)))?;
        if session.reinvite_client.is_some() || session.reinvite_server.is_some() {
            return Err(Error::InvalidState("a re-INVITE is already in progress".to_string()));
        }
        let request = session
            .dialog
            .create_outgoing_request(Method::Invite, options, &self.services);
        session.on_request(&request, BodyDirection::Outbound);
        let uac = self.start_client(request, ClientRole::ReInvite, Some(dialog.clone()))?;
        let key = self.clients.get(&uac).map(|c| c.transaction.clone());
        if let Some(session) = self.dialogs.get_mut(dialog).and_then(DialogUsage::as_session_mut) {
            session.reinvite_client = key;
        }
        Ok(uac)
    }

    /// Acknowledges the 2xx to our (re-)INVITE in `dialog` (RFC 3261
    /// §13.2.2.4). Put the answer in `options.body` when the 2xx carried
    /// the offer.
    pub fn ack(&mut self, dialog: &DialogId, options: RequestOptions) -> Result<()> {
        let session = self
            .dialogs
            .get_mut(dialog)
            .ok_or_else(|| Error::DialogNotFound(dialog.clone()))?
            .as_session_mut()
            .ok_or_else(|| Error::InvalidState(format!("{} is not a session dialog", dialog)))?;
        let pending = session
            .take_ack_pending()
            .ok_or_else(|| Error::InvalidState(format!("no 2xx to acknowledge in {}", dialog)))?;

        let ack = session
            .dialog
            .create_outgoing_request(Method::Ack, options.with_cseq(pending.cseq), &self.services);
        session.on_request(&ack, BodyDirection::Outbound);
        let remote_tag = session.dialog.remote_tag.clone();

        debug!(dialog = %dialog, cseq = pending.cseq, "Sending ACK");
        match self.transactions.get_mut(&pending.transaction) {
            Some(Transaction::InviteClient(tx)) => tx.ack_response(&remote_tag, ack, &self.services),
            _ => {
                // Transaction already gone, the ACK goes out on its own
                self.services.send(ack, None);
                Ok(())
            }
        }
    }

    /// Sends PRACK for a reliable provisional response (RFC 3262 §7.2).
    pub fn prack(
        &mut self,
        dialog: &DialogId,
        response: &sipua_message::Response,
        options: RequestOptions,
    ) -> Result<UacId> {
        let requires_100rel = response
            .headers
            .get_list(names::REQUIRE)
            .iter()
            .any(|tag| tag.eq_ignore_ascii_case("100rel"));
        if !response.is_provisional() || !requires_100rel {
            return Err(Error::InvalidState(format!(
                "{} is not a reliable provisional response",
                response.status
            )));
        }
        let rseq = response
            .header(names::RSEQ)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .ok_or_else(|| Error::Protocol("reliable provisional response without RSeq".to_string()))?;
        let cseq = response
            .cseq()
            .ok_or_else(|| Error::Protocol("response without CSeq".to_string()))?;

        let options = options.with_header(names::RACK, format!("{} {} {}", rseq, cseq.seq, cseq.method));
        self.dialog_request(dialog, Method::Prack, options)
    }

    /// Cancels the INVITE behind `uac` (RFC 3261 §9.1).
    ///
    /// Before any provisional response the CANCEL is held back and sent
    /// once one arrives.
    pub fn cancel(&mut self, uac: UacId, options: RequestOptions) -> Result<()> {
        let client = self
            .clients
            .get(&uac)
            .ok_or_else(|| Error::RequestNotFound(uac.to_string()))?;
        if client.request.method != Method::Invite {
            return Err(Error::InvalidState(format!("cannot CANCEL a {}", client.request.method)));
        }
        match self.transaction_state(&client.transaction) {
            Some(TransactionState::Calling) => {
                debug!(uac = %uac, "CANCEL deferred until a provisional response");
                if let Some(client) = self.clients.get_mut(&uac) {
                    client.cancel_pending = Some(options);
                }
                Ok(())
            }
            Some(TransactionState::Proceeding) => self.send_cancel(uac, options),
            state => Err(Error::InvalidState(format!(
                "cannot CANCEL an INVITE in state {}",
                state.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string())
            ))),
        }
    }

    /// Sends CANCEL over its own non-INVITE transaction. Its responses
    /// are not reported.
    pub(super) fn send_cancel(&mut self, uac: UacId, options: RequestOptions) -> Result<()> {
        let client = self
            .clients
            .get(&uac)
            .ok_or_else(|| Error::RequestNotFound(uac.to_string()))?;
        let cancel = client.build_cancel(options)?;
        let transaction = NonInviteClientTransaction::new(cancel, &self.services)?;
        let key = transaction.key().clone();
        debug!(uac = %uac, id = %key, "Sending CANCEL");
        self.transactions
            .insert(key, Transaction::NonInviteClient(transaction));
        Ok(())
    }

    /// Sends a NOTIFY in a subscription dialog where we are the notifier.
    ///
    /// `subscription_state` is the Subscription-State value, for example
    /// `active;expires=600` or `terminated;reason=noresource`. A
    /// terminating NOTIFY ends the dialog once it completes.
    pub fn notify(&mut self, dialog: &DialogId, subscription_state: &str, options: RequestOptions) -> Result<UacId> {
        let subscription = self
            .dialogs
            .get_mut(dialog)
            .ok_or_else(|| Error::DialogNotFound(dialog.clone()))?
            .as_subscription_mut()
            .ok_or_else(|| Error::InvalidState(format!("{} is not a subscription dialog", dialog)))?;
        if subscription.role != SubscriptionRole::Notifier {
            return Err(Error::InvalidState(format!("not the notifier in {}", dialog)));
        }
        let options = options
            .with_header(names::EVENT, subscription.event.clone())
            .with_header(names::SUBSCRIPTION_STATE, subscription_state);
        let request = subscription
            .dialog
            .create_outgoing_request(Method::Notify, options, &self.services);
        let outcome = subscription.on_notify_sent(&request, &self.services)?;
        let role = if outcome.state == SubscriptionState::Terminated {
            ClientRole::EndsDialog
        } else {
            ClientRole::Generic
        };
        if outcome.changed {
            self.emit(super::UserAgentEvent::SubscriptionStateChanged {
                dialog: dialog.clone(),
                state: outcome.state,
                expires: self.subscription(dialog).and_then(|s| s.expires()),
            });
        }
        self.start_client(request, role, Some(dialog.clone()))
    }

    /// Refreshes a subscription with the Expires it was created with.
    pub fn refresh(&mut self, dialog: &DialogId) -> Result<UacId> {
        let expires = self
            .subscription(dialog)
            .ok_or_else(|| Error::DialogNotFound(dialog.clone()))?
            .requested_expires();
        self.resubscribe(dialog, expires)
    }

    /// Ends a subscription with an Expires 0 SUBSCRIBE. The dialog ends
    /// with the terminating NOTIFY that follows.
    pub fn unsubscribe(&mut self, dialog: &DialogId) -> Result<UacId> {
        self.resubscribe(dialog, 0)
    }

    fn resubscribe(&mut self, dialog: &DialogId, expires: u32) -> Result<UacId> {
        let subscription = self
            .dialogs
            .get_mut(dialog)
            .ok_or_else(|| Error::DialogNotFound(dialog.clone()))?
            .as_subscription_mut()
            .ok_or_else(|| Error::InvalidState(format!("{} is not a subscription dialog", dialog)))?;
        if subscription.role != SubscriptionRole::Subscriber {
            return Err(Error::InvalidState(format!("not the subscriber in {}", dialog)));
        }
        if subscription.state() == SubscriptionState::Terminated {
            warn!(dialog = %dialog, "Refreshing a terminated subscription");
            return Err(Error::InvalidState(format!("subscription in {} is terminated", dialog)));
        }
        let options = RequestOptions::new()
            .with_header(names::EVENT, subscription.event.clone())
            .with_header(names::EXPIRES, expires.to_string());
        let request = subscription
            .dialog
            .create_outgoing_request(Method::Subscribe, options, &self.services);
        subscription.on_refresh_sent(expires, &self.services);
        debug!(dialog = %dialog, expires, "Refreshing subscription");
        self.start_client(request, ClientRole::Refresh, Some(dialog.clone()))
    }
}
