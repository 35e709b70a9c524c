//! Responses reaching our client transactions
//!
//! A response is matched to its client transaction by top Via branch and
//! CSeq method. What the transaction passes up is classified for the UAC,
//! and the UAC's role decides what happens to dialogs and subscriptions.

use tracing::{debug, error, trace, warn};

use sipua_message::{Method, Response};

use super::{UserAgentCore, UserAgentEvent};
use crate::dialog::{BodyDirection, Dialog, DialogId, DialogUsage, SessionDialog, session::PendingAck};
use crate::transaction::{
    InviteClientTransaction, NonInviteClientTransaction, Transaction, TransactionEvent, TransactionKey,
    TransactionState,
};
use crate::user_agent::{ClientRole, ResponseClass, UacId};

impl UserAgentCore {
    pub(super) fn receive_response(&mut self, response: Response) {
        let Some(key) = TransactionKey::from_response(&response) else {
            warn!(status = response.status, "Dropping response without Via branch or CSeq");
            return;
        };
        let events = match self.transactions.get_mut(&key) {
            Some(Transaction::InviteClient(tx)) => tx.receive_response(response, &self.services),
            Some(Transaction::NonInviteClient(tx)) => tx.receive_response(response, &self.services),
            _ => {
                debug!(id = %key, status = response.status, "Dropping response with no matching transaction");
                return;
            }
        };
        match events {
            Ok(events) => self.handle_client_events(&key, events),
            Err(e) => error!(id = %key, error = %e, "Client transaction failed"),
        }
    }

    /// Dispatches what a client transaction reported to its UAC.
    pub(super) fn handle_client_events(&mut self, key: &TransactionKey, events: Vec<TransactionEvent>) {
        for event in events {
            // Looked up per event, an authentication retry moves the UAC
            let uac = self.client_by_transaction.get(key).copied();
            match event {
                TransactionEvent::StateChanged(TransactionState::Proceeding) => {
                    if let Some(uac) = uac {
                        self.send_pending_cancel(uac);
                    }
                }
                TransactionEvent::StateChanged(TransactionState::Terminated) => self.client_terminated(key),
                TransactionEvent::StateChanged(_) => {}
                TransactionEvent::Response(response) => match uac {
                    Some(uac) => self.uac_response(uac, response),
                    None => trace!(id = %key, status = response.status, "Response for a request nobody waits on"),
                },
                TransactionEvent::Timeout => {
                    if let Some(uac) = uac {
                        self.uac_failure(uac, 408, "Request Timeout");
                    }
                }
                TransactionEvent::TransportError(e) => {
                    if let Some(uac) = uac {
                        warn!(uac = %uac, error = %e, "Transport error");
                        self.uac_failure(uac, 503, "Service Unavailable");
                    }
                }
                TransactionEvent::Failure(reason) => warn!(id = %key, reason = %reason, "Client transaction failure"),
            }
        }
    }

    /// Reports a timeout or transport failure as a synthesized response.
    fn uac_failure(&mut self, uac: UacId, status: u16, reason: &str) {
        let Some(client) = self.clients.get(&uac) else {
            return;
        };
        let response = Response::for_request(&client.request, status, Some(reason));
        self.uac_response(uac, response);
    }

    fn uac_response(&mut self, uac: UacId, response: Response) {
        let status = response.status;
        if (status == 401 || status == 407) && self.retry_with_credentials(uac, &response) {
            return;
        }
        let Some(class) = ResponseClass::of(status) else {
            warn!(uac = %uac, status, "Ignoring response with invalid status");
            return;
        };
        let Some(client) = self.clients.get(&uac) else {
            return;
        };
        let role = client.role.clone();
        let in_dialog = client.dialog.clone();

        let dialog = match role {
            ClientRole::Invite => self.invite_response(uac, &response),
            ClientRole::ReInvite => {
                self.reinvite_response(uac, &response);
                in_dialog.clone()
            }
            ClientRole::Generic => {
                self.exchange_response(uac, &response);
                in_dialog.clone()
            }
            _ => in_dialog.clone(),
        };

        debug!(uac = %uac, status, class = ?class, "Response received");
        let event = match class {
            ResponseClass::Trying => UserAgentEvent::Trying { uac, response: response.clone() },
            ResponseClass::Progress => UserAgentEvent::Progress {
                uac,
                dialog,
                response: response.clone(),
            },
            ResponseClass::Accept => UserAgentEvent::Accepted {
                uac,
                dialog,
                response: response.clone(),
            },
            ResponseClass::Redirect => UserAgentEvent::Redirected { uac, response: response.clone() },
            ResponseClass::Reject => UserAgentEvent::Rejected { uac, response: response.clone() },
        };
        self.emit(event);

        if !response.is_final() {
            return;
        }
        let reason = format!("{} {}", status, response.reason);
        match role {
            ClientRole::Invite if !response.is_success() => {
                let early: Vec<DialogId> = self
                    .clients
                    .get(&uac)
                    .map(|c| c.dialogs.clone())
                    .unwrap_or_default();
                for id in early {
                    if self.dialogs.get(&id).is_some_and(|d| d.dialog().early) {
                        self.terminate_dialog(&id, &reason);
                    }
                }
            }
            ClientRole::Subscribe(key) => {
                if response.is_success() {
                    if let Some(subscriber) = self.subscribers.get_mut(&key) {
                        subscriber.on_success(&response);
                    }
                } else if let Some(mut subscriber) = self.subscribers.remove(&key) {
                    subscriber.dispose(&self.services);
                    debug!(subscriber = %key, status, "Subscription refused");
                    self.emit(UserAgentEvent::SubscriptionTerminated {
                        key,
                        dialog: None,
                        reason: reason.clone(),
                    });
                }
            }
            ClientRole::Refresh => {
                let ended = in_dialog.as_ref().is_some_and(|id| {
                    self.dialogs
                        .get_mut(id)
                        .and_then(DialogUsage::as_subscription_mut)
                        .is_some_and(|s| s.on_refresh_response(&response, &self.services))
                });
                if let (true, Some(id)) = (ended, &in_dialog) {
                    self.terminate_dialog(id, &reason);
                }
            }
            ClientRole::EndsDialog => {
                if let Some(id) = &in_dialog {
                    self.terminate_dialog(id, "dialog ended locally");
                }
            }
            _ => {}
        }

        // RFC 3261 §12.2.1.2
        if status == 481 || status == 408 {
            if let Some(id) = &in_dialog {
                self.terminate_dialog(id, &reason);
            }
        }
    }

    /// Creates or confirms the session dialog a response to our INVITE
    /// establishes.
    fn invite_response(&mut self, uac: UacId, response: &Response) -> Option<DialogId> {
        let client = self.clients.get(&uac)?;
        let to_tag = response.to_tag()?;
        if response.status == 100 || !(response.is_provisional() || response.is_success()) {
            return None;
        }
        let request = client.request.clone();
        let transaction = client.transaction.clone();
        let call_id = request.call_id()?;
        let id = DialogId::new(call_id, &request.from_tag()?, &to_tag);

        if !self.dialogs.contains_key(&id) {
            let dialog = match Dialog::uac(&request, response) {
                Ok(dialog) => dialog,
                Err(e) => {
                    warn!(uac = %uac, error = %e, "Response cannot create a dialog");
                    return None;
                }
            };
            let mut session = SessionDialog::new(dialog);
            session.on_request(&request, BodyDirection::Outbound);
            self.dialogs
                .insert(id.clone(), DialogUsage::Session(session));
            if let Some(client) = self.clients.get_mut(&uac) {
                client.dialogs.push(id.clone());
            }
        }

        let session = self.dialogs.get_mut(&id).and_then(DialogUsage::as_session_mut)?;
        if response.is_success() {
            session.dialog.confirm(response);
            session.set_ack_pending(PendingAck {
                transaction,
                cseq: request.cseq().map(|c| c.seq).unwrap_or_default(),
            });
        } else {
            session.dialog.refresh_target(response.contact_uri());
        }
        session.on_response(response, BodyDirection::Inbound);
        Some(id)
    }

    fn reinvite_response(&mut self, uac: UacId, response: &Response) {
        let Some(client) = self.clients.get(&uac) else {
            return;
        };
        let transaction = client.transaction.clone();
        let cseq = client.cseq();
        let Some(session) = client
            .dialog
            .clone()
            .and_then(|id| self.dialogs.get_mut(&id))
            .and_then(DialogUsage::as_session_mut)
        else {
            return;
        };

        if response.is_provisional() {
            session.on_response(response, BodyDirection::Inbound);
            return;
        }
        if session.reinvite_client.as_ref() == Some(&transaction) {
            session.reinvite_client = None;
        }
        if response.is_success() {
            session.dialog.refresh_target(response.contact_uri());
            session.on_response(response, BodyDirection::Inbound);
            session.set_ack_pending(PendingAck { transaction, cseq });
        } else {
            session.signaling_state_rollback();
        }
    }

    /// Offer/answer carried by UPDATE and PRACK.
    fn exchange_response(&mut self, uac: UacId, response: &Response) {
        let Some(client) = self.clients.get(&uac) else {
            return;
        };
        if !matches!(client.method(), Method::Update | Method::Prack) {
            return;
        }
        let Some(session) = client
            .dialog
            .clone()
            .and_then(|id| self.dialogs.get_mut(&id))
            .and_then(DialogUsage::as_session_mut)
        else {
            return;
        };
        if response.is_success() {
            session.on_response(response, BodyDirection::Inbound);
        } else if response.is_final() {
            session.signaling_state_rollback();
        }
    }

    /// Re-sends a challenged request with credentials (RFC 3261 §22.2).
    /// Returns false when the challenge has to reach the application.
    fn retry_with_credentials(&mut self, uac: UacId, response: &Response) -> bool {
        let Some(client) = self.clients.get_mut(&uac) else {
            return false;
        };
        let Some((header, value)) = client.authorization(response, &self.services) else {
            return false;
        };
        let cseq = match client
            .dialog
            .as_ref()
            .and_then(|id| self.dialogs.get_mut(id))
        {
            Some(usage) => usage.dialog_mut().next_local_seq(),
            None => client.cseq().wrapping_add(1),
        };
        let request = client.reissue(header, value, cseq, &self.services);
        let old_key = client.transaction.clone();

        let transaction = if request.method == Method::Invite {
            let mut tx = match InviteClientTransaction::new(request.clone(), &self.services) {
                Ok(tx) => tx,
                Err(e) => {
                    warn!(uac = %uac, error = %e, "Cannot retry with credentials");
                    return false;
                }
            };
            if let Some(Transaction::InviteClient(old)) = self.transactions.get_mut(&old_key) {
                tx.adopt_ack_cache(old.take_ack_cache());
            }
            Transaction::InviteClient(tx)
        } else {
            match NonInviteClientTransaction::new(request.clone(), &self.services) {
                Ok(tx) => Transaction::NonInviteClient(tx),
                Err(e) => {
                    warn!(uac = %uac, error = %e, "Cannot retry with credentials");
                    return false;
                }
            }
        };

        let new_key = transaction.key().clone();
        debug!(uac = %uac, old = %old_key, new = %new_key, status = response.status, "Retrying with credentials");
        self.transactions.insert(new_key.clone(), transaction);
        self.client_by_transaction.remove(&old_key);
        self.client_by_transaction.insert(new_key.clone(), uac);

        let Some(client) = self.clients.get_mut(&uac) else {
            return true;
        };
        client.transaction = new_key.clone();
        match &client.role {
            ClientRole::Subscribe(key) => {
                if let Some(subscriber) = self.subscribers.get_mut(key) {
                    subscriber.update_request(request);
                }
            }
            ClientRole::ReInvite => {
                if let Some(session) = client
                    .dialog
                    .as_ref()
                    .and_then(|id| self.dialogs.get_mut(id))
                    .and_then(DialogUsage::as_session_mut)
                {
                    session.reinvite_client = Some(new_key);
                }
            }
            _ => {}
        }
        true
    }

    /// Sends the CANCEL deferred until the INVITE saw a provisional.
    fn send_pending_cancel(&mut self, uac: UacId) {
        let Some(options) = self.clients.get_mut(&uac).and_then(|c| c.cancel_pending.take()) else {
            return;
        };
        if let Err(e) = self.send_cancel(uac, options) {
            warn!(uac = %uac, error = %e, "Deferred CANCEL failed");
        }
    }

    /// Drops a terminated client transaction and, when it was the current
    /// one, its UAC.
    fn client_terminated(&mut self, key: &TransactionKey) {
        self.transactions.remove(key);
        let Some(uac) = self.client_by_transaction.remove(key) else {
            return;
        };
        let Some(client) = self.clients.remove(&uac) else {
            return;
        };
        trace!(uac = %uac, id = %key, "Request finished");
        match client.role {
            // Forks that never answered 2xx
            ClientRole::Invite => {
                for id in client.dialogs {
                    if self.dialogs.get(&id).is_some_and(|d| d.dialog().early) {
                        self.terminate_dialog(&id, "early dialog abandoned");
                    }
                }
            }
            ClientRole::ReInvite => {
                if let Some(session) = client
                    .dialog
                    .as_ref()
                    .and_then(|id| self.dialogs.get_mut(id))
                    .and_then(DialogUsage::as_session_mut)
                {
                    if session.reinvite_client.as_ref() == Some(key) {
                        session.reinvite_client = None;
                    }
                }
            }
            _ => {}
        }
    }
}
