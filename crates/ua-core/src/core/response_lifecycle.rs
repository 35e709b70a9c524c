//! Responses the application sends
//!
//! Each operation answers the request behind a [`UasId`] with one response
//! class. What the response means for dialogs is decided by the UAS role:
//! an INVITE's 1xx/2xx creates the session dialog, a SUBSCRIBE or REFER 2xx
//! the notifier dialog.

use tracing::{debug, warn};

use sipua_message::{Method, Request, Response, header_names as names};

use super::UserAgentCore;
use crate::dialog::{
    BodyDirection, DEFAULT_SUBSCRIPTION_EXPIRES, Dialog, DialogId, DialogUsage, SessionDialog, SubscriptionDialog,
};
use crate::error::{Error, Result};
use crate::transaction::TransactionKey;
use crate::user_agent::{ResponseClass, ResponseOptions, ServerRole, UasId};

impl UserAgentCore {
    /// Sends 100 Trying. INVITEs get one automatically.
    pub fn trying(&mut self, uas: UasId, options: ResponseOptions) -> Result<()> {
        self.respond(uas, ResponseClass::Trying, 100, options).map(|_| ())
    }

    /// Sends a 101-199 response. For an INVITE the response creates (or
    /// updates) the early dialog, whose id is returned.
    pub fn progress(&mut self, uas: UasId, status: u16, options: ResponseOptions) -> Result<Option<DialogId>> {
        self.respond(uas, ResponseClass::Progress, status, options)
    }

    /// Sends a 2xx. Returns the dialog it created or confirmed, if any.
    ///
    /// An INVITE 2xx is retransmitted until the ACK arrives.
    pub fn accept(&mut self, uas: UasId, status: u16, options: ResponseOptions) -> Result<Option<DialogId>> {
        self.respond(uas, ResponseClass::Accept, status, options)
    }

    /// Sends a 3xx; put the alternatives in Contact headers.
    pub fn redirect(&mut self, uas: UasId, status: u16, options: ResponseOptions) -> Result<()> {
        self.respond(uas, ResponseClass::Redirect, status, options).map(|_| ())
    }

    /// Sends a 4xx-6xx.
    pub fn reject(&mut self, uas: UasId, status: u16, options: ResponseOptions) -> Result<()> {
        self.respond(uas, ResponseClass::Reject, status, options).map(|_| ())
    }

    fn respond(
        &mut self,
        uas: UasId,
        class: ResponseClass,
        status: u16,
        options: ResponseOptions,
    ) -> Result<Option<DialogId>> {
        let server = self
            .servers
            .get_mut(&uas)
            .ok_or_else(|| Error::RequestNotFound(uas.to_string()))?;
        let response = server.build_response(class, status, options, &self.services)?;
        let key = server.transaction.clone();
        let role = server.role;
        let request = server.request.clone();

        let events = self.server_transaction_respond(&key, response.clone())?;
        if response.is_final() {
            if let Some(server) = self.servers.get_mut(&uas) {
                server.final_sent = true;
            }
        }
        debug!(uas = %uas, status, method = %request.method, "Response sent");

        let dialog = match role {
            ServerRole::Invite => self.invite_answered(uas, &request, &response, &key),
            ServerRole::ReInvite => {
                self.reinvite_answered(uas, &response, &key);
                self.servers.get(&uas).and_then(|s| s.dialog.clone())
            }
            ServerRole::Subscribe | ServerRole::Refer => self.subscription_accepted(uas, role, &request, &response),
            ServerRole::Refresh => {
                self.refresh_accepted(uas, &request, &response);
                self.servers.get(&uas).and_then(|s| s.dialog.clone())
            }
            ServerRole::Generic => {
                self.exchange_answered(uas, &request, &response);
                self.servers.get(&uas).and_then(|s| s.dialog.clone())
            }
        };

        self.handle_server_events(&key, events);
        Ok(dialog)
    }

    /// Session dialog at the UAS (RFC 3261 §12.1.1).
    fn invite_answered(
        &mut self,
        uas: UasId,
        request: &Request,
        response: &Response,
        key: &TransactionKey,
    ) -> Option<DialogId> {
        let existing = self.servers.get(&uas).and_then(|s| s.dialog.clone());
        if !response.is_provisional() && !response.is_success() {
            if let Some(id) = existing {
                if self.dialogs.get(&id).is_some_and(|d| d.dialog().early) {
                    self.terminate_dialog(&id, &format!("{} {}", response.status, response.reason));
                }
            }
            return None;
        }
        if response.status == 100 {
            return None;
        }

        let id = match existing {
            Some(id) if self.dialogs.contains_key(&id) => id,
            _ => {
                let tag = response.to_tag()?;
                let mut dialog = match Dialog::uas(request, &tag) {
                    Ok(dialog) => dialog,
                    Err(e) => {
                        warn!(uas = %uas, error = %e, "Request cannot create a dialog");
                        return None;
                    }
                };
                dialog.early = response.is_provisional();
                let id = dialog.id.clone();
                let mut session = SessionDialog::new(dialog);
                session.on_request(request, BodyDirection::Inbound);
                self.dialogs.insert(id.clone(), DialogUsage::Session(session));
                if let Some(server) = self.servers.get_mut(&uas) {
                    server.dialog = Some(id.clone());
                }
                id
            }
        };

        let session = self.dialogs.get_mut(&id).and_then(DialogUsage::as_session_mut)?;
        session.on_response(response, BodyDirection::Outbound);
        if response.is_success() {
            if session.dialog.early {
                session.dialog.early = false;
                debug!(dialog = %id, "Early dialog confirmed");
            }
            session.start_ack_wait(response.clone(), key.clone(), &self.services);
        }
        Some(id)
    }

    fn reinvite_answered(&mut self, uas: UasId, response: &Response, key: &TransactionKey) {
        let Some(session) = self
            .servers
            .get(&uas)
            .and_then(|s| s.dialog.as_ref())
            .and_then(|id| self.dialogs.get_mut(id))
            .and_then(DialogUsage::as_session_mut)
        else {
            return;
        };
        if response.is_provisional() {
            session.on_response(response, BodyDirection::Outbound);
            return;
        }
        if session.reinvite_server.as_ref() == Some(key) {
            session.reinvite_server = None;
        }
        if response.is_success() {
            session.on_response(response, BodyDirection::Outbound);
            session.start_ack_wait(response.clone(), key.clone(), &self.services);
        } else {
            session.signaling_state_rollback();
        }
    }

    /// Notifier dialog for an accepted SUBSCRIBE or REFER (RFC 6665
    /// §4.2.1.1, RFC 3515 §2.4.4).
    fn subscription_accepted(
        &mut self,
        uas: UasId,
        role: ServerRole,
        request: &Request,
        response: &Response,
    ) -> Option<DialogId> {
        if !response.is_success() {
            return None;
        }
        let tag = response.to_tag()?;
        let dialog = match Dialog::uas(request, &tag) {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!(uas = %uas, error = %e, "Request cannot create a dialog");
                return None;
            }
        };
        let event = match role {
            ServerRole::Refer => "refer".to_string(),
            _ => request.header(names::EVENT).unwrap_or_default().trim().to_string(),
        };
        let requested = request.expires().unwrap_or(DEFAULT_SUBSCRIPTION_EXPIRES);
        let expires = response.expires().map_or(requested, |granted| granted.min(requested));

        let id = dialog.id.clone();
        let subscription = SubscriptionDialog::notifier(dialog, &event, expires, &self.services);
        debug!(dialog = %id, event = %event, expires, "Subscription accepted");
        self.dialogs
            .insert(id.clone(), DialogUsage::Subscription(subscription));
        if let Some(server) = self.servers.get_mut(&uas) {
            server.dialog = Some(id.clone());
        }
        Some(id)
    }

    fn refresh_accepted(&mut self, uas: UasId, request: &Request, response: &Response) {
        if !response.is_success() {
            return;
        }
        let Some(subscription) = self
            .servers
            .get(&uas)
            .and_then(|s| s.dialog.as_ref())
            .and_then(|id| self.dialogs.get_mut(id))
            .and_then(DialogUsage::as_subscription_mut)
        else {
            return;
        };
        let expires = response
            .expires()
            .or_else(|| request.expires())
            .unwrap_or(DEFAULT_SUBSCRIPTION_EXPIRES);
        subscription.on_refresh_accepted(expires, &self.services);
    }

    /// Offer/answer carried by an incoming UPDATE or PRACK.
    fn exchange_answered(&mut self, uas: UasId, request: &Request, response: &Response) {
        if !matches!(request.method, Method::Update | Method::Prack) || response.is_provisional() {
            return;
        }
        let Some(session) = self
            .servers
            .get(&uas)
            .and_then(|s| s.dialog.as_ref())
            .and_then(|id| self.dialogs.get_mut(id))
            .and_then(DialogUsage::as_session_mut)
        else {
            return;
        };
        if response.is_success() {
            session.on_response(response, BodyDirection::Outbound);
        } else {
            session.signaling_state_rollback();
        }
    }
}
