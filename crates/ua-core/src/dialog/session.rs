//! INVITE dialog usage
//!
//! Besides the base [`Dialog`], a session dialog tracks:
//!
//! - the offer/answer signaling state (RFC 3261 §13.2.1, RFC 3264), driven
//!   by which messages carry a session body
//! - the 2xx it sent and has not seen the ACK for yet, retransmitted at T1
//!   doubling up to T2 (RFC 3261 §13.3.1.4)
//! - pending re-INVITE transactions in either direction, for the §14.2
//!   collision rules
//!
//! ```text
//!                   outbound body                 inbound body
//!   Initial/Stable ──────────────► HaveLocalOffer ──────────────► Stable
//!   Initial/Stable ──────────────► HaveRemoteOffer ─────────────► Stable
//!                   inbound body                  outbound body
//! ```

use std::time::Duration;

use tracing::{debug, trace};

use sipua_message::{Body, Request, Response, header_names as names};

use super::{Dialog, DialogId};
use crate::services::Services;
use crate::timer::{TimerHandle, TimerKind, TimerOwner, TimerSlots};
use crate::transaction::TransactionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Initial,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

/// Which way a message travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyDirection {
    Inbound,
    Outbound,
}

/// A 2xx waiting for its ACK
#[derive(Debug)]
struct AckWait {
    response: Response,
    transaction: TransactionKey,
    interval: Duration,
}

/// A 2xx we received and still have to ACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    /// INVITE client transaction the 2xx arrived on
    pub transaction: TransactionKey,
    pub cseq: u32,
}

#[derive(Debug)]
pub struct SessionDialog {
    pub dialog: Dialog,
    signaling_state: SignalingState,
    offer: Option<Body>,
    answer: Option<Body>,
    /// Offer and answer of the last completed exchange
    rollback: Option<(Option<Body>, Option<Body>)>,
    /// CSeq of the request whose exchange reached Stable
    stable_seq: Option<u32>,
    timers: TimerSlots,
    ack_wait: Option<AckWait>,
    ack_pending: Option<PendingAck>,
    /// re-INVITE server transaction without a final response yet
    pub(crate) reinvite_server: Option<TransactionKey>,
    /// re-INVITE client transaction without a final response yet
    pub(crate) reinvite_client: Option<TransactionKey>,
}

impl SessionDialog {
    pub fn new(dialog: Dialog) -> Self {
        Self {
            timers: TimerSlots::new(TimerOwner::Dialog(dialog.id.clone())),
            dialog,
            signaling_state: SignalingState::Initial,
            offer: None,
            answer: None,
            rollback: None,
            stable_seq: None,
            ack_wait: None,
            ack_pending: None,
            reinvite_server: None,
            reinvite_client: None,
        }
    }

    pub fn id(&self) -> &DialogId {
        &self.dialog.id
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub fn offer(&self) -> Option<&Body> {
        self.offer.as_ref()
    }

    pub fn answer(&self) -> Option<&Body> {
        self.answer.as_ref()
    }

    /// Applies a message body to the signaling state.
    ///
    /// Bodies without a session disposition are ignored, as is a second
    /// offer in the direction that already has one outstanding.
    pub fn signaling_state_transition(&mut self, body: Option<&Body>, direction: BodyDirection) {
        let Some(body) = body.filter(|b| b.is_session()) else {
            return;
        };
        let next = match (self.signaling_state, direction) {
            (SignalingState::Initial | SignalingState::Stable, BodyDirection::Inbound) => {
                self.offer = Some(body.clone());
                self.answer = None;
                SignalingState::HaveRemoteOffer
            }
            (SignalingState::Initial | SignalingState::Stable, BodyDirection::Outbound) => {
                self.offer = Some(body.clone());
                self.answer = None;
                SignalingState::HaveLocalOffer
            }
            (SignalingState::HaveLocalOffer, BodyDirection::Inbound)
            | (SignalingState::HaveRemoteOffer, BodyDirection::Outbound) => {
                self.answer = Some(body.clone());
                self.rollback = Some((self.offer.clone(), self.answer.clone()));
                SignalingState::Stable
            }
            (state, direction) => {
                debug!(dialog = %self.dialog.id, state = ?state, direction = ?direction, "Dropping offer, one is already pending");
                return;
            }
        };
        trace!(dialog = %self.dialog.id, from = ?self.signaling_state, to = ?next, "Signaling state changed");
        self.signaling_state = next;
    }

    pub fn on_request(&mut self, request: &Request, direction: BodyDirection) {
        let seq = request.cseq().map(|c| c.seq);
        self.apply(request.body.as_ref(), direction, seq);
    }

    pub fn on_response(&mut self, response: &Response, direction: BodyDirection) {
        let seq = response.cseq().map(|c| c.seq);
        // The same answer repeated in a later response of the same exchange
        if self.signaling_state == SignalingState::Stable && seq.is_some() && seq == self.stable_seq {
            return;
        }
        self.apply(response.body.as_ref(), direction, seq);
    }

    fn apply(&mut self, body: Option<&Body>, direction: BodyDirection, seq: Option<u32>) {
        let before = self.signaling_state;
        self.signaling_state_transition(body, direction);
        if before != SignalingState::Stable && self.signaling_state == SignalingState::Stable {
            self.stable_seq = seq;
        }
    }

    /// Restores the offer and answer of the last completed exchange after a
    /// rejected or redirected re-offer.
    pub fn signaling_state_rollback(&mut self) {
        if !matches!(
            self.signaling_state,
            SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer
        ) {
            return;
        }
        match self.rollback.clone() {
            Some((offer, answer)) => {
                self.offer = offer;
                self.answer = answer;
                self.signaling_state = SignalingState::Stable;
            }
            None => {
                self.offer = None;
                self.answer = None;
                self.signaling_state = SignalingState::Initial;
            }
        }
        debug!(dialog = %self.dialog.id, state = ?self.signaling_state, "Signaling state rolled back");
    }

    /// Starts retransmitting a 2xx we sent until its ACK arrives.
    pub fn start_ack_wait(&mut self, response: Response, transaction: TransactionKey, services: &Services) {
        let interval = services.timers().t1;
        self.timers.arm(services.scheduler.as_ref(), TimerKind::AcceptedRetransmit, interval);
        self.ack_wait = Some(AckWait {
            response,
            transaction,
            interval,
        });
    }

    pub fn is_waiting_for_ack(&self) -> bool {
        self.ack_wait.is_some()
    }

    /// Handles an in-dialog ACK. Returns true when it acknowledged the 2xx
    /// being retransmitted.
    pub fn receive_ack(&mut self, ack: &Request, services: &Services) -> bool {
        let Some(wait) = &self.ack_wait else {
            trace!(dialog = %self.dialog.id, "ACK with nothing to acknowledge");
            return false;
        };
        let expected = wait.response.cseq().map(|c| c.seq);
        if ack.cseq().map(|c| c.seq) != expected {
            trace!(dialog = %self.dialog.id, "ACK for another INVITE");
            return false;
        }
        self.ack_wait = None;
        self.timers.cancel(services.scheduler.as_ref(), TimerKind::AcceptedRetransmit);
        self.on_request(ack, BodyDirection::Inbound);
        debug!(dialog = %self.dialog.id, "2xx acknowledged");
        true
    }

    /// Called when an INVITE server transaction of this dialog terminates.
    /// Returns true when it ended without the ACK arriving.
    pub fn on_invite_server_terminated(&mut self, transaction: &TransactionKey, services: &Services) -> bool {
        if self.reinvite_server.as_ref() == Some(transaction) {
            self.reinvite_server = None;
        }
        match &self.ack_wait {
            Some(wait) if wait.transaction == *transaction => {
                self.ack_wait = None;
                self.timers.cancel(services.scheduler.as_ref(), TimerKind::AcceptedRetransmit);
                debug!(dialog = %self.dialog.id, "No ACK before the INVITE transaction ended");
                true
            }
            _ => false,
        }
    }

    pub fn set_ack_pending(&mut self, pending: PendingAck) {
        self.ack_pending = Some(pending);
    }

    pub fn ack_pending(&self) -> Option<&PendingAck> {
        self.ack_pending.as_ref()
    }

    pub fn take_ack_pending(&mut self) -> Option<PendingAck> {
        self.ack_pending.take()
    }

    /// Status and headers for rejecting an incoming re-INVITE that collides
    /// with one already in progress (RFC 3261 §14.2).
    pub fn reinvite_rejection(&self, services: &Services) -> Option<(u16, Vec<(String, String)>)> {
        if self.reinvite_server.is_some() {
            let retry_after = services.tokens.pick(1, 10);
            return Some((500, vec![(names::RETRY_AFTER.to_string(), retry_after.to_string())]));
        }
        if self.reinvite_client.is_some() || self.signaling_state == SignalingState::HaveLocalOffer {
            return Some((491, Vec::new()));
        }
        None
    }

    pub(crate) fn on_timer(&mut self, kind: TimerKind, handle: TimerHandle, services: &Services) {
        if !self.timers.take(kind, handle) {
            return;
        }
        if kind != TimerKind::AcceptedRetransmit {
            trace!(dialog = %self.dialog.id, timer = %kind, "Ignoring timer");
            return;
        }
        let Some(wait) = self.ack_wait.as_mut() else {
            return;
        };
        trace!(dialog = %self.dialog.id, "Retransmitting 2xx");
        services.send(wait.response.clone(), None);
        wait.interval = (wait.interval * 2).min(services.timers().t2);
        let interval = wait.interval;
        self.timers.arm(services.scheduler.as_ref(), TimerKind::AcceptedRetransmit, interval);
    }

    pub fn dispose(&mut self, services: &Services) {
        self.timers.cancel_all(services.scheduler.as_ref());
        self.ack_wait = None;
        self.signaling_state = SignalingState::Closed;
        debug!(dialog = %self.dialog.id, "Session dialog disposed");
    }
}

#[cfg(test)]
mod tests {
    use sipua_message::{Message, Method};

    use super::*;
    use crate::dialog::test_support::invite_and_ok;
    use crate::transaction::test_support::{Harness, request};

    fn session() -> SessionDialog {
        let (invite, ok) = invite_and_ok();
        SessionDialog::new(Dialog::uac(&invite, &ok).unwrap())
    }

    #[test]
    fn test_offer_answer_round_trip() {
        let mut dialog = session();
        dialog.signaling_state_transition(Some(&Body::sdp("v=0 offer")), BodyDirection::Outbound);
        dialog.signaling_state_transition(Some(&Body::sdp("v=0 answer")), BodyDirection::Inbound);
        assert_eq!(dialog.signaling_state(), SignalingState::Stable);

        let offer = Body::sdp("v=0 re-offer");
        let answer = Body::sdp("v=0 re-answer");
        dialog.signaling_state_transition(Some(&offer), BodyDirection::Outbound);
        assert_eq!(dialog.signaling_state(), SignalingState::HaveLocalOffer);
        dialog.signaling_state_transition(Some(&answer), BodyDirection::Inbound);
        assert_eq!(dialog.signaling_state(), SignalingState::Stable);
        assert_eq!(dialog.answer(), Some(&answer));
        assert_eq!(dialog.offer(), Some(&offer));
    }

    #[test]
    fn test_non_session_bodies_and_second_offers_are_ignored() {
        let mut dialog = session();
        dialog.signaling_state_transition(Some(&Body::new("text/plain", "hi")), BodyDirection::Inbound);
        assert_eq!(dialog.signaling_state(), SignalingState::Initial);

        let render = Body::sdp("v=0").with_disposition("render");
        dialog.signaling_state_transition(Some(&render), BodyDirection::Inbound);
        assert_eq!(dialog.signaling_state(), SignalingState::Initial);

        let first = Body::sdp("v=0 first");
        dialog.signaling_state_transition(Some(&first), BodyDirection::Outbound);
        dialog.signaling_state_transition(Some(&Body::sdp("v=0 second")), BodyDirection::Outbound);
        assert_eq!(dialog.offer(), Some(&first));
    }

    #[test]
    fn test_rollback_restores_last_exchange() {
        let mut dialog = session();
        let offer = Body::sdp("v=0 offer");
        let answer = Body::sdp("v=0 answer");
        dialog.signaling_state_transition(Some(&offer), BodyDirection::Inbound);
        dialog.signaling_state_transition(Some(&answer), BodyDirection::Outbound);

        dialog.signaling_state_transition(Some(&Body::sdp("v=0 re-offer")), BodyDirection::Outbound);
        dialog.signaling_state_rollback();
        assert_eq!(dialog.signaling_state(), SignalingState::Stable);
        assert_eq!(dialog.offer(), Some(&offer));
        assert_eq!(dialog.answer(), Some(&answer));
    }

    #[test]
    fn test_repeated_answer_in_same_exchange_is_not_an_offer() {
        let (invite, ok) = invite_and_ok();
        let mut dialog = SessionDialog::new(Dialog::uac(&invite, &ok).unwrap());
        let invite = invite.with_body(Body::sdp("v=0 offer"));
        let ok = ok.with_body(Body::sdp("v=0 answer"));
        dialog.on_request(&invite, BodyDirection::Outbound);
        dialog.on_response(&ok, BodyDirection::Inbound);
        dialog.on_response(&ok, BodyDirection::Inbound);
        assert_eq!(dialog.signaling_state(), SignalingState::Stable);
    }

    #[test]
    fn test_2xx_retransmitted_until_ack() {
        let mut harness = Harness::new(false);
        let mut dialog = session();
        let invite = request(Method::Invite, "z9hG4bKsrv");
        let key = TransactionKey::from_request(&invite, true).unwrap();
        let ok = crate::transaction::test_support::response(&invite, 200, Some("a"));
        dialog.start_ack_wait(ok, key, &harness.services);

        // 0.5 + 1 + 2 + 4 + 4 seconds
        let mut sent = 0;
        for step in [500, 1000, 2000, 4000, 4000] {
            for fired in harness.advance(Duration::from_millis(step)) {
                dialog.on_timer(fired.key.kind, fired.handle, &harness.services);
            }
            sent += harness.sent().len();
        }
        assert_eq!(sent, 5);

        let mut ack = request(Method::Ack, "z9hG4bKack");
        ack.headers.set("CSeq", "314159 ACK");
        assert!(dialog.receive_ack(&ack, &harness.services));
        assert!(!dialog.is_waiting_for_ack());
        assert_eq!(harness.scheduler.pending(), 0);
        assert!(!dialog.receive_ack(&ack, &harness.services));
    }

    #[test]
    fn test_ack_timeout_reported_on_transaction_end() {
        let harness = Harness::new(false);
        let mut dialog = session();
        let invite = request(Method::Invite, "z9hG4bKsrv");
        let key = TransactionKey::from_request(&invite, true).unwrap();
        let ok = crate::transaction::test_support::response(&invite, 200, Some("a"));
        dialog.start_ack_wait(ok, key.clone(), &harness.services);
        assert!(dialog.on_invite_server_terminated(&key, &harness.services));
        assert!(!dialog.on_invite_server_terminated(&key, &harness.services));
    }

    #[test]
    fn test_reinvite_collision_statuses() {
        let mut harness = Harness::new(false);
        let mut dialog = session();
        assert_eq!(dialog.reinvite_rejection(&harness.services), None);

        dialog.reinvite_server = Some(TransactionKey::new("z9hG4bKs", Method::Invite, true));
        let (status, headers) = dialog.reinvite_rejection(&harness.services).unwrap();
        assert_eq!(status, 500);
        assert_eq!(headers, vec![("Retry-After".to_string(), "1".to_string())]);

        dialog.reinvite_server = None;
        dialog.reinvite_client = Some(TransactionKey::new("z9hG4bKc", Method::Invite, false));
        assert_eq!(dialog.reinvite_rejection(&harness.services).map(|r| r.0), Some(491));
        assert!(harness.sent().iter().all(|m| !matches!(m, Message::Request(_))));
    }
}
