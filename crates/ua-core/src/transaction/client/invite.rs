use std::collections::{HashMap, HashSet};

use tracing::{debug, trace, warn};

use sipua_message::{Method, Request, Response, header_names as names};

use crate::error::{Error, Result};
use crate::services::Services;
use crate::timer::{TimerHandle, TimerKind};
use crate::transaction::{TransactionBase, TransactionEvent, TransactionKey, TransactionKind, TransactionState};

/// INVITE client transaction with the RFC 6026 Accepted state
///
/// ```text
///                  INVITE sent, Timer B armed
///                        │
///                        ▼      1xx
///                     Calling ──────► Proceeding ─┐ 1xx
///                     │   │               │ │ ◄───┘
///           2xx       │   │ 300-699       │ │
///        ┌────────────┘   └───────┐       │ │
///        ▼         2xx            ▼       │ │ 300-699: send ACK
///     Accepted ◄──────────────  Completed ◄─┘
///        │  ▲ 2xx (forwarded,     │  ▲ 300-699: resend ACK
///        │  │ or cached ACK)      │  │
///        │ Timer M               │ Timer D
///        ▼                        ▼
///                 Terminated
/// ```
///
/// The ACK for a non-2xx final is built and sent here. The ACK for a 2xx is
/// the dialog's job: the caller hands it back through
/// [`ack_response`](Self::ack_response) so that 2xx retransmissions carrying
/// the same To-tag are answered from the cache.
#[derive(Debug)]
pub struct InviteClientTransaction {
    pub(crate) base: TransactionBase,
    /// ACKs sent for 2xx responses, by To-tag
    acks: HashMap<String, Request>,
    /// To-tags of 2xx responses already forwarded
    accepted_tags: HashSet<String>,
    /// ACK sent for the non-2xx final response
    failure_ack: Option<Request>,
}

impl InviteClientTransaction {
    /// Creates the transaction, arms Timer B and sends the INVITE.
    pub fn new(request: Request, services: &Services) -> Result<Self> {
        if request.method != Method::Invite {
            return Err(Error::InvalidState(format!(
                "{} cannot use an INVITE client transaction",
                request.method
            )));
        }
        let key = TransactionKey::from_request(&request, false)
            .ok_or_else(|| Error::InvalidState("request has no Via branch".to_string()))?;

        let mut base = TransactionBase::new(TransactionKind::InviteClient, key, request, TransactionState::Calling);
        base.arm(TimerKind::B, services.timers().timer_b(), services);
        base.send(base.request.clone(), services);
        debug!(id = %base.key, "Created INVITE client transaction");

        Ok(Self {
            base,
            acks: HashMap::new(),
            accepted_tags: HashSet::new(),
            failure_ack: None,
        })
    }

    pub fn key(&self) -> &TransactionKey {
        &self.base.key
    }

    pub fn state(&self) -> TransactionState {
        self.base.state
    }

    pub fn request(&self) -> &Request {
        &self.base.request
    }

    /// Moves the 2xx ACK cache out, for a transaction re-created after an
    /// authentication challenge.
    pub fn take_ack_cache(&mut self) -> HashMap<String, Request> {
        std::mem::take(&mut self.acks)
    }

    pub fn adopt_ack_cache(&mut self, cache: HashMap<String, Request>) {
        self.accepted_tags.extend(cache.keys().cloned());
        self.acks.extend(cache);
    }

    /// Records and sends the ACK for the 2xx carrying `to_tag`.
    pub fn ack_response(&mut self, to_tag: &str, ack: Request, services: &Services) -> Result<()> {
        if ack.method != Method::Ack {
            return Err(Error::InvalidState(format!("expected an ACK, got {}", ack.method)));
        }
        if self.base.state != TransactionState::Accepted {
            return Err(Error::InvalidState(format!(
                "cannot ACK a 2xx while the INVITE transaction is {}",
                self.base.state
            )));
        }
        services.send(ack.clone(), None);
        self.acks.insert(to_tag.to_string(), ack);
        Ok(())
    }

    pub fn receive_response(&mut self, response: Response, services: &Services) -> Result<Vec<TransactionEvent>> {
        let mut events = Vec::new();
        let state = self.base.state;

        if response.is_provisional() {
            match state {
                TransactionState::Calling | TransactionState::Proceeding => {
                    if state == TransactionState::Calling {
                        self.base.cancel(TimerKind::B, services);
                        self.base.transition(TransactionState::Proceeding, services, &mut events)?;
                    }
                    events.push(TransactionEvent::Response(response));
                }
                _ => trace!(id = %self.base.key, status = response.status, "Ignoring late provisional"),
            }
            return Ok(events);
        }

        if response.is_success() {
            match state {
                TransactionState::Calling | TransactionState::Proceeding | TransactionState::Accepted => {
                    let tag = response.to_tag().unwrap_or_default();
                    if let Some(ack) = self.acks.get(&tag) {
                        trace!(id = %self.base.key, to_tag = %tag, "Re-sending ACK for 2xx retransmission");
                        services.send(ack.clone(), None);
                        return Ok(events);
                    }
                    if !self.accepted_tags.insert(tag.clone()) {
                        trace!(id = %self.base.key, to_tag = %tag, "2xx retransmission before ACK, absorbed");
                        return Ok(events);
                    }
                    if state != TransactionState::Accepted {
                        self.base.cancel(TimerKind::B, services);
                        self.base.transition(TransactionState::Accepted, services, &mut events)?;
                        self.base.arm(TimerKind::M, services.timers().timer_m(), services);
                    }
                    events.push(TransactionEvent::Response(response));
                }
                _ => trace!(id = %self.base.key, "Ignoring 2xx in {}", state),
            }
            return Ok(events);
        }

        match state {
            TransactionState::Calling | TransactionState::Proceeding => {
                let ack = self.build_ack(&response);
                self.base.send(ack.clone(), services);
                self.failure_ack = Some(ack);
                self.base.cancel(TimerKind::B, services);
                self.base.transition(TransactionState::Completed, services, &mut events)?;
                events.push(TransactionEvent::Response(response));
                let timer_d = services.timers().timer_d(services.reliable());
                self.base.arm_or_terminate(TimerKind::D, timer_d, services, &mut events)?;
            }
            TransactionState::Completed => match &self.failure_ack {
                Some(ack) => {
                    trace!(id = %self.base.key, "Re-sending ACK for final response retransmission");
                    self.base.send(ack.clone(), services);
                }
                None => warn!(id = %self.base.key, "Completed without a cached ACK"),
            },
            _ => trace!(id = %self.base.key, status = response.status, "Ignoring final response in {}", state),
        }
        Ok(events)
    }

    /// ACK for a non-2xx final response (RFC 3261 §17.1.1.3).
    fn build_ack(&self, response: &Response) -> Request {
        let invite = &self.base.request;
        let mut ack = Request::new(Method::Ack, invite.uri.clone());
        if let Some(via) = invite.top_via() {
            ack.headers.add(names::VIA, via);
        }
        ack.headers.add(names::MAX_FORWARDS, invite.max_forwards().unwrap_or(70).to_string());
        for name in [names::FROM, names::CALL_ID] {
            if let Some(value) = invite.header(name) {
                ack.headers.add(name, value);
            }
        }
        if let Some(to) = response.header(names::TO).or_else(|| invite.header(names::TO)) {
            ack.headers.add(names::TO, to);
        }
        let seq = invite.cseq().map(|c| c.seq).unwrap_or_default();
        ack.headers.add(names::CSEQ, format!("{} ACK", seq));
        for route in invite.headers.get_all(names::ROUTE) {
            ack.headers.add(names::ROUTE, route);
        }
        ack
    }

    pub(crate) fn on_timer(
        &mut self,
        kind: TimerKind,
        handle: TimerHandle,
        services: &Services,
    ) -> Result<Vec<TransactionEvent>> {
        let mut events = Vec::new();
        if !self.base.take_timer(kind, handle) {
            return Ok(events);
        }
        match (kind, self.base.state) {
            (TimerKind::B, TransactionState::Calling | TransactionState::Proceeding) => {
                debug!(id = %self.base.key, "Timer B fired, INVITE timed out");
                events.push(TransactionEvent::Timeout);
                self.base.transition(TransactionState::Terminated, services, &mut events)?;
            }
            (TimerKind::D, TransactionState::Completed) | (TimerKind::M, TransactionState::Accepted) => {
                self.base.transition(TransactionState::Terminated, services, &mut events)?;
            }
            (kind, state) => trace!(id = %self.base.key, timer = %kind, state = %state, "Ignoring timer"),
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sipua_message::Message;

    use super::*;
    use crate::transaction::test_support::{Harness, invite_with_offer, request, response};

    fn ack_for(invite: &Request, to_tag: &str) -> Request {
        let mut ack = request(Method::Ack, "z9hG4bKack");
        let to = response(invite, 200, Some(to_tag));
        ack.headers.set("To", to.header("To").unwrap_or_default());
        ack
    }

    #[test]
    fn test_non_2xx_is_acked_by_the_transaction() {
        let mut harness = Harness::new(false);
        let invite = invite_with_offer("z9hG4bKinv");
        let mut tx = InviteClientTransaction::new(invite.clone(), &harness.services).unwrap();
        harness.sent();

        let events = tx.receive_response(response(&invite, 486, Some("b1")), &harness.services).unwrap();
        assert_eq!(events[0], TransactionEvent::StateChanged(TransactionState::Completed));
        let sent = harness.sent();
        let Message::Request(ack) = &sent[0] else { panic!("expected ACK") };
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.uri, invite.uri);
        assert_eq!(ack.cseq().unwrap().seq, 314159);
        assert_eq!(ack.cseq().unwrap().method, Method::Ack);
        assert_eq!(ack.to_tag().as_deref(), Some("b1"));
        assert_eq!(ack.via_branch(), invite.via_branch());
        assert_eq!(ack.headers.get_all("Route").len(), 1);

        // Retransmitted final: ACK again, nothing for the user
        let events = tx.receive_response(response(&invite, 486, Some("b1")), &harness.services).unwrap();
        assert!(events.is_empty());
        assert_eq!(harness.sent(), sent);
    }

    #[test]
    fn test_2xx_moves_to_accepted_and_uses_ack_cache() {
        let mut harness = Harness::new(false);
        let invite = invite_with_offer("z9hG4bKinv");
        let mut tx = InviteClientTransaction::new(invite.clone(), &harness.services).unwrap();
        harness.sent();

        let ok = response(&invite, 200, Some("b1"));
        let events = tx.receive_response(ok.clone(), &harness.services).unwrap();
        assert_eq!(events[0], TransactionEvent::StateChanged(TransactionState::Accepted));
        assert!(harness.sent().is_empty(), "2xx must not be auto-ACKed");

        // Retransmission before the ACK exists is absorbed
        assert!(tx.receive_response(ok.clone(), &harness.services).unwrap().is_empty());

        tx.ack_response("b1", ack_for(&invite, "b1"), &harness.services).unwrap();
        assert_eq!(harness.sent().len(), 1);

        // Retransmission after the ACK re-sends it
        assert!(tx.receive_response(ok, &harness.services).unwrap().is_empty());
        assert_eq!(harness.sent().len(), 1);

        // A 2xx from another fork is forwarded
        let forked = response(&invite, 200, Some("b2"));
        let events = tx.receive_response(forked, &harness.services).unwrap();
        assert!(matches!(events[0], TransactionEvent::Response(ref r) if r.to_tag().as_deref() == Some("b2")));
    }

    #[test]
    fn test_timer_b_clears_on_first_provisional() {
        let harness = Harness::new(false);
        let invite = invite_with_offer("z9hG4bKinv");
        let mut tx = InviteClientTransaction::new(invite.clone(), &harness.services).unwrap();
        tx.receive_response(response(&invite, 180, Some("b1")), &harness.services).unwrap();
        assert_eq!(harness.scheduler.pending(), 0);
        assert_eq!(tx.state(), TransactionState::Proceeding);
    }

    #[test]
    fn test_timer_b_times_out() {
        let harness = Harness::new(false);
        let mut tx = InviteClientTransaction::new(invite_with_offer("z9hG4bKinv"), &harness.services).unwrap();
        let mut events = Vec::new();
        for fired in harness.advance(Duration::from_secs(32)) {
            events.extend(tx.on_timer(fired.key.kind, fired.handle, &harness.services).unwrap());
        }
        assert_eq!(events[0], TransactionEvent::Timeout);
        assert_eq!(tx.state(), TransactionState::Terminated);
    }

    #[test]
    fn test_timer_m_ends_accepted() {
        let harness = Harness::new(false);
        let invite = invite_with_offer("z9hG4bKinv");
        let mut tx = InviteClientTransaction::new(invite.clone(), &harness.services).unwrap();
        tx.receive_response(response(&invite, 200, Some("b1")), &harness.services).unwrap();
        for fired in harness.advance(Duration::from_secs(32)) {
            tx.on_timer(fired.key.kind, fired.handle, &harness.services).unwrap();
        }
        assert_eq!(tx.state(), TransactionState::Terminated);
    }

    #[test]
    fn test_ack_cache_moves_between_transactions() {
        let harness = Harness::new(false);
        let invite = invite_with_offer("z9hG4bKinv");
        let mut first = InviteClientTransaction::new(invite.clone(), &harness.services).unwrap();
        first.receive_response(response(&invite, 200, Some("b1")), &harness.services).unwrap();
        first.ack_response("b1", ack_for(&invite, "b1"), &harness.services).unwrap();

        let retry = invite_with_offer("z9hG4bKretry");
        let mut second = InviteClientTransaction::new(retry, &harness.services).unwrap();
        second.adopt_ack_cache(first.take_ack_cache());
        let events = second.receive_response(response(&invite, 200, Some("b1")), &harness.services).unwrap();
        assert!(events.is_empty());
    }
}
