use tracing::{debug, trace, warn};

use sipua_message::{Method, Request, Response};

use crate::error::{Error, Result};
use crate::services::Services;
use crate::timer::{TimerHandle, TimerKind};
use crate::transaction::{TransactionBase, TransactionEvent, TransactionKey, TransactionKind, TransactionState};

/// INVITE server transaction with the RFC 6026 Accepted state
///
/// ```text
///               INVITE received
///                     │
///                     ▼     1xx sent
///                 Proceeding ──┐
///            2xx sent │  │ ◄───┘
///        ┌────────────┘  └────────────┐ 300-699 sent
///        ▼                            ▼
///     Accepted ◄─┐ 2xx sent       Completed ◄─┐ INVITE: resend final
///        │  └────┘                 │  │  └────┘
///        │ Timer L          Timer H│  │ ACK
///        │                         │  ▼
///        │                         │ Confirmed
///        │                         │  │ Timer I
///        ▼                         ▼  ▼
///                   Terminated
/// ```
#[derive(Debug)]
pub struct InviteServerTransaction {
    pub(crate) base: TransactionBase,
    last_provisional: Option<Response>,
    last_final: Option<Response>,
}

impl InviteServerTransaction {
    pub fn new(request: Request) -> Result<Self> {
        if request.method != Method::Invite {
            return Err(Error::InvalidState(format!(
                "{} cannot use an INVITE server transaction",
                request.method
            )));
        }
        let key = TransactionKey::from_request(&request, true)
            .ok_or_else(|| Error::InvalidState("request has no Via branch".to_string()))?;
        debug!(id = %key, "Created INVITE server transaction");
        Ok(Self {
            base: TransactionBase::new(TransactionKind::InviteServer, key, request, TransactionState::Proceeding),
            last_provisional: None,
            last_final: None,
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

    pub fn last_final(&self) -> Option<&Response> {
        self.last_final.as_ref()
    }

    /// Handles a retransmitted INVITE or the ACK for a non-2xx final.
    pub fn receive_request(&mut self, request: &Request, services: &Services) -> Result<Vec<TransactionEvent>> {
        let mut events = Vec::new();
        let state = self.base.state;

        if request.method == Method::Ack {
            match state {
                TransactionState::Completed => {
                    self.base.cancel(TimerKind::H, services);
                    self.base.transition(TransactionState::Confirmed, services, &mut events)?;
                    let timer_i = services.timers().timer_i(services.reliable());
                    self.base.arm_or_terminate(TimerKind::I, timer_i, services, &mut events)?;
                }
                _ => trace!(id = %self.base.key, state = %state, "Absorbed ACK"),
            }
            return Ok(events);
        }

        let replay = match state {
            TransactionState::Proceeding => self.last_provisional.as_ref(),
            TransactionState::Completed => self.last_final.as_ref(),
            _ => None,
        };
        match replay {
            Some(response) => {
                trace!(id = %self.base.key, status = response.status, "Re-sending response to INVITE retransmission");
                self.base.send(response.clone(), services);
            }
            None => trace!(id = %self.base.key, state = %state, "Absorbed INVITE retransmission"),
        }
        Ok(events)
    }

    /// Sends a response supplied by the UAS.
    pub fn respond(&mut self, response: Response, services: &Services) -> Result<Vec<TransactionEvent>> {
        let mut events = Vec::new();
        match (self.base.state, response.status) {
            (TransactionState::Proceeding, 100..=199) => {
                self.base.send(response.clone(), services);
                if response.status > 100 {
                    self.base
                        .arm(TimerKind::ProvisionalRetransmit, services.timers().provisional_interval, services);
                }
                self.last_provisional = Some(response);
            }
            (TransactionState::Proceeding, 200..=299) => {
                self.base.send(response.clone(), services);
                self.base.cancel(TimerKind::ProvisionalRetransmit, services);
                self.last_final = Some(response);
                self.base.transition(TransactionState::Accepted, services, &mut events)?;
                self.base.arm(TimerKind::L, services.timers().timer_l(), services);
            }
            (TransactionState::Proceeding, _) => {
                self.base.send(response.clone(), services);
                self.base.cancel(TimerKind::ProvisionalRetransmit, services);
                self.last_final = Some(response);
                self.base.transition(TransactionState::Completed, services, &mut events)?;
                self.base.arm(TimerKind::H, services.timers().timer_h(), services);
            }
            (TransactionState::Accepted, 200..=299) => {
                self.base.send(response.clone(), services);
                self.last_final = Some(response);
            }
            (state, status) => {
                return Err(Error::InvalidState(format!(
                    "cannot send {} from INVITE server transaction in {}",
                    status, state
                )));
            }
        }
        Ok(events)
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
            (TimerKind::ProvisionalRetransmit, TransactionState::Proceeding) => {
                if let Some(response) = &self.last_provisional {
                    trace!(id = %self.base.key, status = response.status, "Refreshing provisional response");
                    self.base.send(response.clone(), services);
                    self.base
                        .arm(TimerKind::ProvisionalRetransmit, services.timers().provisional_interval, services);
                }
            }
            (TimerKind::H, TransactionState::Completed) => {
                warn!(id = %self.base.key, "Timer H fired, no ACK received");
                events.push(TransactionEvent::Failure("ACK not received before Timer H".to_string()));
                self.base.transition(TransactionState::Terminated, services, &mut events)?;
            }
            (TimerKind::I, TransactionState::Confirmed) | (TimerKind::L, TransactionState::Accepted) => {
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

    fn fire_all(harness: &Harness, tx: &mut InviteServerTransaction, by: Duration) -> Vec<TransactionEvent> {
        let mut events = Vec::new();
        for fired in harness.advance(by) {
            events.extend(tx.on_timer(fired.key.kind, fired.handle, &harness.services).unwrap());
        }
        events
    }

    #[test]
    fn test_completed_replays_exact_final_and_times_out_without_ack() {
        let mut harness = Harness::new(false);
        let invite = invite_with_offer("z9hG4bKsrv");
        let mut tx = InviteServerTransaction::new(invite.clone()).unwrap();
        assert_eq!(tx.state(), TransactionState::Proceeding);

        let events = tx.respond(response(&invite, 486, Some("a1")), &harness.services).unwrap();
        assert_eq!(events, vec![TransactionEvent::StateChanged(TransactionState::Completed)]);
        let original = harness.sent();

        tx.receive_request(&invite, &harness.services).unwrap();
        let replay = harness.sent();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].to_bytes(), original[0].to_bytes());

        let events = fire_all(&harness, &mut tx, Duration::from_secs(32));
        assert!(matches!(events[0], TransactionEvent::Failure(_)));
        assert_eq!(events[1], TransactionEvent::StateChanged(TransactionState::Terminated));
    }

    #[test]
    fn test_ack_confirms_and_timer_i_terminates() {
        let harness = Harness::new(false);
        let invite = invite_with_offer("z9hG4bKsrv");
        let mut tx = InviteServerTransaction::new(invite.clone()).unwrap();
        tx.respond(response(&invite, 603, Some("a1")), &harness.services).unwrap();

        let ack = request(Method::Ack, "z9hG4bKsrv");
        let events = tx.receive_request(&ack, &harness.services).unwrap();
        assert_eq!(events, vec![TransactionEvent::StateChanged(TransactionState::Confirmed)]);
        assert!(tx.receive_request(&ack, &harness.services).unwrap().is_empty());

        let events = fire_all(&harness, &mut tx, Duration::from_secs(5));
        assert_eq!(events, vec![TransactionEvent::StateChanged(TransactionState::Terminated)]);
    }

    #[test]
    fn test_reliable_ack_terminates_immediately() {
        let harness = Harness::new(true);
        let invite = invite_with_offer("z9hG4bKsrv");
        let mut tx = InviteServerTransaction::new(invite.clone()).unwrap();
        tx.respond(response(&invite, 480, Some("a1")), &harness.services).unwrap();
        let events = tx
            .receive_request(&request(Method::Ack, "z9hG4bKsrv"), &harness.services)
            .unwrap();
        assert_eq!(events.last(), Some(&TransactionEvent::StateChanged(TransactionState::Terminated)));
    }

    #[test]
    fn test_provisional_replayed_and_refreshed() {
        let mut harness = Harness::new(false);
        let invite = invite_with_offer("z9hG4bKsrv");
        let mut tx = InviteServerTransaction::new(invite.clone()).unwrap();
        tx.respond(response(&invite, 100, None), &harness.services).unwrap();
        assert_eq!(harness.scheduler.pending(), 0);

        tx.respond(response(&invite, 180, Some("a1")), &harness.services).unwrap();
        harness.sent();
        tx.receive_request(&invite, &harness.services).unwrap();
        let sent = harness.sent();
        assert!(matches!(&sent[0], Message::Response(r) if r.status == 180));

        fire_all(&harness, &mut tx, Duration::from_secs(60));
        assert_eq!(harness.sent().len(), 1);
        assert_eq!(harness.scheduler.pending(), 1);
    }

    #[test]
    fn test_accepted_absorbs_invite_and_sends_further_2xx() {
        let mut harness = Harness::new(false);
        let invite = invite_with_offer("z9hG4bKsrv");
        let mut tx = InviteServerTransaction::new(invite.clone()).unwrap();
        let ok = response(&invite, 200, Some("a1"));
        let events = tx.respond(ok.clone(), &harness.services).unwrap();
        assert_eq!(events, vec![TransactionEvent::StateChanged(TransactionState::Accepted)]);
        harness.sent();

        tx.receive_request(&invite, &harness.services).unwrap();
        assert!(harness.sent().is_empty());

        tx.respond(ok, &harness.services).unwrap();
        assert_eq!(harness.sent().len(), 1);
        assert!(tx.respond(response(&invite, 500, Some("a1")), &harness.services).is_err());

        let events = fire_all(&harness, &mut tx, Duration::from_secs(32));
        assert_eq!(events, vec![TransactionEvent::StateChanged(TransactionState::Terminated)]);
    }
}
