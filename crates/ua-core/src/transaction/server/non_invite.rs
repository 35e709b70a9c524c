use tracing::{debug, trace};

use sipua_message::{Request, Response};

use crate::error::{Error, Result};
use crate::services::Services;
use crate::timer::{TimerHandle, TimerKind};
use crate::transaction::{TransactionBase, TransactionEvent, TransactionKey, TransactionKind, TransactionState};

/// Server transaction for every method except INVITE and ACK
///
/// ```text
///            request received
///                   │
///                   ▼   100 sent
///               Trying ─────────► Proceeding ──┐ 100 sent
///                   │                 │ ◄──────┘
///     200-699 sent  │                 │ 200-699 sent
///                   ▼                 ▼
///               Completed ◄───────────┘
///                   │
///                   ▼   Timer J
///               Terminated
/// ```
///
/// Request retransmissions are absorbed in Trying and answered with the last
/// response afterwards.
#[derive(Debug)]
pub struct NonInviteServerTransaction {
    pub(crate) base: TransactionBase,
    last_response: Option<Response>,
}

impl NonInviteServerTransaction {
    pub fn new(request: Request) -> Result<Self> {
        if request.method.is_invite_like() {
            return Err(Error::InvalidState(format!(
                "{} cannot use a non-INVITE server transaction",
                request.method
            )));
        }
        let key = TransactionKey::from_request(&request, true)
            .ok_or_else(|| Error::InvalidState("request has no Via branch".to_string()))?;
        debug!(id = %key, method = %request.method, "Created non-INVITE server transaction");
        Ok(Self {
            base: TransactionBase::new(TransactionKind::NonInviteServer, key, request, TransactionState::Trying),
            last_response: None,
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

    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    /// Handles a retransmission of the original request.
    pub fn receive_request(&mut self, _request: &Request, services: &Services) {
        match (self.base.state, &self.last_response) {
            (TransactionState::Proceeding | TransactionState::Completed, Some(response)) => {
                trace!(id = %self.base.key, status = response.status, "Re-sending last response");
                self.base.send(response.clone(), services);
            }
            _ => trace!(id = %self.base.key, "Absorbed request retransmission"),
        }
    }

    /// Sends a response. Only 100 is accepted as a provisional.
    pub fn respond(&mut self, response: Response, services: &Services) -> Result<Vec<TransactionEvent>> {
        let mut events = Vec::new();
        let state = self.base.state;
        if matches!(state, TransactionState::Completed | TransactionState::Terminated) {
            return Err(Error::InvalidState(format!(
                "cannot send {} from non-INVITE server transaction in {}",
                response.status, state
            )));
        }

        if response.is_provisional() {
            if response.status != 100 {
                return Err(Error::InvalidState(format!(
                    "non-INVITE transactions only send 100 as a provisional, got {}",
                    response.status
                )));
            }
            self.base.send(response.clone(), services);
            self.last_response = Some(response);
            if state == TransactionState::Trying {
                self.base.transition(TransactionState::Proceeding, services, &mut events)?;
            }
            return Ok(events);
        }

        self.base.send(response.clone(), services);
        self.last_response = Some(response);
        self.base.transition(TransactionState::Completed, services, &mut events)?;
        let timer_j = services.timers().timer_j(services.reliable());
        self.base.arm_or_terminate(TimerKind::J, timer_j, services, &mut events)?;
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
            (TimerKind::J, TransactionState::Completed) => {
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

    use sipua_message::{Message, Method};

    use super::*;
    use crate::transaction::test_support::{Harness, request, response};

    #[test]
    fn test_retransmission_absorbed_while_trying() {
        let mut harness = Harness::new(false);
        let req = request(Method::Message, "z9hG4bK1");
        let mut tx = NonInviteServerTransaction::new(req.clone()).unwrap();
        tx.receive_request(&req, &harness.services);
        assert!(harness.sent().is_empty());
        assert_eq!(tx.state(), TransactionState::Trying);
    }

    #[test]
    fn test_final_response_is_replayed() {
        let mut harness = Harness::new(false);
        let req = request(Method::Message, "z9hG4bK1");
        let mut tx = NonInviteServerTransaction::new(req.clone()).unwrap();

        let events = tx.respond(response(&req, 200, Some("a")), &harness.services).unwrap();
        assert_eq!(events, vec![TransactionEvent::StateChanged(TransactionState::Completed)]);
        let first = harness.sent();

        tx.receive_request(&req, &harness.services);
        let replay = harness.sent();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].to_bytes(), first[0].to_bytes());

        assert!(matches!(
            tx.respond(response(&req, 500, Some("a")), &harness.services),
            Err(Error::InvalidState(_))
        ));

        let mut events = Vec::new();
        for fired in harness.advance(Duration::from_secs(32)) {
            events.extend(tx.on_timer(fired.key.kind, fired.handle, &harness.services).unwrap());
        }
        assert_eq!(events, vec![TransactionEvent::StateChanged(TransactionState::Terminated)]);
    }

    #[test]
    fn test_only_100_is_a_valid_provisional() {
        let mut harness = Harness::new(false);
        let req = request(Method::Subscribe, "z9hG4bK1");
        let mut tx = NonInviteServerTransaction::new(req.clone()).unwrap();
        assert!(tx.respond(response(&req, 180, None), &harness.services).is_err());

        let events = tx.respond(response(&req, 100, None), &harness.services).unwrap();
        assert_eq!(events, vec![TransactionEvent::StateChanged(TransactionState::Proceeding)]);
        harness.sent();

        tx.receive_request(&req, &harness.services);
        let sent = harness.sent();
        assert!(matches!(&sent[0], Message::Response(r) if r.status == 100));
    }

    #[test]
    fn test_reliable_transport_skips_timer_j() {
        let harness = Harness::new(true);
        let req = request(Method::Bye, "z9hG4bK1");
        let mut tx = NonInviteServerTransaction::new(req.clone()).unwrap();
        let events = tx.respond(response(&req, 200, Some("a")), &harness.services).unwrap();
        assert_eq!(events.last(), Some(&TransactionEvent::StateChanged(TransactionState::Terminated)));
    }
}
