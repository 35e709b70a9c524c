use tracing::{debug, trace};

use sipua_message::{Method, Request, Response};

use crate::error::{Error, Result};
use crate::services::Services;
use crate::timer::{TimerHandle, TimerKind};
use crate::transaction::{TransactionBase, TransactionEvent, TransactionKey, TransactionKind, TransactionState};

/// Client transaction for every method except INVITE and ACK
///
/// ```text
///            request sent, Timer F armed
///                   │
///                   ▼   1xx
///               Trying ─────────► Proceeding ──┐ 1xx
///                   │                 │ ◄──────┘
///     200-699       │                 │ 200-699
///                   ▼                 ▼
///               Completed ◄───────────┘   Timer K
///                   │
///                   ▼   Timer K
///               Terminated
/// ```
///
/// A 408 final response is reported as [`TransactionEvent::Timeout`], the
/// same way Timer F is.
#[derive(Debug)]
pub struct NonInviteClientTransaction {
    pub(crate) base: TransactionBase,
}

impl NonInviteClientTransaction {
    /// Creates the transaction, arms Timer F and sends the request.
    pub fn new(request: Request, services: &Services) -> Result<Self> {
        if request.method.is_invite_like() {
            return Err(Error::InvalidState(format!(
                "{} cannot use a non-INVITE client transaction",
                request.method
            )));
        }
        let key = TransactionKey::from_request(&request, false)
            .ok_or_else(|| Error::InvalidState("request has no Via branch".to_string()))?;

        let mut base = TransactionBase::new(TransactionKind::NonInviteClient, key, request, TransactionState::Trying);
        base.arm(TimerKind::F, services.timers().timer_f(), services);
        base.send(base.request.clone(), services);
        debug!(id = %base.key, method = %base.request.method, "Created non-INVITE client transaction");

        Ok(Self { base })
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

    pub fn method(&self) -> &Method {
        &self.base.request.method
    }

    pub fn receive_response(&mut self, response: Response, services: &Services) -> Result<Vec<TransactionEvent>> {
        let mut events = Vec::new();
        match self.base.state {
            TransactionState::Trying | TransactionState::Proceeding => {
                if response.is_provisional() {
                    if self.base.state == TransactionState::Trying {
                        self.base.transition(TransactionState::Proceeding, services, &mut events)?;
                    }
                    events.push(TransactionEvent::Response(response));
                    return Ok(events);
                }

                self.base.cancel(TimerKind::F, services);
                self.base.transition(TransactionState::Completed, services, &mut events)?;
                if response.status == 408 {
                    events.push(TransactionEvent::Timeout);
                } else {
                    events.push(TransactionEvent::Response(response));
                }
                let timer_k = services.timers().timer_k(services.reliable());
                self.base.arm_or_terminate(TimerKind::K, timer_k, services, &mut events)?;
            }
            TransactionState::Completed | TransactionState::Terminated => {
                trace!(id = %self.base.key, status = response.status, "Absorbed response retransmission");
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "non-INVITE client transaction in unexpected state {}",
                    other
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
            (TimerKind::F, TransactionState::Trying | TransactionState::Proceeding) => {
                debug!(id = %self.base.key, "Timer F fired, request timed out");
                events.push(TransactionEvent::Timeout);
                self.base.transition(TransactionState::Terminated, services, &mut events)?;
            }
            (TimerKind::K, TransactionState::Completed) => {
                self.base.transition(TransactionState::Terminated, services, &mut events)?;
            }
            (kind, state) => {
                trace!(id = %self.base.key, timer = %kind, state = %state, "Ignoring timer");
            }
        }
        Ok(events)
    }
}
