//! Timers, transport failures and transaction termination

use tracing::{debug, error, trace, warn};

use super::{UserAgentCore, UserAgentEvent};
use crate::config::AckTimeoutPolicy;
use crate::dialog::{DialogTimerOutcome, DialogUsage};
use crate::timer::{TimerFired, TimerKind, TimerOwner};
use crate::transaction::{TransactionEvent, TransactionKey, TransactionState};
use crate::user_agent::RequestOptions;

impl UserAgentCore {
    /// Delivers a timer firing to the transaction, dialog or pending
    /// subscription that armed it. Stale firings are ignored.
    pub fn on_timer(&mut self, fired: TimerFired) {
        let TimerFired { key, handle } = fired;
        trace!(owner = %key.owner, timer = %key.kind, "Timer fired");
        match key.owner {
            TimerOwner::Transaction(id) => {
                let Some(transaction) = self.transactions.get_mut(&id) else {
                    return;
                };
                match transaction.on_timer(key.kind, handle, &self.services) {
                    Ok(events) => self.handle_transaction_events(&id, events),
                    Err(e) => error!(id = %id, error = %e, "Transaction timer failed"),
                }
            }
            TimerOwner::Dialog(id) => {
                let Some(usage) = self.dialogs.get_mut(&id) else {
                    return;
                };
                match usage.on_timer(key.kind, handle, &self.services) {
                    Some(DialogTimerOutcome::Refresh) => {
                        if let Err(e) = self.refresh(&id) {
                            warn!(dialog = %id, error = %e, "Subscription refresh failed");
                        }
                    }
                    Some(DialogTimerOutcome::Terminated(reason)) => self.terminate_dialog(&id, &reason),
                    None => {}
                }
            }
            TimerOwner::Subscriber(subscriber_key) => {
                let fired = self
                    .subscribers
                    .get_mut(&subscriber_key)
                    .is_some_and(|s| s.take_timer(key.kind, handle));
                if !fired || key.kind != TimerKind::N {
                    return;
                }
                if let Some(mut subscriber) = self.subscribers.remove(&subscriber_key) {
                    subscriber.dispose(&self.services);
                }
                debug!(subscriber = %subscriber_key, "No NOTIFY before Timer N");
                self.emit(UserAgentEvent::SubscriptionTerminated {
                    key: subscriber_key,
                    dialog: None,
                    reason: "Timer N expired".to_string(),
                });
            }
        }
    }

    /// Reports that sending a message of transaction `key` failed.
    pub fn on_transport_error(&mut self, key: &TransactionKey, error: &str) {
        let Some(transaction) = self.transactions.get_mut(key) else {
            trace!(id = %key, error, "Transport error for a finished transaction");
            return;
        };
        let events = transaction.on_transport_error(error, &self.services);
        self.handle_transaction_events(key, events);
    }

    fn handle_transaction_events(&mut self, key: &TransactionKey, events: Vec<TransactionEvent>) {
        if key.is_server {
            self.handle_server_events(key, events);
        } else {
            self.handle_client_events(key, events);
        }
    }

    pub(super) fn handle_server_events(&mut self, key: &TransactionKey, events: Vec<TransactionEvent>) {
        for event in events {
            match event {
                TransactionEvent::StateChanged(TransactionState::Terminated) => self.server_terminated(key),
                TransactionEvent::Failure(reason) | TransactionEvent::TransportError(reason) => {
                    warn!(id = %key, reason = %reason, "Server transaction failed");
                    if let Some(uas) = self.server_by_transaction.get(key).copied() {
                        self.emit(UserAgentEvent::ServerFailure { uas, reason });
                    }
                }
                other => trace!(id = %key, event = ?other, "Server transaction event"),
            }
        }
    }

    /// Drops a terminated server transaction together with its UAS.
    ///
    /// An INVITE transaction that ends while its dialog still waits for the
    /// ACK of our 2xx is reported as an ACK timeout (RFC 3261 §13.3.1.4).
    fn server_terminated(&mut self, key: &TransactionKey) {
        self.transactions.remove(key);
        let Some(uas) = self.server_by_transaction.remove(key) else {
            return;
        };
        let Some(server) = self.servers.remove(&uas) else {
            return;
        };
        trace!(uas = %uas, id = %key, "Request finished");
        if !key.is_invite() {
            return;
        }
        let Some(id) = server.dialog else {
            return;
        };

        let ack_missing = self
            .dialogs
            .get_mut(&id)
            .and_then(DialogUsage::as_session_mut)
            .is_some_and(|session| session.on_invite_server_terminated(key, &self.services));
        if ack_missing {
            warn!(dialog = %id, "ACK never arrived");
            self.emit(UserAgentEvent::AckTimeout { dialog: id.clone() });
            if self.services.config.ack_timeout_policy == AckTimeoutPolicy::SendBye {
                if let Err(e) = self.bye(&id, RequestOptions::new()) {
                    error!(dialog = %id, error = %e, "Failed to send BYE after ACK timeout");
                }
            }
            return;
        }

        if self.dialogs.get(&id).is_some_and(|d| d.dialog().early) {
            self.terminate_dialog(&id, "INVITE ended without a final response");
        }
    }
}
