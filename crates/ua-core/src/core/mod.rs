//! The user-agent core
//!
//! [`UserAgentCore`] owns every registry (transactions, dialogs, pending
//! subscriptions, UACs and UASs) and routes each incoming message, timer and
//! transport failure to the state machine it belongs to.
//!
//! ## Layout
//!
//! The implementation is split by concern, like a manager with several
//! `impl` blocks:
//!
//! - [`message_routing`]: screening and dispatch of incoming requests
//! - [`response_handling`]: responses reaching our client transactions
//! - [`request_operations`]: requests the application sends
//! - [`response_lifecycle`]: responses the application sends
//! - [`transaction_integration`]: timers, transport failures and
//!   transaction termination
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use sipua_core::{ManualScheduler, SequentialTokens, UserAgentCore, UserAgentCoreConfig};
//!
//! let config = UserAgentCoreConfig::new("sip:alice@atlanta.com", "sip:alice@192.0.2.10");
//! let (core, _events, _outbound) = UserAgentCore::new(
//!     config,
//!     Arc::new(ManualScheduler::new()),
//!     Arc::new(SequentialTokens::default()),
//! );
//! assert_eq!(core.dialog_count(), 0);
//! ```

pub mod events;
mod message_routing;
mod request_operations;
mod response_handling;
mod response_lifecycle;
mod transaction_integration;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use sipua_message::{Method, Request, Response};

use crate::config::UserAgentCoreConfig;
use crate::dialog::{DialogId, DialogUsage, SessionDialog, Subscriber, SubscriberKey, SubscriptionDialog};
use crate::error::{Error, Result};
use crate::services::{Outgoing, Services};
use crate::timer::Scheduler;
use crate::tokens::TokenGenerator;
use crate::transaction::{
    InviteClientTransaction, InviteServerTransaction, NonInviteClientTransaction, NonInviteServerTransaction,
    Transaction, TransactionEvent, TransactionKey, TransactionState,
};
use crate::user_agent::{ClientRole, ServerRole, UacId, UasId, UserAgentClient, UserAgentServer};
pub use events::UserAgentEvent;

/// Transaction, dialog and UAC/UAS engine
///
/// All methods take `&mut self` and run to completion: arming timers and
/// queueing outgoing messages happens inside the call, the results of those
/// (timer firings, send failures) come back through [`on_timer`] and
/// [`on_transport_error`].
///
/// [`on_timer`]: UserAgentCore::on_timer
/// [`on_transport_error`]: UserAgentCore::on_transport_error
pub struct UserAgentCore {
    services: Services,
    events: mpsc::UnboundedSender<UserAgentEvent>,
    transactions: HashMap<TransactionKey, Transaction>,
    dialogs: HashMap<DialogId, DialogUsage>,
    subscribers: HashMap<SubscriberKey, Subscriber>,
    clients: HashMap<UacId, UserAgentClient>,
    servers: HashMap<UasId, UserAgentServer>,
    client_by_transaction: HashMap<TransactionKey, UacId>,
    server_by_transaction: HashMap<TransactionKey, UasId>,
    next_id: u64,
}

impl UserAgentCore {
    /// Creates a core together with its event stream and outbound queue.
    pub fn new(
        config: UserAgentCoreConfig,
        scheduler: Arc<dyn Scheduler>,
        tokens: Arc<dyn TokenGenerator>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<UserAgentEvent>,
        mpsc::UnboundedReceiver<Outgoing>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        info!(aor = %config.aor, "Creating user agent core");
        let core = Self {
            services: Services::new(Arc::new(config), scheduler, tokens, outbound_tx),
            events: events_tx,
            transactions: HashMap::new(),
            dialogs: HashMap::new(),
            subscribers: HashMap::new(),
            clients: HashMap::new(),
            servers: HashMap::new(),
            client_by_transaction: HashMap::new(),
            server_by_transaction: HashMap::new(),
            next_id: 0,
        };
        (core, events_rx, outbound_rx)
    }

    pub fn config(&self) -> &UserAgentCoreConfig {
        &self.services.config
    }

    pub fn dialog(&self, id: &DialogId) -> Option<&DialogUsage> {
        self.dialogs.get(id)
    }

    pub fn session(&self, id: &DialogId) -> Option<&SessionDialog> {
        self.dialogs.get(id).and_then(DialogUsage::as_session)
    }

    pub fn subscription(&self, id: &DialogId) -> Option<&SubscriptionDialog> {
        self.dialogs.get(id).and_then(DialogUsage::as_subscription)
    }

    pub fn dialog_ids(&self) -> Vec<DialogId> {
        self.dialogs.keys().cloned().collect()
    }

    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }

    pub fn subscriber(&self, key: &SubscriberKey) -> Option<&Subscriber> {
        self.subscribers.get(key)
    }

    pub fn transaction(&self, key: &TransactionKey) -> Option<&Transaction> {
        self.transactions.get(key)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn client(&self, id: UacId) -> Option<&UserAgentClient> {
        self.clients.get(&id)
    }

    pub fn server(&self, id: UasId) -> Option<&UserAgentServer> {
        self.servers.get(&id)
    }

    /// Disposes every dialog, subscription, transaction, UAC and UAS.
    ///
    /// Timers are cancelled and no events are emitted.
    pub fn dispose(&mut self) {
        info!(
            dialogs = self.dialogs.len(),
            transactions = self.transactions.len(),
            "Disposing user agent core"
        );
        for transaction in self.transactions.values_mut() {
            transaction.dispose(&self.services);
        }
        for usage in self.dialogs.values_mut() {
            usage.dispose(&self.services);
        }
        for subscriber in self.subscribers.values_mut() {
            subscriber.dispose(&self.services);
        }
        self.transactions.clear();
        self.dialogs.clear();
        self.subscribers.clear();
        self.clients.clear();
        self.servers.clear();
        self.client_by_transaction.clear();
        self.server_by_transaction.clear();
    }

    fn emit(&self, event: UserAgentEvent) {
        if self.events.send(event).is_err() {
            warn!("Event receiver dropped, event lost");
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Sends `request` over a new client transaction owned by a new UAC.
    fn start_client(&mut self, request: Request, role: ClientRole, dialog: Option<DialogId>) -> Result<UacId> {
        let transaction = match request.method {
            Method::Invite => Transaction::InviteClient(InviteClientTransaction::new(request.clone(), &self.services)?),
            Method::Ack => return Err(Error::InvalidState("ACK is not sent over a transaction".to_string())),
            _ => Transaction::NonInviteClient(NonInviteClientTransaction::new(request.clone(), &self.services)?),
        };
        let key = transaction.key().clone();
        let id = UacId(self.next_id());
        debug!(uac = %id, id = %key, method = %request.method, "Sending request");
        self.transactions.insert(key.clone(), transaction);
        self.client_by_transaction.insert(key.clone(), id);
        self.clients
            .insert(id, UserAgentClient::new(id, role, request, key, dialog));
        Ok(id)
    }

    /// Creates the server transaction and UAS for an incoming request. An
    /// INVITE is answered 100 Trying right away.
    fn start_server(&mut self, request: Request, role: ServerRole, dialog: Option<DialogId>) -> Result<UasId> {
        let transaction = match request.method {
            Method::Invite => Transaction::InviteServer(InviteServerTransaction::new(request.clone())?),
            _ => Transaction::NonInviteServer(NonInviteServerTransaction::new(request.clone())?),
        };
        let key = transaction.key().clone();
        let id = UasId(self.next_id());
        let is_invite = request.method == Method::Invite;
        debug!(uas = %id, id = %key, method = %request.method, "Accepted incoming request");
        self.transactions.insert(key.clone(), transaction);
        self.server_by_transaction.insert(key.clone(), id);
        self.servers
            .insert(id, UserAgentServer::new(id, role, request, key, dialog));
        if is_invite {
            self.trying(id, Default::default())?;
        }
        Ok(id)
    }

    /// Answers `request` over a server transaction that no UAS owns.
    fn respond_statefully(&mut self, request: &Request, status: u16, headers: Vec<(String, String)>) {
        let transaction = match request.method {
            Method::Invite => InviteServerTransaction::new(request.clone()).map(Transaction::InviteServer),
            _ => NonInviteServerTransaction::new(request.clone()).map(Transaction::NonInviteServer),
        };
        let transaction = match transaction {
            Ok(transaction) => transaction,
            Err(e) => {
                warn!(error = %e, "Cannot answer request");
                return;
            }
        };
        let key = transaction.key().clone();
        self.transactions.insert(key.clone(), transaction);

        let mut response = Response::for_request(request, status, None);
        if status > 100 {
            response = response.with_to_tag(&self.services.tokens.token());
        }
        for (name, value) in headers {
            response.headers.add(&name, value);
        }
        debug!(id = %key, status, method = %request.method, "Answering request");
        match self.server_transaction_respond(&key, response) {
            Ok(events) => self.handle_server_events(&key, events),
            Err(e) => error!(id = %key, error = %e, "Failed to answer request"),
        }
    }

    fn server_transaction_respond(&mut self, key: &TransactionKey, response: Response) -> Result<Vec<TransactionEvent>> {
        match self.transactions.get_mut(key) {
            Some(Transaction::InviteServer(tx)) => tx.respond(response, &self.services),
            Some(Transaction::NonInviteServer(tx)) => tx.respond(response, &self.services),
            _ => Err(Error::TransactionNotFound(key.clone())),
        }
    }

    fn transaction_state(&self, key: &TransactionKey) -> Option<TransactionState> {
        self.transactions.get(key).map(Transaction::state)
    }

    /// Removes a dialog, cancelling its timers.
    fn terminate_dialog(&mut self, id: &DialogId, reason: &str) {
        let Some(mut usage) = self.dialogs.remove(id) else {
            return;
        };
        usage.dispose(&self.services);
        debug!(dialog = %id, reason, "Dialog terminated");
        if let DialogUsage::Subscription(subscription) = &usage {
            self.emit(UserAgentEvent::SubscriptionTerminated {
                key: subscription.key(),
                dialog: Some(id.clone()),
                reason: reason.to_string(),
            });
        }
        self.emit(UserAgentEvent::DialogTerminated {
            dialog: id.clone(),
            reason: reason.to_string(),
        });
    }
}
