//! Timers for transactions, dialogs and subscriptions
//!
//! RFC 3261 §17 drives every transaction state machine with named timers.
//! The core never sleeps itself: entities ask a [`Scheduler`] to arm a
//! [`TimerKey`] and the driver later feeds the firing back through
//! [`UserAgentCore::on_timer`](crate::UserAgentCore::on_timer).
//!
//! ## Timer table
//!
//! | Timer | Purpose                                   | Value                 |
//! |-------|-------------------------------------------|-----------------------|
//! | B     | INVITE client transaction timeout         | 64·T1                 |
//! | D     | wait for response retransmissions         | 32 s / 0 reliable     |
//! | F     | non-INVITE client transaction timeout     | 64·T1                 |
//! | H     | wait for ACK after a non-2xx final        | 64·T1                 |
//! | I     | absorb ACK retransmissions                | T4 / 0 reliable       |
//! | J     | absorb request retransmissions            | 64·T1 / 0 reliable    |
//! | K     | absorb response retransmissions           | T4 / 0 reliable       |
//! | L     | accepted INVITE server transaction        | 64·T1                 |
//! | M     | accepted INVITE client transaction        | 64·T1                 |
//! | N     | wait for the NOTIFY after a SUBSCRIBE     | 64·T1                 |
//!
//! Timers A, E and G (request/response retransmission over unreliable
//! transports) are not armed.
//!
//! ## Stale firings
//!
//! Cancelling is best effort: a firing may already be queued when the owner
//! cancels or re-arms. Every arm returns a fresh [`TimerHandle`] and owners
//! keep only the latest handle per [`TimerKind`] in [`TimerSlots`], so a
//! firing whose handle no longer matches is ignored.

mod scheduler;

pub use scheduler::{ManualScheduler, TokioScheduler};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::dialog::{DialogId, SubscriberKey};
use crate::transaction::TransactionKey;

/// Base timer values (RFC 3261 §17.1.1.1 and Table 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    /// Round-trip time estimate
    pub t1: Duration,
    /// Maximum retransmission interval for non-INVITE requests and INVITE responses
    pub t2: Duration,
    /// Maximum duration a message remains in the network
    pub t4: Duration,
    /// Interval for re-sending the last reliable-less provisional response
    pub provisional_interval: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            provisional_interval: Duration::from_secs(60),
        }
    }
}

impl TimerSettings {
    fn sixty_four_t1(&self) -> Duration {
        self.t1 * 64
    }

    pub fn timer_b(&self) -> Duration {
        self.sixty_four_t1()
    }

    pub fn timer_d(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { Duration::from_secs(32) }
    }

    pub fn timer_f(&self) -> Duration {
        self.sixty_four_t1()
    }

    pub fn timer_h(&self) -> Duration {
        self.sixty_four_t1()
    }

    pub fn timer_i(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { self.t4 }
    }

    pub fn timer_j(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { self.sixty_four_t1() }
    }

    pub fn timer_k(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { self.t4 }
    }

    pub fn timer_l(&self) -> Duration {
        self.sixty_four_t1()
    }

    pub fn timer_m(&self) -> Duration {
        self.sixty_four_t1()
    }

    pub fn timer_n(&self) -> Duration {
        self.sixty_four_t1()
    }
}

/// The purpose a timer was armed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    B,
    D,
    F,
    H,
    I,
    J,
    K,
    L,
    M,
    N,
    /// Periodic re-send of the last provisional INVITE response
    ProvisionalRetransmit,
    /// 2xx retransmission while waiting for the ACK
    AcceptedRetransmit,
    /// Subscription refresh at 90 % of the expiration
    SubscriptionRefresh,
    /// Subscription expiration without refresh
    SubscriptionExpire,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::ProvisionalRetransmit => write!(f, "ProvisionalRetransmit"),
            TimerKind::AcceptedRetransmit => write!(f, "AcceptedRetransmit"),
            TimerKind::SubscriptionRefresh => write!(f, "SubscriptionRefresh"),
            TimerKind::SubscriptionExpire => write!(f, "SubscriptionExpire"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// The entity a timer belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerOwner {
    Transaction(TransactionKey),
    Dialog(DialogId),
    Subscriber(SubscriberKey),
}

impl fmt::Display for TimerOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerOwner::Transaction(key) => write!(f, "{}", key),
            TimerOwner::Dialog(id) => write!(f, "dialog {}", id),
            TimerOwner::Subscriber(key) => write!(f, "subscriber {}", key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub owner: TimerOwner,
    pub kind: TimerKind,
}

impl TimerKey {
    pub fn new(owner: TimerOwner, kind: TimerKind) -> Self {
        Self { owner, kind }
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timer {} for {}", self.kind, self.owner)
    }
}

/// Identifies one arming of a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

/// A timer that elapsed, as delivered back to the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub key: TimerKey,
    pub handle: TimerHandle,
}

/// Arms and cancels one-shot timers
pub trait Scheduler: Send + Sync {
    /// Arms a one-shot timer. The firing is delivered as a [`TimerFired`]
    /// carrying the returned handle.
    fn arm(&self, key: TimerKey, after: Duration) -> TimerHandle;

    /// Cancels a pending timer. Unknown or already fired handles are ignored.
    fn cancel(&self, handle: TimerHandle);
}

/// The armed timers of one entity, at most one per [`TimerKind`]
#[derive(Debug)]
pub struct TimerSlots {
    owner: TimerOwner,
    handles: HashMap<TimerKind, TimerHandle>,
}

impl TimerSlots {
    pub fn new(owner: TimerOwner) -> Self {
        Self {
            owner,
            handles: HashMap::new(),
        }
    }

    /// Arms `kind`, replacing any timer already armed for the same purpose.
    pub fn arm(&mut self, scheduler: &dyn Scheduler, kind: TimerKind, after: Duration) {
        self.cancel(scheduler, kind);
        let key = TimerKey::new(self.owner.clone(), kind);
        trace!(timer = %key, after_ms = after.as_millis() as u64, "Arming timer");
        let handle = scheduler.arm(key, after);
        self.handles.insert(kind, handle);
    }

    pub fn cancel(&mut self, scheduler: &dyn Scheduler, kind: TimerKind) {
        if let Some(handle) = self.handles.remove(&kind) {
            scheduler.cancel(handle);
        }
    }

    pub fn cancel_all(&mut self, scheduler: &dyn Scheduler) {
        for (_, handle) in self.handles.drain() {
            scheduler.cancel(handle);
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.handles.contains_key(&kind)
    }

    /// Consumes a firing. Returns false when the firing is stale.
    pub fn take(&mut self, kind: TimerKind, handle: TimerHandle) -> bool {
        match self.handles.get(&kind) {
            Some(current) if *current == handle => {
                self.handles.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timer_values() {
        let timers = TimerSettings::default();
        assert_eq!(timers.timer_b(), Duration::from_secs(32));
        assert_eq!(timers.timer_f(), Duration::from_secs(32));
        assert_eq!(timers.timer_d(false), Duration::from_secs(32));
        assert_eq!(timers.timer_d(true), Duration::ZERO);
        assert_eq!(timers.timer_i(false), Duration::from_secs(5));
        assert_eq!(timers.timer_j(false), Duration::from_secs(32));
        assert_eq!(timers.timer_k(false), Duration::from_secs(5));
        assert_eq!(timers.timer_k(true), Duration::ZERO);
        assert_eq!(timers.provisional_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_slots_keep_one_handle_per_kind() {
        let scheduler = ManualScheduler::new();
        let owner = TimerOwner::Dialog(DialogId::new("c", "l", "r"));
        let mut slots = TimerSlots::new(owner);

        slots.arm(&scheduler, TimerKind::N, Duration::from_secs(1));
        slots.arm(&scheduler, TimerKind::N, Duration::from_secs(2));
        assert_eq!(scheduler.pending(), 1);

        let mut fired = Vec::new();
        scheduler.advance(Duration::from_secs(5), |f| fired.push(f));
        assert_eq!(fired.len(), 1);
        assert!(slots.take(TimerKind::N, fired[0].handle));
        assert!(!slots.take(TimerKind::N, fired[0].handle));
    }

    #[test]
    fn test_stale_handle_is_ignored() {
        let scheduler = ManualScheduler::new();
        let mut slots = TimerSlots::new(TimerOwner::Dialog(DialogId::new("c", "l", "r")));
        slots.arm(&scheduler, TimerKind::AcceptedRetransmit, Duration::from_millis(500));
        assert!(!slots.take(TimerKind::AcceptedRetransmit, TimerHandle(u64::MAX)));
        assert!(slots.is_armed(TimerKind::AcceptedRetransmit));
    }
}
