//! Subscription dialog usage (RFC 6665)
//!
//! A SUBSCRIBE (or an out-of-dialog REFER) does not create a dialog by
//! itself. Until the first NOTIFY arrives the subscribing side holds a
//! [`Subscriber`], keyed by Call-ID, From-tag and event package, with
//! Timer N running. The first matching NOTIFY turns it into a
//! [`SubscriptionDialog`].
//!
//! ```text
//!   Initial ──► NotifyWait ──► Pending ◄──► Active
//!                   │             │            │
//!                   └─────────────┴────────────┴──► Terminated
//! ```

use std::fmt;
use std::time::Duration;

use tracing::{debug, trace};

use sipua_message::{Request, Response, header_names as names, header_param};

use super::{Dialog, DialogId, DialogTimerOutcome};
use crate::error::{Error, Result};
use crate::services::Services;
use crate::timer::{TimerHandle, TimerKind, TimerOwner, TimerSlots};

/// Responses to a refresh that end the subscription (RFC 6665 §4.1.2.2)
pub const TERMINATING_REFRESH_STATUSES: &[u16] = &[404, 405, 410, 416, 480, 481, 482, 483, 484, 485, 489, 501, 604];

/// Expiration assumed when a SUBSCRIBE carries no Expires
pub const DEFAULT_SUBSCRIPTION_EXPIRES: u32 = 3600;

/// Event package of an Event header value, without parameters
pub fn event_package(value: &str) -> String {
    value.split(';').next().unwrap_or(value).trim().to_ascii_lowercase()
}

/// Identifies a subscription from the subscriber's side: Call-ID, our
/// From-tag and the event package
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberKey(String);

impl SubscriberKey {
    pub fn new(call_id: &str, from_tag: &str, event: &str) -> Self {
        Self(format!("{}{}{}", call_id, from_tag, event_package(event)))
    }

    /// Key a NOTIFY is matched with: its To-tag is our From-tag.
    pub fn for_notify(notify: &Request) -> Option<Self> {
        let call_id = notify.call_id()?;
        let to_tag = notify.to_tag()?;
        let event = notify.header(names::EVENT)?;
        Some(Self::new(call_id, &to_tag, event))
    }
}

impl fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Initial,
    NotifyWait,
    Pending,
    Active,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionRole {
    /// We sent the SUBSCRIBE/REFER and receive NOTIFYs
    Subscriber,
    /// We accepted the SUBSCRIBE/REFER and send NOTIFYs
    Notifier,
}

/// A subscription waiting for its first NOTIFY
#[derive(Debug)]
pub struct Subscriber {
    pub key: SubscriberKey,
    /// The SUBSCRIBE or REFER as last sent
    pub request: Request,
    /// Event header value
    pub event: String,
    pub requested_expires: u32,
    timers: TimerSlots,
}

impl Subscriber {
    /// Registers the subscription and arms Timer N.
    pub fn new(request: Request, event: &str, requested_expires: u32, services: &Services) -> Result<Self> {
        let call_id = request
            .call_id()
            .ok_or_else(|| Error::InvalidState("subscription request without Call-ID".to_string()))?;
        let from_tag = request
            .from_tag()
            .ok_or_else(|| Error::InvalidState("subscription request without From tag".to_string()))?;
        let key = SubscriberKey::new(call_id, &from_tag, event);
        let mut timers = TimerSlots::new(TimerOwner::Subscriber(key.clone()));
        timers.arm(services.scheduler.as_ref(), TimerKind::N, services.timers().timer_n());
        debug!(subscriber = %key, "Waiting for NOTIFY");
        Ok(Self {
            key,
            request,
            event: event.to_string(),
            requested_expires,
            timers,
        })
    }

    /// Replaces the request after an authentication retry.
    pub fn update_request(&mut self, request: Request) {
        self.request = request;
    }

    /// Takes the Expires of a 2xx into account.
    pub fn on_success(&mut self, response: &Response) {
        if let Some(expires) = response.expires() {
            self.requested_expires = self.requested_expires.min(expires);
        }
    }

    pub fn take_timer(&mut self, kind: TimerKind, handle: TimerHandle) -> bool {
        self.timers.take(kind, handle)
    }

    pub fn dispose(&mut self, services: &Services) {
        self.timers.cancel_all(services.scheduler.as_ref());
    }
}

/// What a NOTIFY did to the subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub state: SubscriptionState,
    pub changed: bool,
    /// `reason` parameter of a terminated Subscription-State
    pub reason: Option<String>,
}

#[derive(Debug)]
pub struct SubscriptionDialog {
    pub dialog: Dialog,
    pub role: SubscriptionRole,
    /// Event header value
    pub event: String,
    state: SubscriptionState,
    requested_expires: u32,
    /// Authoritative expiration in seconds, once known
    expires: Option<u32>,
    auto_refresh: bool,
    unsubscribing: bool,
    timers: TimerSlots,
}

impl SubscriptionDialog {
    /// Dialog of the subscribing side, created by the first NOTIFY.
    pub fn subscriber(dialog: Dialog, event: &str, requested_expires: u32, services: &Services) -> Self {
        Self {
            timers: TimerSlots::new(TimerOwner::Dialog(dialog.id.clone())),
            dialog,
            role: SubscriptionRole::Subscriber,
            event: event.to_string(),
            state: SubscriptionState::NotifyWait,
            requested_expires,
            expires: None,
            auto_refresh: services.config.subscription_auto_refresh,
            unsubscribing: false,
        }
    }

    /// Dialog of the notifying side, created by accepting a SUBSCRIBE/REFER.
    pub fn notifier(dialog: Dialog, event: &str, expires: u32, services: &Services) -> Self {
        let mut subscription = Self {
            timers: TimerSlots::new(TimerOwner::Dialog(dialog.id.clone())),
            dialog,
            role: SubscriptionRole::Notifier,
            event: event.to_string(),
            state: SubscriptionState::Initial,
            requested_expires: expires,
            expires: Some(expires),
            auto_refresh: false,
            unsubscribing: false,
        };
        subscription.schedule(services);
        subscription
    }

    pub fn id(&self) -> &DialogId {
        &self.dialog.id
    }

    pub fn key(&self) -> SubscriberKey {
        SubscriberKey::new(&self.dialog.call_id, &self.dialog.local_tag, &self.event)
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn expires(&self) -> Option<u32> {
        self.expires
    }

    pub fn requested_expires(&self) -> u32 {
        self.requested_expires
    }

    pub fn is_timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    /// Applies the Subscription-State of an incoming NOTIFY.
    pub fn on_notify(&mut self, notify: &Request, services: &Services) -> Result<NotifyOutcome> {
        let value = notify
            .header(names::SUBSCRIPTION_STATE)
            .ok_or_else(|| Error::Protocol("NOTIFY without Subscription-State".to_string()))?;
        let outcome = self.apply_subscription_state(value, services)?;
        debug!(dialog = %self.dialog.id, state = ?outcome.state, expires = ?self.expires, "NOTIFY processed");
        Ok(outcome)
    }

    /// Applies the Subscription-State of a NOTIFY we are sending.
    pub fn on_notify_sent(&mut self, notify: &Request, services: &Services) -> Result<NotifyOutcome> {
        let value = notify
            .header(names::SUBSCRIPTION_STATE)
            .ok_or_else(|| Error::InvalidState("NOTIFY without Subscription-State".to_string()))?;
        self.apply_subscription_state(value, services)
    }

    fn apply_subscription_state(&mut self, value: &str, services: &Services) -> Result<NotifyOutcome> {
        let token = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        let notified = header_param(value, "expires").and_then(|e| e.parse::<u32>().ok());
        let before = self.state;

        // A rejected NOTIFY leaves Timer N running
        let next = match token.as_str() {
            "active" => SubscriptionState::Active,
            "pending" => SubscriptionState::Pending,
            "terminated" => SubscriptionState::Terminated,
            other => {
                return Err(Error::Protocol(format!("unknown subscription state {:?}", other)));
            }
        };
        self.timers.cancel(services.scheduler.as_ref(), TimerKind::N);

        if next == SubscriptionState::Terminated {
            let reason = header_param(value, "reason").filter(|r| !r.is_empty());
            self.terminate(services);
            return Ok(NotifyOutcome {
                state: next,
                changed: before != next,
                reason,
            });
        }

        self.state = next;
        let limit = if self.unsubscribing { 0 } else { self.requested_expires };
        self.expires = Some(match notified {
            Some(notified) => notified.min(limit),
            None => self.expires.unwrap_or(limit).min(limit),
        });
        self.schedule(services);
        Ok(NotifyOutcome {
            state: next,
            changed: before != next,
            reason: None,
        })
    }

    /// Arms the refresh or expiration timer for the current expiration.
    fn schedule(&mut self, services: &Services) {
        let scheduler = services.scheduler.as_ref();
        self.timers.cancel(scheduler, TimerKind::SubscriptionRefresh);
        self.timers.cancel(scheduler, TimerKind::SubscriptionExpire);
        let Some(expires) = self.expires else {
            return;
        };
        if self.unsubscribing {
            return;
        }
        if self.auto_refresh && self.role == SubscriptionRole::Subscriber && expires > 0 {
            let after = Duration::from_millis(u64::from(expires) * 900);
            self.timers.arm(scheduler, TimerKind::SubscriptionRefresh, after);
        } else {
            let after = Duration::from_secs(u64::from(expires));
            self.timers.arm(scheduler, TimerKind::SubscriptionExpire, after);
        }
    }

    /// Records an outgoing (re)SUBSCRIBE with the given Expires and arms
    /// Timer N.
    pub fn on_refresh_sent(&mut self, expires: u32, services: &Services) {
        self.requested_expires = expires;
        if expires == 0 {
            self.unsubscribing = true;
            self.timers.cancel(services.scheduler.as_ref(), TimerKind::SubscriptionRefresh);
        }
        self.timers
            .arm(services.scheduler.as_ref(), TimerKind::N, services.timers().timer_n());
        trace!(dialog = %self.dialog.id, expires, "Refresh sent");
    }

    /// Handles the final response to a refresh. Returns true when the
    /// subscription ended.
    pub fn on_refresh_response(&mut self, response: &Response, services: &Services) -> bool {
        if TERMINATING_REFRESH_STATUSES.contains(&response.status) {
            debug!(dialog = %self.dialog.id, status = response.status, "Refresh rejected, subscription ends");
            self.terminate(services);
            return true;
        }
        if response.is_success() {
            if let Some(expires) = response.expires() {
                self.requested_expires = self.requested_expires.min(expires);
            }
        }
        false
    }

    /// Notifier side: a refreshing SUBSCRIBE was accepted with `expires`.
    pub fn on_refresh_accepted(&mut self, expires: u32, services: &Services) {
        self.requested_expires = expires;
        self.expires = Some(expires);
        self.schedule(services);
    }

    pub fn terminate(&mut self, services: &Services) {
        if self.state != SubscriptionState::Terminated {
            debug!(dialog = %self.dialog.id, "Subscription terminated");
        }
        self.state = SubscriptionState::Terminated;
        self.timers.cancel_all(services.scheduler.as_ref());
    }

    pub(crate) fn on_timer(
        &mut self,
        kind: TimerKind,
        handle: TimerHandle,
        services: &Services,
    ) -> Option<DialogTimerOutcome> {
        if !self.timers.take(kind, handle) {
            return None;
        }
        match kind {
            TimerKind::N => {
                debug!(dialog = %self.dialog.id, "Timer N fired, no NOTIFY for refresh");
                self.terminate(services);
                Some(DialogTimerOutcome::Terminated("Timer N expired".to_string()))
            }
            TimerKind::SubscriptionRefresh => Some(DialogTimerOutcome::Refresh),
            TimerKind::SubscriptionExpire => {
                self.terminate(services);
                Some(DialogTimerOutcome::Terminated("subscription expired".to_string()))
            }
            other => {
                trace!(dialog = %self.dialog.id, timer = %other, "Ignoring timer");
                None
            }
        }
    }

    pub fn dispose(&mut self, services: &Services) {
        self.terminate(services);
    }
}

#[cfg(test)]
mod tests {
    use sipua_message::Method;

    use super::*;
    use crate::transaction::test_support::{Harness, request};

    fn notify(state: &str) -> Request {
        // NOTIFY from the notifier: tags swapped relative to the SUBSCRIBE
        Request::new(Method::Notify, "sip:alice@pc33.atlanta.com")
            .with_header("Via", "SIP/2.0/UDP biloxi.com;branch=z9hG4bKn1")
            .with_header("From", "<sip:bob@biloxi.com>;tag=notifier")
            .with_header("To", "<sip:alice@atlanta.com>;tag=1928301774")
            .with_header("Call-ID", "a84b4c76e66710")
            .with_header("CSeq", "1 NOTIFY")
            .with_header("Contact", "<sip:bob@192.0.2.4>")
            .with_header("Event", "presence")
            .with_header("Subscription-State", state)
    }

    fn subscription(harness: &Harness) -> SubscriptionDialog {
        let notify = notify("active");
        let dialog = Dialog::uas(&notify, "1928301774").unwrap();
        SubscriptionDialog::subscriber(dialog, "presence", 3600, &harness.services)
    }

    #[test]
    fn test_subscriber_key_matches_notify() {
        let subscribe = request(Method::Subscribe, "z9hG4bK1").with_header("Event", "presence;id=7");
        let harness = Harness::new(false);
        let subscriber = Subscriber::new(subscribe, "presence;id=7", 3600, &harness.services).unwrap();
        assert_eq!(SubscriberKey::for_notify(&notify("active")), Some(subscriber.key.clone()));
        assert_eq!(harness.scheduler.armed()[0].0.kind, TimerKind::N);
    }

    #[test]
    fn test_active_notify_takes_smaller_expiration() {
        let harness = Harness::new(false);
        let mut sub = subscription(&harness);
        let outcome = sub.on_notify(&notify("active;expires=1800"), &harness.services).unwrap();
        assert_eq!(outcome.state, SubscriptionState::Active);
        assert!(outcome.changed);
        assert_eq!(sub.expires(), Some(1800));
        // 90 % of 1800 s
        let armed = harness.scheduler.armed();
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].0.kind, TimerKind::SubscriptionRefresh);
        assert_eq!(armed[0].1, Duration::from_secs(1620));
    }

    #[test]
    fn test_pending_then_terminated() {
        let harness = Harness::new(false);
        let mut sub = subscription(&harness);
        let outcome = sub.on_notify(&notify("pending"), &harness.services).unwrap();
        assert_eq!(outcome.state, SubscriptionState::Pending);
        assert_eq!(sub.expires(), Some(3600));

        let outcome = sub
            .on_notify(&notify("terminated;reason=noresource"), &harness.services)
            .unwrap();
        assert_eq!(outcome.state, SubscriptionState::Terminated);
        assert_eq!(outcome.reason.as_deref(), Some("noresource"));
        assert_eq!(harness.scheduler.pending(), 0);
    }

    #[test]
    fn test_expiration_without_auto_refresh() {
        let harness = Harness::new(false);
        let mut sub = subscription(&harness);
        sub.auto_refresh = false;
        sub.on_notify(&notify("active;expires=60"), &harness.services).unwrap();
        let mut outcome = None;
        for fired in harness.advance(Duration::from_secs(60)) {
            outcome = sub.on_timer(fired.key.kind, fired.handle, &harness.services);
        }
        assert_eq!(outcome, Some(DialogTimerOutcome::Terminated("subscription expired".to_string())));
        assert_eq!(sub.state(), SubscriptionState::Terminated);
    }

    #[test]
    fn test_refresh_errors_terminate() {
        let harness = Harness::new(false);
        let mut sub = subscription(&harness);
        sub.on_notify(&notify("active"), &harness.services).unwrap();
        let refresh = request(Method::Subscribe, "z9hG4bK2");
        assert!(!sub.on_refresh_response(&Response::for_request(&refresh, 500, None), &harness.services));
        assert!(sub.on_refresh_response(&Response::for_request(&refresh, 481, None), &harness.services));
        assert_eq!(sub.state(), SubscriptionState::Terminated);
    }

    #[test]
    fn test_timer_n_after_refresh() {
        let harness = Harness::new(false);
        let mut sub = subscription(&harness);
        sub.on_notify(&notify("active"), &harness.services).unwrap();
        sub.on_refresh_sent(0, &harness.services);
        assert!(sub.is_timer_armed(TimerKind::N));
        assert!(!sub.is_timer_armed(TimerKind::SubscriptionRefresh));

        let mut outcome = None;
        for fired in harness.advance(Duration::from_secs(32)) {
            outcome = sub.on_timer(fired.key.kind, fired.handle, &harness.services);
        }
        assert!(matches!(outcome, Some(DialogTimerOutcome::Terminated(_))));
    }

    #[test]
    fn test_unknown_state_is_a_protocol_error() {
        let harness = Harness::new(false);
        let mut sub = subscription(&harness);
        assert!(matches!(
            sub.on_notify(&notify("sleeping"), &harness.services),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_rejected_notify_keeps_timer_n() {
        let harness = Harness::new(false);
        let mut sub = subscription(&harness);
        sub.on_notify(&notify("active"), &harness.services).unwrap();
        sub.on_refresh_sent(3600, &harness.services);
        assert!(sub.is_timer_armed(TimerKind::N));

        assert!(sub.on_notify(&notify("bogus"), &harness.services).is_err());
        assert!(sub.is_timer_armed(TimerKind::N));
        assert_eq!(sub.state(), SubscriptionState::Active);

        // Still times out when no valid NOTIFY follows
        let mut outcome = None;
        for fired in harness.advance(Duration::from_secs(32)) {
            if let Some(o) = sub.on_timer(fired.key.kind, fired.handle, &harness.services) {
                outcome = Some(o);
            }
        }
        assert!(matches!(outcome, Some(DialogTimerOutcome::Terminated(_))));
    }
}
