//! Shared harness for the integration tests: cores driven by hand with a
//! manual clock and predictable tokens.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use sipua_core::{ManualScheduler, Outgoing, SequentialTokens, UserAgentCore, UserAgentCoreConfig, UserAgentEvent};
use sipua_message::{Message, Method, Request, Response, header_names as names};

pub const ALICE: &str = "sip:alice@atlanta.com";
pub const BOB: &str = "sip:bob@biloxi.com";

pub fn alice_config() -> UserAgentCoreConfig {
    UserAgentCoreConfig::new(ALICE, "sip:alice@192.0.2.10").with_via_host("192.0.2.10:5060")
}

pub fn bob_config() -> UserAgentCoreConfig {
    UserAgentCoreConfig::new(BOB, "sip:bob@192.0.2.20").with_via_host("192.0.2.20:5060")
}

pub struct Agent {
    pub core: UserAgentCore,
    pub events: mpsc::UnboundedReceiver<UserAgentEvent>,
    pub outbound: mpsc::UnboundedReceiver<Outgoing>,
    pub scheduler: Arc<ManualScheduler>,
}

impl Agent {
    pub fn new(config: UserAgentCoreConfig, token_prefix: &str) -> Self {
        sipua_core::logging::init_test_logging();
        let scheduler = Arc::new(ManualScheduler::new());
        let (core, events, outbound) = UserAgentCore::new(
            config,
            scheduler.clone(),
            Arc::new(SequentialTokens::new(token_prefix)),
        );
        Agent {
            core,
            events,
            outbound,
            scheduler,
        }
    }

    /// Everything queued for the transport so far.
    pub fn take_sent(&mut self) -> Vec<Message> {
        let mut sent = Vec::new();
        while let Ok(outgoing) = self.outbound.try_recv() {
            sent.push(outgoing.message);
        }
        sent
    }

    pub fn take_responses(&mut self) -> Vec<Response> {
        self.take_sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::Response(r) => Some(r),
                Message::Request(_) => None,
            })
            .collect()
    }

    pub fn take_events(&mut self) -> Vec<UserAgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn next_event(&mut self) -> UserAgentEvent {
        self.events.try_recv().expect("an event")
    }

    /// Moves the clock and delivers every due timer to the core.
    pub fn advance(&mut self, by: Duration) {
        let mut fired = Vec::new();
        self.scheduler.advance(by, |f| fired.push(f));
        for f in fired {
            self.core.on_timer(f);
        }
    }
}

/// Hands everything `from` queued to `to`; returns what was delivered.
pub fn deliver(from: &mut Agent, to: &mut Agent) -> Vec<Message> {
    let sent = from.take_sent();
    for message in &sent {
        to.core.receive_message(message.clone());
    }
    sent
}

/// A request from carol, who is not one of our agents.
pub fn incoming(method: Method, uri: &str, branch: &str) -> Request {
    Request::new(method.clone(), uri)
        .with_header(names::VIA, format!("SIP/2.0/UDP 192.0.2.30;branch={}", branch))
        .with_header(names::MAX_FORWARDS, "70")
        .with_header(names::TO, format!("<{}>", BOB))
        .with_header(names::FROM, "<sip:carol@chicago.com>;tag=c1")
        .with_header(names::CALL_ID, format!("call-{}", branch))
        .with_header(names::CSEQ, format!("1 {}", method))
        .with_header(names::CONTACT, "<sip:carol@192.0.2.30>")
}
