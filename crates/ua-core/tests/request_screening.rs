mod common;

use common::{Agent, BOB, bob_config, incoming};
use sipua_core::{ResponseOptions, UserAgentEvent};
use sipua_message::{Message, Method, Response, header_names as names};

fn bob() -> Agent {
    Agent::new(bob_config().with_delegated_method(Method::Message), "b")
}

fn only_response(agent: &mut Agent) -> Response {
    let mut responses = agent.take_responses();
    assert_eq!(responses.len(), 1, "expected exactly one response");
    responses.remove(0)
}

#[test]
fn test_unknown_method_gets_405_with_allow() {
    let mut bob = bob();
    bob.core
        .receive_message(Message::Request(incoming(Method::Publish, BOB, "z9hG4bKpub")));

    let response = only_response(&mut bob);
    assert_eq!(response.status, 405);
    let allow = response.header(names::ALLOW).expect("Allow");
    assert!(allow.contains("INVITE"));
    assert!(!allow.contains("PUBLISH"));
    assert!(bob.take_events().is_empty());
    // Stateless: nothing to absorb retransmissions
    assert_eq!(bob.core.transaction_count(), 0);
}

#[test]
fn test_unsupported_scheme_gets_416() {
    let mut bob = bob();
    bob.core.receive_message(Message::Request(incoming(
        Method::Message,
        "http://biloxi.com/bob",
        "z9hG4bKhttp",
    )));
    assert_eq!(only_response(&mut bob).status, 416);
}

#[test]
fn test_foreign_user_gets_404() {
    let mut bob = bob();
    bob.core.receive_message(Message::Request(incoming(
        Method::Message,
        "sip:carol@biloxi.com",
        "z9hG4bKcarol",
    )));
    assert_eq!(only_response(&mut bob).status, 404);

    // Addressed to the contact instead of the AOR
    bob.core.receive_message(Message::Request(incoming(
        Method::Message,
        "sip:bob@192.0.2.20",
        "z9hG4bKcontact",
    )));
    assert!(bob.take_responses().is_empty());
    assert!(matches!(bob.next_event(), UserAgentEvent::IncomingRequest { .. }));
}

#[test]
fn test_max_forwards_exhausted_gets_483() {
    let mut bob = bob();
    let mut request = incoming(Method::Message, BOB, "z9hG4bKloop");
    request.headers.set(names::MAX_FORWARDS, "0");
    bob.core.receive_message(Message::Request(request));
    assert_eq!(only_response(&mut bob).status, 483);

    // OPTIONS is still answered
    let mut options = incoming(Method::Options, BOB, "z9hG4bKping");
    options.headers.set(names::MAX_FORWARDS, "0");
    bob.core.receive_message(Message::Request(options));
    assert_eq!(only_response(&mut bob).status, 200);
}

#[test]
fn test_options_answered_with_capabilities() {
    let mut bob = bob();
    bob.core
        .receive_message(Message::Request(incoming(Method::Options, BOB, "z9hG4bKopt")));

    let response = only_response(&mut bob);
    assert_eq!(response.status, 200);
    assert!(response.header(names::ALLOW).is_some());
    assert_eq!(response.header(names::ACCEPT), Some("application/sdp"));
    assert_eq!(response.header(names::SUPPORTED), Some("100rel"));
    assert!(bob.take_events().is_empty());
}

#[test]
fn test_unknown_dialog_gets_481() {
    let mut bob = bob();
    let mut request = incoming(Method::Message, BOB, "z9hG4bKlost");
    request.headers.set(names::TO, format!("<{}>;tag=gone", BOB));
    bob.core.receive_message(Message::Request(request));

    let response = only_response(&mut bob);
    assert_eq!(response.status, 481);
    assert_eq!(response.to_tag().as_deref(), Some("gone"));
    assert!(bob.take_events().is_empty());
}

#[test]
fn test_merged_request_gets_482() {
    let mut bob = bob();
    bob.core
        .receive_message(Message::Request(incoming(Method::Message, BOB, "z9hG4bKfirst")));
    let UserAgentEvent::IncomingRequest { uas, .. } = bob.next_event() else {
        panic!("expected the MESSAGE");
    };

    // Same request forked along another path
    let mut forked = incoming(Method::Message, BOB, "z9hG4bKsecond");
    forked.headers.set(names::CALL_ID, "call-z9hG4bKfirst");
    bob.core.receive_message(Message::Request(forked));
    assert_eq!(only_response(&mut bob).status, 482);
    assert!(bob.take_events().is_empty());

    bob.core.accept(uas, 200, ResponseOptions::new()).unwrap();
    assert_eq!(only_response(&mut bob).status, 200);
}

#[test]
fn test_retransmission_absorbed_by_transaction() {
    let mut bob = bob();
    let request = incoming(Method::Message, BOB, "z9hG4bKretx");
    bob.core.receive_message(Message::Request(request.clone()));
    let UserAgentEvent::IncomingRequest { uas, .. } = bob.next_event() else {
        panic!("expected the MESSAGE");
    };
    bob.core.accept(uas, 200, ResponseOptions::new()).unwrap();
    let first = only_response(&mut bob);

    bob.core.receive_message(Message::Request(request));
    assert_eq!(only_response(&mut bob), first);
    assert!(bob.take_events().is_empty());
}

#[test]
fn test_undelegated_defaults() {
    let mut bob = Agent::new(bob_config(), "b");
    let cases = [
        (Method::Invite, 480),
        (Method::Subscribe, 480),
        (Method::Message, 200),
        (Method::Refer, 405),
        (Method::Info, 481),
    ];
    for (i, (method, status)) in cases.into_iter().enumerate() {
        let mut request = incoming(method.clone(), BOB, &format!("z9hG4bKdefault{}", i));
        request.headers.add(names::EVENT, "presence");
        bob.core.receive_message(Message::Request(request));
        let responses: Vec<u16> = bob
            .take_responses()
            .iter()
            .map(|r| r.status)
            .filter(|s| *s != 100)
            .collect();
        assert_eq!(responses, vec![status], "{}", method);
    }
    assert!(bob.take_events().is_empty());
}

#[test]
fn test_delegated_subscribe_without_event_gets_489() {
    let mut bob = Agent::new(bob_config().with_delegated_method(Method::Subscribe), "b");
    bob.core
        .receive_message(Message::Request(incoming(Method::Subscribe, BOB, "z9hG4bKnoevent")));
    assert_eq!(only_response(&mut bob).status, 489);
}

#[test]
fn test_garbage_is_dropped() {
    let mut bob = bob();
    bob.core.receive(b"this is not SIP\r\n\r\n");
    assert!(bob.take_sent().is_empty());
    assert!(bob.take_events().is_empty());
}
