mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use common::{BOB, alice_config, bob_config};
use sipua_core::{RequestOptions, ResponseOptions, UserAgent, UserAgentEvent, UserAgentHandle};
use sipua_message::Method;
use sipua_transport::ChannelTransport;

type Running = (UserAgentHandle, UnboundedReceiver<UserAgentEvent>, tokio::task::JoinHandle<()>);

fn spawn_pair() -> (Running, Running) {
    sipua_core::logging::init_test_logging();
    let ((a, to_a), (b, to_b)) = ChannelTransport::pair(false);
    let alice = UserAgent::spawn(alice_config(), Arc::new(a), to_a).unwrap();
    let bob = UserAgent::spawn(
        bob_config().with_delegated_method(Method::Invite),
        Arc::new(b),
        to_b,
    )
    .unwrap();
    (alice, bob)
}

async fn next(events: &mut UnboundedReceiver<UserAgentEvent>) -> UserAgentEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("driver running")
}

#[tokio::test]
async fn test_options_over_channel_transport() {
    let ((alice, mut alice_events, _a), (bob, _bob_events, _b)) = spawn_pair();

    let uac = alice
        .with_core(|core| core.request(Method::Options, BOB, RequestOptions::new()))
        .await
        .unwrap()
        .unwrap();

    match next(&mut alice_events).await {
        UserAgentEvent::Accepted { uac: id, response, .. } => {
            assert_eq!(id, uac);
            assert_eq!(response.status, 200);
        }
        other => panic!("unexpected event {:?}", other),
    }

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_call_setup_and_teardown() {
    let ((alice, mut alice_events, _a), (bob, mut bob_events, _b)) = spawn_pair();

    alice
        .with_core(|core| core.invite(BOB, RequestOptions::new()))
        .await
        .unwrap()
        .unwrap();

    let UserAgentEvent::IncomingRequest { uas, .. } = next(&mut bob_events).await else {
        panic!("expected the INVITE");
    };
    bob.with_core(move |core| core.accept(uas, 200, ResponseOptions::new()))
        .await
        .unwrap()
        .unwrap();

    let dialog = loop {
        match next(&mut alice_events).await {
            UserAgentEvent::Trying { .. } => {}
            UserAgentEvent::Accepted { dialog: Some(dialog), .. } => break dialog,
            other => panic!("unexpected event {:?}", other),
        }
    };
    let ack_dialog = dialog.clone();
    alice
        .with_core(move |core| core.ack(&ack_dialog, RequestOptions::new()))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(next(&mut bob_events).await, UserAgentEvent::AckReceived { .. }));

    let bye_dialog = dialog.clone();
    alice
        .with_core(move |core| core.bye(&bye_dialog, RequestOptions::new()))
        .await
        .unwrap()
        .unwrap();

    // Bob's dialog ends on the BYE itself
    loop {
        match next(&mut bob_events).await {
            UserAgentEvent::DialogTerminated { .. } => break,
            UserAgentEvent::IncomingRequest { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
    loop {
        match next(&mut alice_events).await {
            UserAgentEvent::DialogTerminated { dialog: id, .. } => {
                assert_eq!(id, dialog);
                break;
            }
            UserAgentEvent::Accepted { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    let count = alice.with_core(|core| core.dialog_count()).await.unwrap();
    assert_eq!(count, 0);

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handle_fails_after_shutdown() {
    let ((alice, _events, task), (_bob, _bob_events, _b)) = spawn_pair();

    alice.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(!alice.is_running());
    assert!(alice.with_core(|core| core.dialog_count()).await.is_err());
}
