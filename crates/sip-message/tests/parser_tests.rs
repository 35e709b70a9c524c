use proptest::prelude::*;
use sipua_message::{Body, Message, Method, Request, Response, parse_message};

const INVITE: &str = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKnashds8\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@pc33.atlanta.com>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 4\r\n\
\r\n\
v=0\n";

fn request(raw: &[u8]) -> Request {
    match parse_message(raw).unwrap() {
        Message::Request(request) => request,
        Message::Response(_) => panic!("expected a request"),
    }
}

fn response(raw: &[u8]) -> Response {
    match parse_message(raw).unwrap() {
        Message::Response(response) => response,
        Message::Request(_) => panic!("expected a response"),
    }
}

#[test]
fn test_parse_invite_with_body() {
    let invite = request(INVITE.as_bytes());
    assert_eq!(invite.method, Method::Invite);
    assert_eq!(invite.uri, "sip:bob@biloxi.com");
    assert_eq!(invite.call_id(), Some("a84b4c76e66710"));
    assert_eq!(invite.cseq().map(|c| c.seq), Some(314159));
    assert_eq!(invite.from_tag().as_deref(), Some("1928301774"));
    assert_eq!(invite.contact_uri().as_deref(), Some("sip:alice@pc33.atlanta.com"));
    let body = invite.body.unwrap();
    assert_eq!(&body.content[..], b"v=0\n");
    assert!(body.is_session());
}

#[test]
fn test_trailing_bytes_beyond_content_length_are_discarded() {
    let mut raw = INVITE.as_bytes().to_vec();
    raw.extend_from_slice(b"garbage after the body");
    let invite = request(&raw);
    assert_eq!(&invite.body.unwrap().content[..], b"v=0\n");
}

#[test]
fn test_short_body_is_rejected() {
    let raw = INVITE.replace("Content-Length: 4", "Content-Length: 40");
    assert!(parse_message(raw.as_bytes()).is_err());
}

#[test]
fn test_compact_and_folded_headers() {
    let raw = "BYE sip:alice@pc33.atlanta.com SIP/2.0\r\n\
v: SIP/2.0/UDP 192.0.2.4;branch=z9hG4bKnashds10\r\n\
f: Bob <sip:bob@biloxi.com>;tag=a6c85cf\r\n\
t: Alice <sip:alice@atlanta.com>\r\n\
 ;tag=1928301774\r\n\
i: a84b4c76e66710\r\n\
CSeq: 231 BYE\r\n\
l: 0\r\n\r\n";
    let bye = request(raw.as_bytes());
    assert_eq!(bye.via_branch().as_deref(), Some("z9hG4bKnashds10"));
    assert_eq!(bye.to_tag().as_deref(), Some("1928301774"));
    assert_eq!(bye.call_id(), Some("a84b4c76e66710"));
    assert!(bye.body.is_none());
}

#[test]
fn test_malformed_headers_are_dropped() {
    let raw = "OPTIONS sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bK1\r\n\
CSeq: not-a-number OPTIONS\r\n\
Max-Forwards: many\r\n\
X-Custom: kept\r\n\
Content-Length: 0\r\n\r\n";
    let options = request(raw.as_bytes());
    assert!(options.cseq().is_none());
    assert!(options.max_forwards().is_none());
    assert_eq!(options.header("x-custom"), Some("kept"));
}

#[test]
fn test_bad_start_line_discards_message() {
    assert!(parse_message(b"HELLO WORLD\r\n\r\n").is_err());
    assert!(parse_message(b"SIP/2.0 abc Bad\r\nContent-Length: 0\r\n\r\n").is_err());
    assert!(parse_message(b"\r\n\r\n").is_err());
}

#[test]
fn test_parse_response_and_reserialize() {
    let raw = "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKnashds8\r\n\
To: Bob <sip:bob@biloxi.com>;tag=a6c85cf\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710\r\n\
CSeq: 314159 INVITE\r\n\
Record-Route: <sip:p1.example.com;lr>, <sip:p2.example.com;lr>\r\n\
Content-Length: 0\r\n\r\n";
    let ok = response(raw.as_bytes());
    assert_eq!(ok.status, 200);
    assert_eq!(ok.headers.get_list("Record-Route").len(), 2);

    let again = response(&ok.to_bytes());
    assert_eq!(again, ok);
}

#[test]
fn test_serialized_body_round_trips() {
    let message = Request::new(Method::Message, "sip:bob@biloxi.com")
        .with_header("Via", "SIP/2.0/UDP h;branch=z9hG4bK2")
        .with_header("Call-ID", "c1")
        .with_header("CSeq", "1 MESSAGE")
        .with_body(Body::new("text/plain", "hello"));
    let parsed = request(&message.to_bytes());
    assert_eq!(parsed.body, message.body);
}

fn header_line() -> impl Strategy<Value = (String, String)> {
    (
        prop::sample::select(vec!["X-A", "X-B", "Subject", "User-Agent", "Accept"]),
        "[a-zA-Z0-9 ]{1,20}",
    )
        .prop_map(|(name, value)| (name.to_string(), value.trim().to_string()))
        .prop_filter("non-empty value", |(_, v)| !v.is_empty())
}

proptest! {
    #[test]
    fn prop_extra_headers_never_break_core_fields(
        extra in prop::collection::vec(header_line(), 0..8),
        fold_at in prop::collection::vec(any::<bool>(), 8),
    ) {
        let mut raw = String::from("MESSAGE sip:bob@biloxi.com SIP/2.0\r\n");
        raw.push_str("Via: SIP/2.0/UDP h;branch=z9hG4bKprop\r\n");
        for (i, (name, value)) in extra.iter().enumerate() {
            match value.split_once(' ') {
                Some((head, tail)) if fold_at[i] && !head.is_empty() && !tail.trim().is_empty() => {
                    raw.push_str(&format!("{name}: {head}\r\n\t{}\r\n", tail.trim()));
                }
                _ => raw.push_str(&format!("{name}: {value}\r\n")),
            }
        }
        raw.push_str("Call-ID: prop-call\r\nCSeq: 7 MESSAGE\r\nContent-Length: 0\r\n\r\n");

        let parsed = request(raw.as_bytes());
        let branch = parsed.via_branch();
        prop_assert_eq!(branch.as_deref(), Some("z9hG4bKprop"));
        prop_assert_eq!(parsed.call_id(), Some("prop-call"));
        prop_assert_eq!(parsed.cseq().map(|c| c.seq), Some(7));
        prop_assert_eq!(parsed.headers.len(), extra.len() + 3);
    }

    #[test]
    fn prop_parser_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = parse_message(&data);
    }
}
