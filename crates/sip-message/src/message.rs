//! Requests, responses and message bodies

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::headers::{CSeq, Headers, NameAddr, header_names as names, header_param};
use crate::method::Method;
use crate::status::reason_phrase;

/// Opaque message payload
///
/// The body content is never interpreted. Only its content type and
/// disposition matter to the core (session bodies drive the offer/answer
/// state of a session dialog).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub content: Bytes,
    pub content_type: String,
    pub content_disposition: Option<String>,
}

impl Body {
    pub fn new(content_type: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            content_type: content_type.into(),
            content_disposition: None,
        }
    }

    /// Convenience constructor for an `application/sdp` body.
    pub fn sdp(content: impl Into<Bytes>) -> Self {
        Self::new("application/sdp", content)
    }

    pub fn with_disposition(mut self, disposition: impl Into<String>) -> Self {
        self.content_disposition = Some(disposition.into());
        self
    }

    /// Disposition type in effect for this body.
    ///
    /// Without an explicit Content-Disposition an `application/sdp` body is a
    /// session description and anything else is rendered.
    pub fn disposition(&self) -> String {
        match &self.content_disposition {
            Some(value) => value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase(),
            None if self.media_type() == "application/sdp" => "session".to_string(),
            None => "render".to_string(),
        }
    }

    /// True when this body takes part in an offer/answer exchange.
    pub fn is_session(&self) -> bool {
        self.disposition() == "session"
    }

    fn media_type(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Header accessors shared by requests and responses
macro_rules! header_accessors {
    ($ty:ty) => {
        impl $ty {
            /// First value of the named header.
            pub fn header(&self, name: &str) -> Option<&str> {
                self.headers.get(name)
            }

            pub fn call_id(&self) -> Option<&str> {
                self.headers.get(names::CALL_ID).map(str::trim)
            }

            pub fn cseq(&self) -> Option<CSeq> {
                self.headers.get(names::CSEQ).and_then(|v| v.parse().ok())
            }

            pub fn from(&self) -> Option<NameAddr> {
                self.headers.get(names::FROM).and_then(|v| v.parse().ok())
            }

            pub fn to(&self) -> Option<NameAddr> {
                self.headers.get(names::TO).and_then(|v| v.parse().ok())
            }

            pub fn from_tag(&self) -> Option<String> {
                self.headers
                    .get(names::FROM)
                    .and_then(|v| header_param(v, "tag"))
                    .filter(|t| !t.is_empty())
            }

            pub fn to_tag(&self) -> Option<String> {
                self.headers
                    .get(names::TO)
                    .and_then(|v| header_param(v, "tag"))
                    .filter(|t| !t.is_empty())
            }

            /// Topmost Via entry.
            pub fn top_via(&self) -> Option<String> {
                self.headers.get_list(names::VIA).into_iter().next()
            }

            /// `branch` parameter of the topmost Via.
            pub fn via_branch(&self) -> Option<String> {
                self.top_via()
                    .and_then(|via| header_param(&via, "branch"))
                    .filter(|b| !b.is_empty())
            }

            /// URI of the first Contact header.
            pub fn contact_uri(&self) -> Option<String> {
                self.headers
                    .get_list(names::CONTACT)
                    .into_iter()
                    .next()
                    .and_then(|v| v.parse::<NameAddr>().ok())
                    .map(|addr| addr.uri)
            }

            pub fn expires(&self) -> Option<u32> {
                self.headers.get(names::EXPIRES).and_then(|v| v.trim().parse().ok())
            }

            pub fn set_body(&mut self, body: Option<Body>) {
                self.body = body;
            }

            /// Serializes the message, writing `Content-Length` from the body.
            pub fn to_bytes(&self) -> Bytes {
                let mut buf = BytesMut::with_capacity(512);
                buf.put_slice(self.start_line().as_bytes());
                buf.put_slice(b"\r\n");
                write_headers(&mut buf, &self.headers, self.body.as_ref());
                if let Some(body) = &self.body {
                    buf.put_slice(&body.content);
                }
                buf.freeze()
            }
        }
    };
}

fn write_headers(buf: &mut BytesMut, headers: &Headers, body: Option<&Body>) {
    for (name, value) in headers.iter() {
        if matches!(
            name,
            names::CONTENT_LENGTH | names::CONTENT_TYPE | names::CONTENT_DISPOSITION
        ) {
            continue;
        }
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    if let Some(body) = body {
        buf.put_slice(format!("{}: {}\r\n", names::CONTENT_TYPE, body.content_type).as_bytes());
        if let Some(disposition) = &body.content_disposition {
            buf.put_slice(format!("{}: {}\r\n", names::CONTENT_DISPOSITION, disposition).as_bytes());
        }
    }
    let length = body.map(Body::len).unwrap_or(0);
    buf.put_slice(format!("{}: {}\r\n\r\n", names::CONTENT_LENGTH, length).as_bytes());
}

/// A SIP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: Option<Body>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Builder-style header append.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.headers.get(names::MAX_FORWARDS).and_then(|v| v.trim().parse().ok())
    }

    fn start_line(&self) -> String {
        format!("{} {} SIP/2.0", self.method, self.uri)
    }
}

header_accessors!(Request);

/// A SIP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Option<Body>,
}

impl Response {
    pub fn new(status: u16, reason: Option<&str>) -> Self {
        Self {
            status,
            reason: reason.unwrap_or_else(|| reason_phrase(status)).to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Builds a response to `request` (RFC 3261 §8.2.6.2).
    ///
    /// Via, From, To, Call-ID and CSeq are copied from the request. A To-tag
    /// is not added, see [`Response::with_to_tag`].
    pub fn for_request(request: &Request, status: u16, reason: Option<&str>) -> Self {
        let mut response = Self::new(status, reason);
        for via in request.headers.get_all(names::VIA) {
            response.headers.add(names::VIA, via);
        }
        for name in [names::FROM, names::TO, names::CALL_ID, names::CSEQ] {
            if let Some(value) = request.headers.get(name) {
                response.headers.add(name, value);
            }
        }
        // 100 Trying echoes a Timestamp when present
        if status == 100 {
            if let Some(timestamp) = request.headers.get("Timestamp") {
                response.headers.add("Timestamp", timestamp);
            }
        }
        response
    }

    /// Sets the To-tag unless the To header already carries one.
    pub fn with_to_tag(mut self, tag: &str) -> Self {
        if self.to_tag().is_none() {
            if let Some(to) = self.headers.get(names::TO).map(str::to_string) {
                self.headers.set(names::TO, format!("{};tag={}", to.trim_end(), tag));
            }
        }
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_final(&self) -> bool {
        self.status >= 200
    }

    fn start_line(&self) -> String {
        format!("SIP/2.0 {} {}", self.status, self.reason)
    }
}

header_accessors!(Response);

/// Either kind of SIP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Message::Request(r) => r.call_id(),
            Message::Response(r) => r.call_id(),
        }
    }

    pub fn cseq(&self) -> Option<CSeq> {
        match self {
            Message::Request(r) => r.cseq(),
            Message::Response(r) => r.cseq(),
        }
    }

    pub fn via_branch(&self) -> Option<String> {
        match self {
            Message::Request(r) => r.via_branch(),
            Message::Response(r) => r.via_branch(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(r) => r.to_bytes(),
            Message::Response(r) => r.to_bytes(),
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => r.fmt(f),
            Message::Response(r) => r.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> Request {
        Request::new(Method::Invite, "sip:bob@biloxi.com")
            .with_header("Via", "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds")
            .with_header("Max-Forwards", "70")
            .with_header("To", "Bob <sip:bob@biloxi.com>")
            .with_header("From", "Alice <sip:alice@atlanta.com>;tag=1928301774")
            .with_header("Call-ID", "a84b4c76e66710@pc33.atlanta.com")
            .with_header("CSeq", "314159 INVITE")
            .with_body(Body::sdp("v=0\r\n"))
    }

    #[test]
    fn test_request_accessors() {
        let request = invite();
        assert_eq!(request.call_id(), Some("a84b4c76e66710@pc33.atlanta.com"));
        assert_eq!(request.cseq(), Some(CSeq::new(314159, Method::Invite)));
        assert_eq!(request.from_tag().as_deref(), Some("1928301774"));
        assert_eq!(request.to_tag(), None);
        assert_eq!(request.via_branch().as_deref(), Some("z9hG4bK776asdhds"));
        assert_eq!(request.max_forwards(), Some(70));
    }

    #[test]
    fn test_response_for_request_copies_headers() {
        let request = invite();
        let response = Response::for_request(&request, 180, None).with_to_tag("a6c85cf");
        assert_eq!(response.reason, "Ringing");
        assert_eq!(response.call_id(), request.call_id());
        assert_eq!(response.cseq(), request.cseq());
        assert_eq!(response.to_tag().as_deref(), Some("a6c85cf"));
        assert_eq!(response.via_branch(), request.via_branch());

        // An existing tag is never replaced
        let again = response.with_to_tag("other");
        assert_eq!(again.to_tag().as_deref(), Some("a6c85cf"));
    }

    #[test]
    fn test_serialize_writes_content_length() {
        let bytes = invite().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("INVITE sip:bob@biloxi.com SIP/2.0\r\n"));
        assert!(text.contains("Content-Type: application/sdp\r\n"));
        assert!(text.contains("Content-Length: 5\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn test_body_disposition_defaults() {
        assert!(Body::sdp("v=0").is_session());
        assert_eq!(Body::new("text/plain", "hi").disposition(), "render");
        let early = Body::sdp("v=0").with_disposition("early-session;handling=optional");
        assert_eq!(early.disposition(), "early-session");
        assert!(!early.is_session());
        assert!(Body::new("multipart/mixed", "x").with_disposition("session").is_session());
    }
}
