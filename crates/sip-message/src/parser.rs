//! Wire framing parser (RFC 3261 §7)
//!
//! ```text
//! start-line CRLF
//! *( header-name ":" header-value CRLF )   ; continuation lines start with SP/HT
//! CRLF
//! body                                     ; Content-Length octets
//! ```
//!
//! The start line is parsed strictly: a message whose start line does not
//! parse is rejected as a whole. Headers are treated leniently: a header that
//! fails the structural check for its name is logged and dropped, the rest of
//! the message is kept.

use std::str::{self, FromStr};

use bytes::Bytes;
use nom::{
    IResult,
    bytes::complete::{tag, take_till1, take_while1, take_while_m_n},
    character::complete::space1,
    combinator::{all_consuming, map_res, opt, rest},
    sequence::{preceded, tuple},
};
use tracing::warn;

use crate::error::{Error, Result};
use crate::headers::{Headers, canonical_name, header_names as names, validate_header};
use crate::message::{Body, Message, Request, Response};
use crate::method::Method;

enum StartLine {
    Request(Method, String),
    Response(u16, String),
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

// Request-Line = Method SP Request-URI SP SIP-Version
fn request_line(input: &str) -> IResult<&str, StartLine> {
    let (input, (method, _, uri, _, _)) = all_consuming(tuple((
        map_res(take_while1(is_token_char), Method::from_str),
        space1,
        take_till1(|c: char| c == ' ' || c == '\t'),
        space1,
        tag("SIP/2.0"),
    )))(input)?;
    Ok((input, StartLine::Request(method, uri.to_string())))
}

// Status-Line = SIP-Version SP Status-Code SP Reason-Phrase
fn status_line(input: &str) -> IResult<&str, StartLine> {
    let (input, (_, _, status, reason)) = all_consuming(tuple((
        tag("SIP/2.0"),
        space1,
        map_res(take_while_m_n(3, 3, |c: char| c.is_ascii_digit()), u16::from_str),
        opt(preceded(space1, rest)),
    )))(input)?;
    Ok((input, StartLine::Response(status, reason.unwrap_or_default().to_string())))
}

fn start_line(line: &str) -> Result<StartLine> {
    let line = line.trim_end();
    let parsed = if line.starts_with("SIP/") {
        status_line(line)
    } else {
        request_line(line)
    };
    match parsed {
        Ok((_, StartLine::Response(status, _))) if !(100..=699).contains(&status) => {
            Err(Error::Parse(format!("status code out of range: {status}")))
        }
        Ok((_, start)) => Ok(start),
        Err(_) => Err(Error::Parse(format!("invalid start line: {line:?}"))),
    }
}

/// Splits the head into logical header lines, joining folded continuations.
fn unfold(lines: &[&str]) -> Vec<String> {
    let mut unfolded: Vec<String> = Vec::new();
    for line in lines {
        if line.starts_with([' ', '\t']) {
            if let Some(previous) = unfolded.last_mut() {
                previous.push(' ');
                previous.push_str(line.trim());
                continue;
            }
        }
        unfolded.push(line.to_string());
    }
    unfolded
}

fn parse_headers(lines: &[&str]) -> Headers {
    let mut headers = Headers::new();
    for line in unfold(lines) {
        let Some((name, value)) = line.split_once(':') else {
            warn!(line = %line, "Dropping header line without a colon");
            continue;
        };
        let name = name.trim();
        if name.is_empty() || !name.chars().all(is_token_char) {
            warn!(name = %name, "Dropping header with invalid name");
            continue;
        }
        let name = canonical_name(name);
        let value = value.trim();
        if let Err(e) = validate_header(&name, value) {
            warn!(error = %e, "Dropping malformed header");
            continue;
        }
        headers.add(&name, value);
    }
    headers
}

/// Locates the blank line ending the head; returns (head length, body offset).
fn find_head_end(data: &[u8]) -> Option<(usize, usize)> {
    let crlf = data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, i + 4));
    let lf = data.windows(2).position(|w| w == b"\n\n").map(|i| (i, i + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parses one framed SIP message.
///
/// Leading CRLF keep-alives are skipped. Bytes beyond `Content-Length` are
/// discarded; a body shorter than `Content-Length` is an error.
pub fn parse_message(data: &[u8]) -> Result<Message> {
    let start = data.iter().position(|b| !matches!(b, b'\r' | b'\n')).unwrap_or(data.len());
    let data = &data[start..];
    if data.is_empty() {
        return Err(Error::Parse("empty message".to_string()));
    }

    let (head_len, body_offset) = find_head_end(data).unwrap_or((data.len(), data.len()));
    let head = str::from_utf8(&data[..head_len]).map_err(|_| Error::Utf8)?;
    let lines: Vec<&str> = head.split('\n').map(|l| l.trim_end_matches('\r')).collect();

    let (first, header_lines) = lines
        .split_first()
        .ok_or_else(|| Error::Parse("missing start line".to_string()))?;
    let start_line = start_line(first)?;
    let mut headers = parse_headers(header_lines);

    let remaining = &data[body_offset..];
    let content = match headers.get(names::CONTENT_LENGTH) {
        Some(length) => {
            let length: usize = length
                .trim()
                .parse()
                .map_err(|_| Error::Parse(format!("invalid Content-Length: {length}")))?;
            if length > remaining.len() {
                return Err(Error::Parse(format!(
                    "body shorter than Content-Length ({} < {})",
                    remaining.len(),
                    length
                )));
            }
            &remaining[..length]
        }
        None => remaining,
    };

    let body = (!content.is_empty()).then(|| Body {
        content: Bytes::copy_from_slice(content),
        content_type: headers
            .get(names::CONTENT_TYPE)
            .unwrap_or("application/octet-stream")
            .to_string(),
        content_disposition: headers.get(names::CONTENT_DISPOSITION).map(str::to_string),
    });
    for name in [names::CONTENT_LENGTH, names::CONTENT_TYPE, names::CONTENT_DISPOSITION] {
        headers.remove(name);
    }

    let message = match start_line {
        StartLine::Request(method, uri) => Message::Request(Request { method, uri, headers, body }),
        StartLine::Response(status, reason) => Message::Response(Response {
            status,
            reason,
            headers,
            body,
        }),
    };
    Ok(message)
}
