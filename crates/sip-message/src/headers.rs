//! Header storage and the small set of field extractions the core relies on
//!
//! Header values are stored verbatim. The helpers in this module pull out the
//! pieces that transaction and dialog matching need:
//!
//! - header parameters such as `tag` and `branch` ([`header_param`])
//! - name-addr values with display name, URI and parameters ([`NameAddr`])
//! - the CSeq number and method ([`CSeq`])
//! - URI scheme, user and URI parameters ([`uri_scheme`], [`uri_user`], [`uri_param`])
//!
//! Names are normalised on insertion: compact forms (`v`, `f`, `t`, `i`, ...)
//! are expanded and well-known names get their canonical spelling, so lookups
//! are case-insensitive and independent of the form used on the wire.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::method::Method;

/// Canonical header names used throughout the workspace
pub mod header_names {
    pub const ACCEPT: &str = "Accept";
    pub const ALLOW: &str = "Allow";
    pub const ALLOW_EVENTS: &str = "Allow-Events";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const CALL_ID: &str = "Call-ID";
    pub const CONTACT: &str = "Contact";
    pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
    pub const CONTENT_ENCODING: &str = "Content-Encoding";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const CSEQ: &str = "CSeq";
    pub const EVENT: &str = "Event";
    pub const EXPIRES: &str = "Expires";
    pub const FROM: &str = "From";
    pub const MAX_FORWARDS: &str = "Max-Forwards";
    pub const PROXY_AUTHENTICATE: &str = "Proxy-Authenticate";
    pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
    pub const RACK: &str = "RAck";
    pub const REASON: &str = "Reason";
    pub const RECORD_ROUTE: &str = "Record-Route";
    pub const REFER_TO: &str = "Refer-To";
    pub const REFERRED_BY: &str = "Referred-By";
    pub const REQUIRE: &str = "Require";
    pub const RETRY_AFTER: &str = "Retry-After";
    pub const ROUTE: &str = "Route";
    pub const RSEQ: &str = "RSeq";
    pub const SESSION_EXPIRES: &str = "Session-Expires";
    pub const SUBJECT: &str = "Subject";
    pub const SUBSCRIPTION_STATE: &str = "Subscription-State";
    pub const SUPPORTED: &str = "Supported";
    pub const TO: &str = "To";
    pub const USER_AGENT: &str = "User-Agent";
    pub const VIA: &str = "Via";
    pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
}

use header_names as names;

const CANONICAL_NAMES: &[&str] = &[
    names::ACCEPT,
    names::ALLOW,
    names::ALLOW_EVENTS,
    names::AUTHORIZATION,
    names::CALL_ID,
    names::CONTACT,
    names::CONTENT_DISPOSITION,
    names::CONTENT_ENCODING,
    names::CONTENT_LENGTH,
    names::CONTENT_TYPE,
    names::CSEQ,
    names::EVENT,
    names::EXPIRES,
    names::FROM,
    names::MAX_FORWARDS,
    names::PROXY_AUTHENTICATE,
    names::PROXY_AUTHORIZATION,
    names::RACK,
    names::REASON,
    names::RECORD_ROUTE,
    names::REFER_TO,
    names::REFERRED_BY,
    names::REQUIRE,
    names::RETRY_AFTER,
    names::ROUTE,
    names::RSEQ,
    names::SESSION_EXPIRES,
    names::SUBJECT,
    names::SUBSCRIPTION_STATE,
    names::SUPPORTED,
    names::TO,
    names::USER_AGENT,
    names::VIA,
    names::WWW_AUTHENTICATE,
];

/// Expands compact header names and normalises the spelling of known names.
pub fn canonical_name(name: &str) -> String {
    let expanded = match name {
        "b" | "B" => names::REFERRED_BY,
        "c" | "C" => names::CONTENT_TYPE,
        "e" | "E" => names::CONTENT_ENCODING,
        "f" | "F" => names::FROM,
        "i" | "I" => names::CALL_ID,
        "k" | "K" => names::SUPPORTED,
        "l" | "L" => names::CONTENT_LENGTH,
        "m" | "M" => names::CONTACT,
        "o" | "O" => names::EVENT,
        "r" | "R" => names::REFER_TO,
        "s" | "S" => names::SUBJECT,
        "t" | "T" => names::TO,
        "u" | "U" => names::ALLOW_EVENTS,
        "v" | "V" => names::VIA,
        "x" | "X" => names::SESSION_EXPIRES,
        other => {
            return CANONICAL_NAMES
                .iter()
                .find(|known| known.eq_ignore_ascii_case(other))
                .map(|known| known.to_string())
                .unwrap_or_else(|| other.to_string());
        }
    };
    expanded.to_string()
}

/// Ordered, multi-valued header map with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header line, keeping any existing lines of the same name.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((canonical_name(name), value.into()));
    }

    /// Inserts a header line before every other line of the same name
    /// (used for the top Via and Route entries).
    pub fn prepend(&mut self, name: &str, value: impl Into<String>) {
        let name = canonical_name(name);
        let position = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name))
            .unwrap_or(self.entries.len());
        self.entries.insert(position, (name, value.into()));
    }

    /// Replaces every line of `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let name = canonical_name(name);
        match self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(position) => {
                self.entries[position].1 = value.into();
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= position || !n.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value.into())),
        }
    }

    /// Removes every line of `name`.
    pub fn remove(&mut self, name: &str) {
        let name = canonical_name(name);
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
    }

    /// Returns the first value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = canonical_name(name);
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every raw line value of `name`, in order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let name = canonical_name(name);
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(&name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns every list element of `name`, splitting comma separated lines.
    pub fn get_list(&self, name: &str) -> Vec<String> {
        self.get_all(name).into_iter().flat_map(split_list).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Splits a header value on commas that are outside quotes and angle brackets.
pub fn split_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_brackets = false;
    let mut escaped = false;

    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                escaped = true;
                current.push(c);
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '<' if !in_quotes => {
                in_brackets = true;
                current.push(c);
            }
            '>' if !in_quotes => {
                in_brackets = false;
                current.push(c);
            }
            ',' if !in_quotes && !in_brackets => {
                let item = current.trim();
                if !item.is_empty() {
                    items.push(item.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let item = current.trim();
    if !item.is_empty() {
        items.push(item.to_string());
    }
    items
}

/// Parses `;name=value` / `;flag` parameter lists.
fn parse_params(input: &str) -> Vec<(String, Option<String>)> {
    input
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((name, value)) => (
                name.trim().to_ascii_lowercase(),
                Some(value.trim().trim_matches('"').to_string()),
            ),
            None => (p.to_ascii_lowercase(), None),
        })
        .collect()
}

/// Returns the header parameters of a single header value (the part after
/// the URI), e.g. `tag` of a To/From value or `branch` of a Via value.
///
/// Flag parameters yield `Some("")`.
pub fn header_param(value: &str, name: &str) -> Option<String> {
    let params = match value.find('<') {
        Some(_) => value.rsplit_once('>').map(|(_, rest)| rest).unwrap_or(""),
        None => value.split_once(';').map(|(_, rest)| rest).unwrap_or(""),
    };
    let name = name.to_ascii_lowercase();
    parse_params(params)
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v.unwrap_or_default())
}

/// Returns the value of a URI parameter (`sip:host;lr` → `lr`).
pub fn uri_param(uri: &str, name: &str) -> Option<String> {
    let without_headers = uri.split('?').next().unwrap_or(uri);
    let params = without_headers.split_once(';').map(|(_, rest)| rest)?;
    let name = name.to_ascii_lowercase();
    parse_params(params)
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v.unwrap_or_default())
}

/// Returns the lower-cased URI scheme (`sip`, `sips`, `tel`, ...).
pub fn uri_scheme(uri: &str) -> Option<String> {
    let (scheme, rest) = uri.split_once(':')?;
    if scheme.is_empty() || rest.is_empty() || !scheme.bytes().all(|b| b.is_ascii_alphanumeric() || b"+-.".contains(&b)) {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

/// Returns the user part of a SIP URI, if any.
pub fn uri_user(uri: &str) -> Option<String> {
    let (_, rest) = uri.split_once(':')?;
    let (user, _) = rest.split_once('@')?;
    Some(user.split(';').next().unwrap_or(user).to_string())
}

/// Returns the host part of a SIP URI (without port and parameters).
pub fn uri_host(uri: &str) -> Option<String> {
    let (_, rest) = uri.split_once(':')?;
    let hostport = rest.rsplit_once('@').map(|(_, h)| h).unwrap_or(rest);
    let hostport = hostport.split([';', '?']).next().unwrap_or(hostport);
    let host = if hostport.starts_with('[') {
        hostport.split_inclusive(']').next().unwrap_or(hostport)
    } else {
        hostport.split(':').next().unwrap_or(hostport)
    };
    Some(host.to_ascii_lowercase())
}

/// A name-addr or addr-spec header value (To, From, Contact, Route, ...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: String,
    pub params: Vec<(String, Option<String>)>,
}

impl NameAddr {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            display_name: None,
            uri: uri.into(),
            params: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.set_param(name, value);
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        let name = name.to_ascii_lowercase();
        let value = value.map(str::to_string);
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.params.push((name, value)),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.param("tag")
    }
}

impl FromStr for NameAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim();
        let invalid = || Error::InvalidHeader {
            name: "name-addr".to_string(),
            value: value.to_string(),
        };

        if let Some(open) = value.find('<') {
            let close = value[open..].find('>').map(|i| open + i).ok_or_else(invalid)?;
            let display = value[..open].trim().trim_matches('"').trim();
            let uri = value[open + 1..close].trim();
            if uri.is_empty() {
                return Err(invalid());
            }
            Ok(Self {
                display_name: (!display.is_empty()).then(|| display.to_string()),
                uri: uri.to_string(),
                params: parse_params(&value[close + 1..]),
            })
        } else {
            // addr-spec form: every parameter after the URI is a header parameter
            let (uri, params) = value.split_once(';').unwrap_or((value, ""));
            if uri.is_empty() || !uri.contains(':') {
                return Err(invalid());
            }
            Ok(Self {
                display_name: None,
                uri: uri.trim().to_string(),
                params: parse_params(params),
            })
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display_name) = &self.display_name {
            write!(f, "\"{}\" ", display_name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// CSeq header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        Self { seq, method }
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidHeader {
            name: names::CSEQ.to_string(),
            value: s.to_string(),
        };
        let mut parts = s.split_whitespace();
        let seq = parts.next().and_then(|n| n.parse::<u32>().ok()).ok_or_else(invalid)?;
        let method = parts.next().ok_or_else(invalid)?.parse::<Method>().map_err(|_| invalid())?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// Structural check applied by the parser to headers the core depends on.
///
/// A header failing this check is dropped from the message; everything else
/// is carried through untouched.
pub fn validate_header(name: &str, value: &str) -> Result<()> {
    let invalid = || Error::InvalidHeader {
        name: name.to_string(),
        value: value.to_string(),
    };
    match name {
        names::CSEQ => value.parse::<CSeq>().map(|_| ()),
        names::CONTENT_LENGTH | names::MAX_FORWARDS | names::EXPIRES | names::RSEQ => value
            .trim()
            .parse::<u32>()
            .map(|_| ())
            .map_err(|_| invalid()),
        names::CALL_ID => {
            let v = value.trim();
            if v.is_empty() || v.contains(char::is_whitespace) {
                Err(invalid())
            } else {
                Ok(())
            }
        }
        names::VIA => {
            if split_list(value).iter().all(|v| v.to_ascii_uppercase().starts_with("SIP/2.0/")) {
                Ok(())
            } else {
                Err(invalid())
            }
        }
        names::FROM | names::TO => value.parse::<NameAddr>().map(|_| ()),
        _ => Ok(()),
    }
}
