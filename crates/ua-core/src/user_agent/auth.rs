//! Digest authentication (RFC 2617, RFC 3261 §22)
//!
//! The core only validates challenges and decides whether to retry. Turning
//! a challenge into an Authorization value is behind [`Credentials`], so an
//! application can plug in its own scheme; [`DigestCredentials`] covers
//! username/password MD5 digest.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use sipua_message::headers::split_list;
use sipua_message::{Request, Response, header_names as names};

use crate::error::{Error, Result};
use crate::tokens::{RandomTokens, TokenGenerator};

/// A parsed and validated WWW-Authenticate / Proxy-Authenticate value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    /// qop options offered, empty when the challenge has none
    pub qop: Vec<String>,
    pub stale: bool,
    /// From a 407 (Proxy-Authenticate)
    pub proxy: bool,
}

impl Challenge {
    /// Parses a challenge header value.
    ///
    /// Only `Digest` is accepted; realm and nonce are mandatory and every
    /// offered qop must be `auth` or `auth-int`.
    pub fn parse(value: &str, proxy: bool) -> Result<Self> {
        let value = value.trim();
        let (scheme, params) = value.split_once(char::is_whitespace).unwrap_or((value, ""));
        if !scheme.eq_ignore_ascii_case("digest") {
            return Err(Error::Protocol(format!("unsupported authentication scheme {}", scheme)));
        }

        let mut challenge = Challenge {
            realm: String::new(),
            nonce: String::new(),
            opaque: None,
            algorithm: None,
            qop: Vec::new(),
            stale: false,
            proxy,
        };
        let mut realm = None;
        let mut nonce = None;

        for param in split_list(params) {
            let Some((name, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => challenge.opaque = Some(value),
                "algorithm" => challenge.algorithm = Some(value),
                "stale" => challenge.stale = value.eq_ignore_ascii_case("true"),
                "qop" => {
                    challenge.qop = value
                        .split(',')
                        .map(|q| q.trim().to_ascii_lowercase())
                        .filter(|q| !q.is_empty())
                        .collect();
                }
                _ => {}
            }
        }

        challenge.realm = realm.ok_or_else(|| Error::Protocol("challenge without realm".to_string()))?;
        challenge.nonce = nonce.ok_or_else(|| Error::Protocol("challenge without nonce".to_string()))?;
        if let Some(bad) = challenge.qop.iter().find(|q| *q != "auth" && *q != "auth-int") {
            return Err(Error::Protocol(format!("unsupported qop {}", bad)));
        }
        if let Some(algorithm) = &challenge.algorithm {
            if !algorithm.eq_ignore_ascii_case("md5") {
                return Err(Error::Protocol(format!("unsupported algorithm {}", algorithm)));
            }
        }
        Ok(challenge)
    }

    /// Reads the challenge of a 401 or 407 response.
    pub fn from_response(response: &Response) -> Result<Self> {
        let (header, proxy) = match response.status {
            401 => (names::WWW_AUTHENTICATE, false),
            407 => (names::PROXY_AUTHENTICATE, true),
            other => return Err(Error::Protocol(format!("{} is not a challenge", other))),
        };
        let value = response
            .header(header)
            .ok_or_else(|| Error::Protocol(format!("{} without {}", response.status, header)))?;
        Self::parse(value, proxy)
    }

    /// Header the credentials go into.
    pub fn authorization_header(&self) -> &'static str {
        if self.proxy {
            names::PROXY_AUTHORIZATION
        } else {
            names::AUTHORIZATION
        }
    }
}

/// Answers a challenge for a request
pub trait Credentials: Send + Sync {
    /// Returns the Authorization/Proxy-Authorization value, or `None` when
    /// these credentials cannot answer the challenge.
    fn authenticate(&self, request: &Request, challenge: &Challenge) -> Option<String>;
}

/// Username/password MD5 digest credentials
pub struct DigestCredentials {
    username: String,
    password: String,
    cnonce: Option<String>,
    nonce_count: AtomicU32,
}

impl DigestCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            cnonce: None,
            nonce_count: AtomicU32::new(0),
        }
    }

    /// Uses a fixed client nonce instead of a random one.
    pub fn with_cnonce(mut self, cnonce: impl Into<String>) -> Self {
        self.cnonce = Some(cnonce.into());
        self
    }
}

impl fmt::Debug for DigestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Inputs of one digest computation
#[derive(Debug, Clone)]
pub struct DigestInput<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub realm: &'a str,
    pub nonce: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
    /// `(qop, nc, cnonce)` when a qop was chosen
    pub qop: Option<(&'a str, &'a str, &'a str)>,
    /// Entity body, hashed for `auth-int`
    pub body: &'a [u8],
}

fn md5_hex(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", md5::compute(data))
}

/// The `response` parameter of RFC 2617 §3.2.2.1.
pub fn digest_response(input: &DigestInput<'_>) -> String {
    let ha1 = md5_hex(format!("{}:{}:{}", input.username, input.realm, input.password));
    let ha2 = match input.qop {
        Some(("auth-int", _, _)) => md5_hex(format!("{}:{}:{}", input.method, input.uri, md5_hex(input.body))),
        _ => md5_hex(format!("{}:{}", input.method, input.uri)),
    };
    match input.qop {
        Some((qop, nc, cnonce)) => md5_hex(format!("{}:{}:{}:{}:{}:{}", ha1, input.nonce, nc, cnonce, qop, ha2)),
        None => md5_hex(format!("{}:{}:{}", ha1, input.nonce, ha2)),
    }
}

impl Credentials for DigestCredentials {
    fn authenticate(&self, request: &Request, challenge: &Challenge) -> Option<String> {
        let qop = if challenge.qop.is_empty() {
            None
        } else if challenge.qop.iter().any(|q| q == "auth") {
            Some("auth")
        } else {
            Some("auth-int")
        };
        let nc = format!("{:08x}", self.nonce_count.fetch_add(1, Ordering::Relaxed) + 1);
        let cnonce = self.cnonce.clone().unwrap_or_else(|| RandomTokens.token());
        let body = request.body.as_ref().map(|b| &b.content[..]).unwrap_or_default();
        let method = request.method.to_string();

        let response = digest_response(&DigestInput {
            username: &self.username,
            password: &self.password,
            realm: &challenge.realm,
            nonce: &challenge.nonce,
            method: &method,
            uri: &request.uri,
            qop: qop.map(|q| (q, nc.as_str(), cnonce.as_str())),
            body,
        });

        let mut value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            self.username, challenge.realm, challenge.nonce, request.uri, response
        );
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        if let Some(qop) = qop {
            value.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use sipua_message::Method;

    use super::*;

    #[test]
    fn test_rfc2617_vector() {
        let response = digest_response(&DigestInput {
            username: "Mufasa",
            password: "Circle Of Life",
            realm: "testrealm@host.com",
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            method: "GET",
            uri: "/dir/index.html",
            qop: Some(("auth", "00000001", "0a4f113b")),
            body: b"",
        });
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_credentials_follow_the_vector() {
        let challenge = Challenge::parse(
            "Digest realm=\"testrealm@host.com\", qop=\"auth,auth-int\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
            false,
        )
        .unwrap();
        let request = Request::new(Method::Extension("GET".to_string()), "/dir/index.html");
        let credentials = DigestCredentials::new("Mufasa", "Circle Of Life").with_cnonce("0a4f113b");
        let value = credentials.authenticate(&request, &challenge).unwrap();
        assert!(value.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));

        // The nonce count goes up with every use of the same credentials
        let again = credentials.authenticate(&request, &challenge).unwrap();
        assert!(again.contains("nc=00000002"));
    }

    #[test]
    fn test_challenge_validation() {
        assert!(Challenge::parse("Basic realm=\"x\"", false).is_err());
        assert!(Challenge::parse("Digest nonce=\"n\"", false).is_err());
        assert!(Challenge::parse("Digest realm=\"r\"", false).is_err());
        assert!(Challenge::parse("Digest realm=\"r\", nonce=\"n\", qop=\"auth-conf\"", false).is_err());

        let challenge = Challenge::parse("Digest realm=\"r\", nonce=\"n\", stale=TRUE", true).unwrap();
        assert!(challenge.stale);
        assert!(challenge.qop.is_empty());
        assert_eq!(challenge.authorization_header(), "Proxy-Authorization");
    }
}
