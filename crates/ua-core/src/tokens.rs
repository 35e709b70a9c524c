//! Tags, branches and Call-IDs
//!
//! All randomness the core needs goes through a [`TokenGenerator`] so tests
//! can substitute [`SequentialTokens`] and get predictable messages.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use rand::distributions::Alphanumeric;

/// RFC 3261 magic cookie that starts every branch parameter
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

pub trait TokenGenerator: Send + Sync {
    /// A fresh token usable as a tag, Call-ID or branch suffix.
    fn token(&self) -> String;

    /// A value in `low..=high`, used for Retry-After.
    fn pick(&self, low: u32, high: u32) -> u32;

    /// A fresh branch parameter carrying the magic cookie.
    fn branch(&self) -> String {
        format!("{}{}", BRANCH_MAGIC_COOKIE, self.token())
    }
}

/// Tokens drawn from the thread-local RNG
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTokens;

const TOKEN_LENGTH: usize = 16;

impl TokenGenerator for RandomTokens {
    fn token(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect()
    }

    fn pick(&self, low: u32, high: u32) -> u32 {
        rand::thread_rng().gen_range(low..=high.max(low))
    }
}

/// Predictable tokens: `<prefix>1`, `<prefix>2`, ...
#[derive(Debug)]
pub struct SequentialTokens {
    prefix: String,
    next: AtomicU64,
}

impl SequentialTokens {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl Default for SequentialTokens {
    fn default() -> Self {
        Self::new("t")
    }
}

impl TokenGenerator for SequentialTokens {
    fn token(&self) -> String {
        format!("{}{}", self.prefix, self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn pick(&self, low: u32, _high: u32) -> u32 {
        low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_tokens_are_distinct_tokens() {
        let tokens = RandomTokens;
        let a = tokens.token();
        let b = tokens.token();
        assert_eq!(a.len(), TOKEN_LENGTH);
        assert_ne!(a, b);
        assert!(tokens.branch().starts_with(BRANCH_MAGIC_COOKIE));
        let value = tokens.pick(1, 10);
        assert!((1..=10).contains(&value));
    }

    #[test]
    fn test_sequential_tokens() {
        let tokens = SequentialTokens::new("tag");
        assert_eq!(tokens.token(), "tag1");
        assert_eq!(tokens.branch(), "z9hG4bKtag2");
        assert_eq!(tokens.pick(1, 10), 1);
    }
}
