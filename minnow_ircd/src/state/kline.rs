use serde::{Deserialize, Serialize};
use std::fmt;
use wildmatch::WildMatch;

/// An IRC-style glob (`*` and `?`), matched case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pattern(String);

impl Pattern {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn matches(&self, value: &str) -> bool {
        WildMatch::new(&self.0.to_ascii_lowercase()).matches(&value.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A runtime ban against `user!host`. K-lines do not survive a restart.
#[derive(Debug, Clone)]
pub struct KLine {
    pub user_mask: Pattern,
    pub host_mask: Pattern,
    pub reason: String,
}

impl KLine {
    pub fn matches(&self, username: &str, hostname: &str) -> bool {
        self.user_mask.matches(username) && self.host_mask.matches(hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        let kline = KLine {
            user_mask: Pattern::new("*"),
            host_mask: Pattern::new("127.5.5.*"),
            reason: "bye".to_string(),
        };
        assert!(kline.matches("anyone", "127.5.5.5"));
        assert!(!kline.matches("anyone", "127.5.6.5"));
    }

    #[test]
    fn case_insensitive() {
        let pattern = Pattern::new("*.Example.COM");
        assert!(pattern.matches("host.example.com"));
    }

    #[test]
    fn question_mark() {
        let pattern = Pattern::new("bo?");
        assert!(pattern.matches("bob"));
        assert!(!pattern.matches("bobby"));
    }
}
