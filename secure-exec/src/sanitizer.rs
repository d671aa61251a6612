//! Screening of raw user queries before any script is generated.
//!
//! This is a coarse filter over text, not a parser. It catches obvious
//! injection attempts early; the validator remains the real gate.

use crate::denylist::{Denylist, QueryPatterns};
use crate::error::RejectionReason;

/// Longest query accepted by default, in characters
pub const DEFAULT_MAX_QUERY_CHARS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct InputSanitizer {
    max_chars: usize,
    patterns: QueryPatterns,
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::from_denylist(DEFAULT_MAX_QUERY_CHARS, &Denylist::default())
    }
}

impl InputSanitizer {
    pub fn new(max_chars: usize, patterns: QueryPatterns) -> Self {
        Self {
            max_chars,
            patterns,
        }
    }

    /// A sanitizer screening with the denylist's query patterns
    pub fn from_denylist(max_chars: usize, denylist: &Denylist) -> Self {
        Self::new(max_chars, denylist.query_patterns().clone())
    }

    /// Accept or refuse a query, naming the first reason it was refused
    pub fn screen(&self, query: &str) -> Result<(), RejectionReason> {
        if query.trim().is_empty() {
            return Err(RejectionReason::Empty);
        }

        if query.chars().count() > self.max_chars {
            return Err(RejectionReason::TooLong {
                max: self.max_chars,
            });
        }

        if let Some(pattern) = self.patterns.first_match(query) {
            tracing::warn!(pattern, "user query rejected");
            return Err(RejectionReason::Suspicious {
                pattern: pattern.to_string(),
            });
        }

        Ok(())
    }
}

/// Screen a query with the default limits: `(is_valid, error_message)`
pub fn screen_user_query(text: &str) -> (bool, Option<String>) {
    match InputSanitizer::default().screen(text) {
        Ok(()) => (true, None),
        Err(reason) => (false, Some(reason.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_valid_query_passes() {
        assert_eq!(screen_user_query("Show me the first 10 rows"), (true, None));
        assert_eq!(
            screen_user_query("What is the average salary by department?"),
            (true, None)
        );
    }

    #[test]
    fn test_empty_query_rejected() {
        assert_eq!(
            screen_user_query(""),
            (false, Some("Input cannot be empty".to_string()))
        );
        assert_eq!(
            screen_user_query("   \n "),
            (false, Some("Input cannot be empty".to_string()))
        );
    }

    #[test]
    fn test_long_query_rejected() {
        let (ok, message) = screen_user_query(&"a".repeat(10_001));
        assert!(!ok);
        assert_eq!(
            message.as_deref(),
            Some("Input is too long (max 10000 characters)")
        );

        assert!(screen_user_query(&"a".repeat(10_000)).0);
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        // 5000 two-byte characters: 10000 bytes but only 5000 chars
        assert!(screen_user_query(&"é".repeat(5_000)).0);
    }

    #[test]
    fn test_suspicious_patterns_rejected() {
        let cases = [
            ("Run __import__('os')", "__import__"),
            ("eval(1+1)", "eval("),
            ("please EXEC(code)", "exec("),
            ("compile (src)", "compile("),
            ("use subprocess.run please", "subprocess."),
            ("call os.system for me", "os.system"),
            ("os.popen('ls')", "os.popen"),
            ("try os.execv", "os.exec"),
            ("pty.spawn('/bin/sh')", "pty.spawn"),
        ];

        for (query, label) in cases {
            let (ok, message) = screen_user_query(query);
            assert!(!ok, "should reject {:?}", query);
            assert_eq!(
                message,
                Some(format!("Input contains potentially dangerous pattern: '{}'", label))
            );
        }
    }

    #[test]
    fn test_custom_length_limit() {
        let sanitizer = InputSanitizer::new(5, QueryPatterns::default());
        assert_eq!(
            sanitizer.screen("abcdef"),
            Err(RejectionReason::TooLong { max: 5 })
        );
        assert_eq!(sanitizer.screen("abc"), Ok(()));
    }
}
