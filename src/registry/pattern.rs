//! Wildcard host-name patterns
//!
//! `*` matches any run of characters (including none), `.` matches exactly
//! one character, and everything else matches itself. Matching is
//! case-insensitive and anchored at both ends of the name.

use regex_lite::Regex;

/// A compiled wildcard pattern
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    regex: Regex,
}

impl WildcardPattern {
    /// Compile a wildcard pattern
    pub fn new(pattern: &str) -> Self {
        let mut expr = String::with_capacity(pattern.len() * 2 + 8);
        expr.push_str("(?is)^");

        let mut literal = [0u8; 4];
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '.' => expr.push('.'),
                other => expr.push_str(&regex_lite::escape(other.encode_utf8(&mut literal))),
            }
        }
        expr.push('$');

        // Every non-wildcard character is escaped, so the expression is
        // always well-formed.
        let regex = Regex::new(&expr).unwrap_or_else(|_| unreachable!("escaped pattern: {}", expr));

        Self { regex }
    }

    /// Whether `name` matches the whole pattern
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}
