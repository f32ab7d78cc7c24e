// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wildcard matchers for field-name sanitization and ignored URLs.
//!
//! A pattern is a comma separated entry where `*` matches any sequence of characters. Matching is
//! case-insensitive unless the pattern starts with `(?-i)`.

use regex::Regex;
use std::fmt;
use tracing::error;

/// A single compiled wildcard pattern.
#[derive(Clone)]
pub struct WildcardMatcher {
    pattern: String,
    regex: Regex,
}

impl WildcardMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let (case_sensitive, body) = match pattern.strip_prefix("(?-i)") {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };

        let escaped = body
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let source = if case_sensitive {
            format!("^{escaped}$")
        } else {
            format!("(?i)^{escaped}$")
        };

        Ok(Self {
            pattern: pattern.to_string(),
            regex: Regex::new(&source)?,
        })
    }

    #[must_use]
    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Debug for WildcardMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WildcardMatcher({:?})", self.pattern)
    }
}

impl PartialEq for WildcardMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

/// An ordered list of wildcard matchers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WildcardMatchers(Vec<WildcardMatcher>);

impl WildcardMatchers {
    /// Parses a comma separated list of patterns, skipping empty entries.
    ///
    /// Patterns that fail to compile are logged and skipped.
    #[must_use]
    pub fn parse(patterns: &str) -> Self {
        let matchers = patterns
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .filter_map(|p| match WildcardMatcher::new(p) {
                Ok(matcher) => Some(matcher),
                Err(e) => {
                    error!("CONFIG | ignoring invalid wildcard pattern {p:?}: {e}");
                    None
                }
            })
            .collect();
        Self(matchers)
    }

    #[must_use]
    pub fn match_any(&self, value: &str) -> bool {
        self.0.iter().any(|m| m.is_match(value))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Field names sanitized by default.
pub const DEFAULT_SANITIZE_FIELD_NAMES: &str =
    "password,passwd,pwd,secret,*key,*token*,*session*,*credit*,*card*,authorization,set-cookie";

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_prefix_suffix_and_infix() {
        let matchers = WildcardMatchers::parse("*key, *token*,password");
        assert_eq!(matchers.len(), 3);
        assert!(matchers.match_any("X-Api-Key"));
        assert!(matchers.match_any("csrftoken_value"));
        assert!(matchers.match_any("PASSWORD"));
        assert!(!matchers.match_any("passwords"));
        assert!(!matchers.match_any("keyring"));
    }

    #[test]
    fn test_wildcard_case_sensitive_prefix() {
        let matcher = WildcardMatcher::new("(?-i)/Health*").unwrap();
        assert!(matcher.is_match("/Healthz"));
        assert!(!matcher.is_match("/healthz"));
    }

    #[test]
    fn test_wildcard_escapes_regex_metacharacters() {
        let matcher = WildcardMatcher::new("/api/v1.0/*").unwrap();
        assert!(matcher.is_match("/api/v1.0/users"));
        assert!(!matcher.is_match("/api/v100/users"));
    }

    #[test]
    fn test_default_sanitize_field_names() {
        let matchers = WildcardMatchers::parse(DEFAULT_SANITIZE_FIELD_NAMES);
        assert!(matchers.match_any("Authorization"));
        assert!(matchers.match_any("Set-Cookie"));
        assert!(matchers.match_any("sessionid"));
        assert!(!matchers.match_any("User-Agent"));
    }

    #[test]
    fn test_empty_entries_are_skipped() {
        let matchers = WildcardMatchers::parse(" , ,");
        assert!(matchers.is_empty());
        assert!(!matchers.match_any(""));
    }
}
