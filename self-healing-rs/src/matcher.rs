//! Literal-or-pattern text matching used by remediation rules and capture
//! filters.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{Error, FailureEvent, Result};

/// Matches text either by literal substring or by compiled pattern
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "MatcherRepr", into = "MatcherRepr")]
pub enum Matcher {
    /// Case-sensitive literal substring
    Substring(String),
    /// Compiled regular expression
    Pattern(Regex),
}

impl Matcher {
    pub fn substring<S: Into<String>>(text: S) -> Self {
        Matcher::Substring(text.into())
    }

    /// Compiles a pattern matcher
    pub fn pattern(pattern: &str) -> Result<Self> {
        Ok(Matcher::Pattern(Regex::new(pattern)?))
    }

    /// Tests the matcher against a piece of text
    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Substring(needle) => text.contains(needle.as_str()),
            Matcher::Pattern(re) => re.is_match(text),
        }
    }

    /// Tests against the event message, then its stack trace
    pub fn matches(&self, event: &FailureEvent) -> bool {
        self.is_match(event.message()) || event.stack().map_or(false, |s| self.is_match(s))
    }

    /// The literal text or pattern source
    pub fn source(&self) -> &str {
        match self {
            Matcher::Substring(text) => text,
            Matcher::Pattern(re) => re.as_str(),
        }
    }

    /// An empty literal or pattern would match everything
    pub fn is_empty(&self) -> bool {
        self.source().is_empty()
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Substring(text) => f.debug_tuple("Substring").field(text).finish(),
            Matcher::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Matcher::Substring(a), Matcher::Substring(b)) => a == b,
            (Matcher::Pattern(a), Matcher::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// Serialized form: `{"type": "substring" | "pattern", "value": "..."}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MatcherRepr {
    Substring(String),
    Pattern(String),
}

impl TryFrom<MatcherRepr> for Matcher {
    type Error = Error;

    fn try_from(repr: MatcherRepr) -> Result<Self> {
        match repr {
            MatcherRepr::Substring(text) => Ok(Matcher::Substring(text)),
            MatcherRepr::Pattern(pattern) => Matcher::pattern(&pattern),
        }
    }
}

impl From<Matcher> for MatcherRepr {
    fn from(matcher: Matcher) -> Self {
        match matcher {
            Matcher::Substring(text) => MatcherRepr::Substring(text),
            Matcher::Pattern(re) => MatcherRepr::Pattern(re.as_str().to_string()),
        }
    }
}
