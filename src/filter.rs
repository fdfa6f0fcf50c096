//! Message filters.
//!
//! A [`Filter`] is an immutable predicate tree evaluated against every
//! message a session is offered. Evaluation is a pure function of the filter
//! and the message; a field that is missing from the message is a non-match,
//! never an error.

use crate::error::{BrokerError, Result};
use crate::types::Message;
use regex::Regex;

/// Predicate over a [`Message`].
#[derive(Clone, Debug)]
pub enum Filter {
    /// Passes every message.
    AcceptAll,
    /// Passes when the field's text contains `needle` as a literal substring.
    Contains { field: String, needle: String },
    /// Passes when the field's text matches a regex compiled at construction.
    Matches { field: String, regex: Regex },
    /// Passes when every sub-filter passes. Empty passes everything.
    All(Vec<Filter>),
}

impl Filter {
    pub fn accept_all() -> Self {
        Filter::AcceptAll
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Filter::Contains {
            field: field.into(),
            needle: needle.into(),
        }
    }

    /// Compile `pattern` once. Patterns use Rust `regex` syntax (not POSIX
    /// ERE: no backreferences or lookaround, leftmost-first matching).
    /// Invalid patterns fail here rather than at match time.
    pub fn regex(field: impl Into<String>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| BrokerError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Filter::Matches {
            field: field.into(),
            regex,
        })
    }

    pub fn all(filters: Vec<Filter>) -> Self {
        Filter::All(filters)
    }

    /// Evaluate the filter against a message.
    pub fn passes(&self, msg: &Message) -> bool {
        match self {
            Filter::AcceptAll => true,
            Filter::Contains { field, needle } => msg
                .field(field)
                .map_or(false, |value| value.contains(needle.as_str())),
            Filter::Matches { field, regex } => msg
                .field(field)
                .map_or(false, |value| regex.is_match(&value)),
            Filter::All(filters) => filters.iter().all(|f| f.passes(msg)),
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter::AcceptAll
    }
}
