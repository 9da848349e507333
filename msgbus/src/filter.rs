//! Matching rules that narrow which messages a [`HandlerSpec`] receives.
//!
//! [`HandlerSpec`]: crate::handler::HandlerSpec

// Layer 1: Standard library imports
use std::fmt;

// Layer 2: Third-party crate imports
use regex::Regex;

use crate::message::Message;

/// A single parameter-matching rule: either an exact string or a regular
/// expression, evaluated against one named parameter of a [`Message`].
enum Rule {
    Exact(String),
    Regex(Regex),
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Exact(s) => f.debug_tuple("Exact").field(s).finish(),
            Rule::Regex(r) => f.debug_tuple("Regex").field(&r.as_str()).finish(),
        }
    }
}

impl Rule {
    fn matches(&self, value: &str) -> bool {
        match self {
            Rule::Exact(s) => s == value,
            Rule::Regex(r) => r.is_match(value),
        }
    }
}

/// A parameter filter attached to a [`HandlerSpec`]: a message must carry the
/// named parameter with a value satisfying the rule to reach the handler.
///
/// Mirrors the original engine's `NamedString`/regexp filter accepted by
/// `MessageHandler::setFilter`: a plain string is compared for equality, a
/// value wrapped as a regular expression is matched against it.
///
/// [`HandlerSpec`]: crate::handler::HandlerSpec
#[derive(Debug)]
pub struct MessageFilter {
    param: String,
    rule: Rule,
}

impl MessageFilter {
    /// Require `param` to equal `value` exactly.
    pub fn exact(param: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            rule: Rule::Exact(value.into()),
        }
    }

    /// Require `param` to match the given regular expression.
    ///
    /// # Errors
    ///
    /// Returns the underlying `regex::Error` if `pattern` fails to compile.
    pub fn regex(param: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            param: param.into(),
            rule: Rule::Regex(Regex::new(pattern)?),
        })
    }

    /// Evaluate this filter against a message. A message lacking the
    /// filtered parameter never matches, matching the original's "absent
    /// parameter never satisfies a filter" semantics.
    pub fn matches(&self, msg: &Message) -> bool {
        match msg.get_param(&self.param) {
            Some(value) => self.rule.matches(value),
            None => false,
        }
    }
}
