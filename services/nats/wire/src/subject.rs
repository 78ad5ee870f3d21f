//! Subject validation and wildcard matching.
//!
//! Subjects are dot-separated tokens. Subscription filters may use two
//! wildcards, each of which only ever matches whole tokens:
//!
//! - `*` matches exactly one token
//! - `>` matches one or more trailing tokens and must be the last token

use crate::WireError;
use std::fmt;

/// Single-token wildcard
pub const SINGLE_WILDCARD: &str = "*";
/// Multi-token suffix wildcard
pub const FULL_WILDCARD: &str = ">";

/// Check whether `subject` is delivered to a subscription on `filter`
pub fn matches(subject: &str, filter: &str) -> bool {
    matches_tokens(subject.split('.'), filter.split('.'))
}

/// Token-cursor form of [`matches`]
///
/// A trailing `>` needs at least one remaining subject token, so `a.>`
/// matches `a.b` and `a.b.c` but not `a`.
pub fn matches_tokens<'a, S, F>(subject: S, filter: F) -> bool
where
    S: IntoIterator<Item = &'a str>,
    F: IntoIterator<Item = &'a str>,
{
    let mut subject = subject.into_iter();
    let mut filter = filter.into_iter();

    loop {
        match (filter.next(), subject.next()) {
            (Some(FULL_WILDCARD), Some(_)) => return true,
            (Some(FULL_WILDCARD), None) => return false,
            (Some(SINGLE_WILDCARD), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
        }
    }
}

/// Validate a subject used for publishing
///
/// Publish subjects must be non-empty, contain no empty tokens, no
/// whitespace and no wildcard tokens.
pub fn validate_subject(subject: &str) -> Result<(), WireError> {
    check_tokens(subject)?;
    if subject
        .split('.')
        .any(|t| t == SINGLE_WILDCARD || t == FULL_WILDCARD)
    {
        return Err(WireError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

/// Validate a reply-to subject
///
/// Replies follow publish rules; inbox subjects never contain wildcards.
pub fn validate_reply(reply: &str) -> Result<(), WireError> {
    validate_subject(reply)
}

/// Validate a queue group name
pub fn validate_queue_group(queue: &str) -> Result<(), WireError> {
    if queue.is_empty() || queue.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(WireError::InvalidQueueGroup(queue.to_string()));
    }
    Ok(())
}

fn check_tokens(subject: &str) -> Result<(), WireError> {
    if subject.is_empty()
        || subject.bytes().any(|b| b.is_ascii_whitespace())
        || subject.split('.').any(str::is_empty)
    {
        return Err(WireError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

/// A validated subscription filter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectFilter {
    raw: String,
}

impl SubjectFilter {
    /// Parse and validate a filter
    ///
    /// `>` is only accepted as the final token.
    pub fn parse(filter: &str) -> Result<Self, WireError> {
        check_tokens(filter)?;

        let mut tokens = filter.split('.').peekable();
        while let Some(token) = tokens.next() {
            if token == FULL_WILDCARD && tokens.peek().is_some() {
                return Err(WireError::InvalidSubject(filter.to_string()));
            }
        }

        Ok(Self {
            raw: filter.to_string(),
        })
    }

    /// Whether `subject` is matched by this filter
    pub fn matches(&self, subject: &str) -> bool {
        matches(subject, &self.raw)
    }

    /// Whether the filter contains any wildcard token
    pub fn has_wildcards(&self) -> bool {
        self.tokens()
            .any(|t| t == SINGLE_WILDCARD || t == FULL_WILDCARD)
    }

    /// Iterate the filter tokens
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.raw.split('.')
    }

    /// Filter text as sent in SUB
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for SubjectFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for SubjectFilter {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
