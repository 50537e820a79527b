//! # Topic Pattern Matching
//!
//! Binding patterns for topic exchanges use dot-separated segments where
//! `*` matches exactly one segment and `#` matches zero or more.
//! Routing keys are plain dotted strings (`event.discover.venue`).

use std::fmt;

/// A parsed binding pattern for a topic exchange.
///
/// Patterns are pre-split at construction so that routing a publish only
/// walks segments, never re-parses the pattern string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Matches exactly this segment text.
    Literal(String),
    /// `*`: exactly one segment, any text.
    AnyOne,
    /// `#`: zero or more segments.
    AnyRest,
}

impl TopicPattern {
    /// Parse a binding pattern. Any string is a valid pattern; a pattern
    /// with no wildcards only matches the identical routing key.
    #[must_use]
    pub fn new(pattern: &str) -> Self {
        let segments = pattern
            .split('.')
            .map(|s| match s {
                "*" => Segment::AnyOne,
                "#" => Segment::AnyRest,
                lit => Segment::Literal(lit.to_string()),
            })
            .collect();
        Self {
            raw: pattern.to_string(),
            segments,
        }
    }

    /// The pattern exactly as written at bind time.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the pattern contains no wildcard segments.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Check a routing key against this pattern.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        let key: Vec<&str> = routing_key.split('.').collect();
        matches_from(&self.segments, &key)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

fn matches_from(pattern: &[Segment], key: &[&str]) -> bool {
    let Some((head, rest)) = pattern.split_first() else {
        return key.is_empty();
    };

    match head {
        // `#` absorbs zero or more key segments; try every split point.
        Segment::AnyRest => (0..=key.len()).any(|skip| matches_from(rest, &key[skip..])),
        Segment::AnyOne => key
            .split_first()
            .is_some_and(|(_, tail)| matches_from(rest, tail)),
        Segment::Literal(lit) => key
            .split_first()
            .is_some_and(|(k, tail)| k == lit && matches_from(rest, tail)),
    }
}
