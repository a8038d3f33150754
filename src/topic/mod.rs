//! Topic addressing
//!
//! A [`Topic`] is an ordered sequence of non-empty path levels joined by a
//! single `/`. Every constructor normalizes its input, so two topics compare
//! equal exactly when their level sequences are equal. Dispatch keys and the
//! subscription set rely on that.

pub mod validation;

pub use validation::{validate_topic_filter, validate_topic_name};

use std::fmt;
use std::sync::Arc;

/// Level separator
pub const SEPARATOR: char = '/';

/// A normalized topic path
///
/// Backed by `Arc<str>` so clones handed between the queues and the
/// registries are O(1).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(Arc<str>);

impl Topic {
    /// Join path segments into a topic.
    ///
    /// Separators are stripped from both ends of every segment, empty levels
    /// are discarded and the rest is re-joined with a single separator.
    /// An empty input yields the empty topic.
    pub fn join<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = String::new();
        for segment in segments {
            for level in segment
                .as_ref()
                .split(SEPARATOR)
                .filter(|level| !level.is_empty())
            {
                if !joined.is_empty() {
                    joined.push(SEPARATOR);
                }
                joined.push_str(level);
            }
        }
        Topic(Arc::from(joined))
    }

    /// Parse a single raw topic string
    pub fn parse(raw: &str) -> Self {
        Self::join([raw])
    }

    /// The empty topic
    pub fn empty() -> Self {
        Topic(Arc::from(""))
    }

    /// Iterate over the levels of this topic
    pub fn split(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|level| !level.is_empty())
    }

    /// Number of levels
    pub fn depth(&self) -> usize {
        self.split().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Place this topic under `prefix`
    pub fn prefixed(&self, prefix: &Topic) -> Topic {
        Topic::join([prefix.as_str(), self.as_str()])
    }

    /// Place this topic under an optional prefix
    pub fn with_prefix(&self, prefix: Option<&Topic>) -> Topic {
        match prefix {
            Some(prefix) => self.prefixed(prefix),
            None => self.clone(),
        }
    }

    /// Check that this topic can be used as a PUBLISH topic name
    pub fn validate_name(&self) -> Result<(), &'static str> {
        validate_topic_name(self.as_str())
    }
}

impl Default for Topic {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({:?})", &*self.0)
    }
}

impl From<&str> for Topic {
    fn from(raw: &str) -> Self {
        Topic::parse(raw)
    }
}

impl From<String> for Topic {
    fn from(raw: String) -> Self {
        Topic::parse(&raw)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
