//! MQTT topic filters.

use sensor_ingest_shared::{ErrorCode, ErrorEnvelope};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Filter subscribed to when none is configured.
pub const DEFAULT_TOPIC_FILTER: &str = "+/signalk/delta";

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Validation failures for topic filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilterError {
    /// Filter is empty after trimming.
    Empty,
    /// A wildcard character is mixed with other characters in a segment.
    WildcardInsideSegment {
        /// Filter that failed validation.
        filter: String,
    },
    /// `#` appears before the last segment.
    MultiLevelNotLast {
        /// Filter that failed validation.
        filter: String,
    },
}

impl TopicFilterError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::Empty => ErrorCode::new("domain", "empty_topic_filter"),
            Self::WildcardInsideSegment { .. } | Self::MultiLevelNotLast { .. } => {
                ErrorCode::new("domain", "invalid_topic_filter")
            },
        }
    }
}

impl fmt::Display for TopicFilterError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => formatter.write_str("topic filter must be non-empty"),
            Self::WildcardInsideSegment { filter } => write!(
                formatter,
                "topic filter `{filter}` uses a wildcard inside a segment"
            ),
            Self::MultiLevelNotLast { filter } => write!(
                formatter,
                "topic filter `{filter}` uses `#` before the last segment"
            ),
        }
    }
}

impl std::error::Error for TopicFilterError {}

impl From<TopicFilterError> for ErrorEnvelope {
    fn from(error: TopicFilterError) -> Self {
        let envelope = Self::expected(error.error_code(), error.to_string());
        match error {
            TopicFilterError::Empty => envelope,
            TopicFilterError::WildcardInsideSegment { filter }
            | TopicFilterError::MultiLevelNotLast { filter } => {
                envelope.with_metadata("filter", filter)
            },
        }
    }
}

/// Validated MQTT subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicFilter(Box<str>);

impl TopicFilter {
    /// Parse a filter; `+` and `#` must each occupy a whole segment and `#`
    /// may only be last.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, TopicFilterError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TopicFilterError::Empty);
        }

        let segments: Vec<&str> = trimmed.split('/').collect();
        let last = segments.len() - 1;
        for (index, segment) in segments.iter().enumerate() {
            let has_wildcard = segment.contains(['+', '#']);
            if has_wildcard && *segment != SINGLE_LEVEL && *segment != MULTI_LEVEL {
                return Err(TopicFilterError::WildcardInsideSegment {
                    filter: trimmed.to_owned(),
                });
            }
            if *segment == MULTI_LEVEL && index != last {
                return Err(TopicFilterError::MultiLevelNotLast {
                    filter: trimmed.to_owned(),
                });
            }
        }

        Ok(Self(trimmed.into()))
    }

    /// Access the filter text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when `topic` is selected by this filter.
    ///
    /// Wildcards never match topics starting with `$` at the first level.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        if topic.is_empty() || topic.contains(['+', '#']) {
            return false;
        }

        let mut filter_segments = self.0.split('/');
        let mut topic_segments = topic.split('/');
        let mut first = true;

        loop {
            match (filter_segments.next(), topic_segments.next()) {
                (Some(MULTI_LEVEL), topic_segment) => {
                    return !(first && topic_segment.is_some_and(|s| s.starts_with('$')));
                },
                (Some(SINGLE_LEVEL), Some(topic_segment)) => {
                    if first && topic_segment.starts_with('$') {
                        return false;
                    }
                },
                (Some(expected), Some(actual)) => {
                    if expected != actual {
                        return false;
                    }
                },
                (None, None) => return true,
                _ => return false,
            }
            first = false;
        }
    }
}

impl Default for TopicFilter {
    fn default() -> Self {
        Self(DEFAULT_TOPIC_FILTER.into())
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl TryFrom<String> for TopicFilter {
    type Error = TopicFilterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TopicFilter> for String {
    fn from(value: TopicFilter) -> Self {
        value.0.into_string()
    }
}
