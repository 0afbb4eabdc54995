//! Topic naming convention.
//!
//! A topic is `<channel>:<event>`: the final `:`-separated segment names the
//! logical event and everything before it names the physical channel. Several
//! logical streams (`entities:aircraft`, `entities:vessels`) therefore share a
//! single join of `entities`.

use std::fmt;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};

pub const TOPIC_DELIMITER: char = ':';

/// Reserved channel used to obtain the connection id.
pub const SYSTEM_CHANNEL: &str = "system";

/// Suffix appended to an event name to form its response event.
pub const RESULT_SUFFIX: &str = "_result";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    channel: String,
    event: String,
}

impl Topic {
    pub fn new(channel: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
        }
    }

    pub fn parse(raw: &str) -> SyncResult<Self> {
        match raw.rsplit_once(TOPIC_DELIMITER) {
            Some((channel, event)) if !channel.is_empty() && !event.is_empty() => {
                Ok(Self::new(channel, event))
            }
            _ => Err(SyncError::InvalidTopic(raw.to_string())),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Event name on which replies to a request on this topic are published.
    pub fn result_event(&self) -> String {
        format!("{}{}", self.event, RESULT_SUFFIX)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.channel, TOPIC_DELIMITER, self.event)
    }
}

impl FromStr for Topic {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_last_delimiter() {
        let topic = Topic::parse("entities:aircraft").unwrap();
        assert_eq!(topic.channel(), "entities");
        assert_eq!(topic.event(), "aircraft");

        let nested = Topic::parse("region:north:vessels").unwrap();
        assert_eq!(nested.channel(), "region:north");
        assert_eq!(nested.event(), "vessels");
    }

    #[test]
    fn rejects_missing_segments() {
        for raw in ["entities", ":aircraft", "entities:", ""] {
            let err = Topic::parse(raw).unwrap_err();
            assert_eq!(err, SyncError::InvalidTopic(raw.to_string()));
        }
    }

    #[test]
    fn result_event_uses_suffix() {
        let topic: Topic = "history:trajectory".parse().unwrap();
        assert_eq!(topic.result_event(), "trajectory_result");
    }

    #[test]
    fn display_round_trips_through_parse() {
        let topic = Topic::new("entities", "vessels");
        assert_eq!(topic.to_string(), "entities:vessels");
        assert_eq!(Topic::parse(&topic.to_string()).unwrap(), topic);
    }
}
