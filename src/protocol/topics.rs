//! Topic construction for the bridge's MQTT namespace
//!
//! Every topic hangs off a configurable base topic:
//!
//! - `<base>/status` - retained presence (`online` / `offline`)
//! - `<base>/<field>` - retained measurement values
//! - `<base>` - inbound command topic (subscribed, logged only)

use thiserror::Error;

/// Presence payload published on connect
pub const STATUS_ONLINE: &str = "online";

/// Presence payload for last-will and graceful shutdown
pub const STATUS_OFFLINE: &str = "offline";

/// Normalize a topic: collapse repeated slashes, strip leading and trailing ones
pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate a base topic before it is used for publishing
pub fn validate_base_topic(base_topic: &str) -> Result<(), TopicError> {
    let canonical = canonicalize_topic(base_topic);
    if canonical.is_empty() {
        return Err(TopicError::EmptyBaseTopic);
    }

    if let Some(ch) = canonical.chars().find(|c| matches!(c, '+' | '#' | '\0')) {
        return Err(TopicError::InvalidChar(ch));
    }

    Ok(())
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Base topic cannot be empty")]
    EmptyBaseTopic,
    #[error("Base topic contains invalid character: '{0}'")]
    InvalidChar(char),
}

/// Topic construction for a fixed base topic
#[derive(Debug, Clone, PartialEq)]
pub struct TopicBuilder {
    base: String,
}

impl TopicBuilder {
    pub fn new(base_topic: &str) -> Self {
        Self {
            base: canonicalize_topic(base_topic),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `<base>/status`
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.base)
    }

    /// `<base>/<field>`
    pub fn field_topic(&self, field: &str) -> String {
        canonicalize_topic(&format!("{}/{field}", self.base))
    }

    /// Inbound command topic, the base topic itself
    pub fn command_topic(&self) -> String {
        self.base.clone()
    }
}
