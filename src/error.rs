use std::time::Duration;
use thiserror::Error;

use crate::payload_builder::FieldError;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("MQTT client is not connected")]
    NotConnected,
    #[error("malformed payload on '{topic}': {reason}")]
    Malformed { topic: String, reason: String },
    #[error("no response on '{topic}' within {after:?}")]
    Timeout { topic: String, after: Duration },
    #[error("{0}")]
    Backend(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("operation '{0}' is already in progress")]
    InFlight(String),
    #[error("outbox channel closed")]
    ChannelClosed,
}

impl From<FieldError> for ConsoleError {
    fn from(err: FieldError) -> Self {
        ConsoleError::Validation(err.to_string())
    }
}

impl ConsoleError {
    pub fn malformed(topic: &str, reason: impl ToString) -> Self {
        ConsoleError::Malformed {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;
