//! Error types for building notifications.

use thiserror::Error;

/// Errors that can occur when building or decoding notifications.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// A required envelope field was not set.
    #[error("notification is missing required field: {0}")]
    MissingField(&'static str),

    /// The event type does not follow the `<service>.<name>` convention.
    #[error("invalid event type: {0}")]
    InvalidEventType(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
