//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding routing events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The action is not one the controller understands.
    #[error("unknown routing action: {0}")]
    UnknownAction(String),

    /// A field required by the action is absent or empty.
    #[error("{action} event is missing required field `{field}`")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },

    /// The event payload is invalid.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
