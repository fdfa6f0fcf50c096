//! Error types for the broker.

use crate::types::SessionId;
use thiserror::Error;

/// Main error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing drain id")]
    MissingDrainId,

    #[error("Invalid filter field")]
    InvalidFilterField,

    #[error("Invalid filter parameter")]
    InvalidFilterParam,

    #[error("Unknown filter type: {0}")]
    UnknownFilterType(String),

    #[error("Invalid regex {pattern:?}: {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("Store is shutting down")]
    ShuttingDown,

    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    #[error("Exhausted id space while allocating {0} id")]
    IdSpaceExhausted(&'static str),
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::InvalidRequest(e.to_string())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
