use thiserror::Error;

use crate::domain::workflow::WorkflowStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Bus connection failed: {0}")]
    Connection(String),

    #[error("Malformed message on '{channel}': {reason}")]
    Protocol { channel: String, reason: String },

    #[error("{kind} '{id}' not found")]
    Lookup { kind: &'static str, id: String },

    #[error("No volunteer can host task {0}")]
    Resource(uuid::Uuid),

    #[error("Result aggregation failed: {0}")]
    Aggregation(String),

    #[error("Illegal workflow transition {from:?} -> {to:?}")]
    IllegalTransition { from: WorkflowStatus, to: WorkflowStatus },

    #[error("Dataset split failed: {0}")]
    Split(String),

    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse message payload: {0}")]
    DeserializationError(#[from] serde_json::Error),
}

impl Error {
    /// Lookup failures mark stale or duplicate events; handlers drop the
    /// offending message instead of failing the receive loop.
    pub fn lookup(kind: &'static str, id: impl ToString) -> Self {
        Error::Lookup { kind, id: id.to_string() }
    }

    pub fn protocol(channel: impl ToString, reason: impl ToString) -> Self {
        Error::Protocol { channel: channel.to_string(), reason: reason.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
