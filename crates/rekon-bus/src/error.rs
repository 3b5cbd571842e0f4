//! Bus error types.

use thiserror::Error;

/// Errors surfaced by the event bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no stream captures subject: {0}")]
    NoStream(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("consumer not found: {stream}/{consumer}")]
    ConsumerNotFound { stream: String, consumer: String },

    #[error("consumer '{consumer}' overlaps work-queue consumer '{existing}' on stream {stream}")]
    ConsumerConflict {
        stream: String,
        consumer: String,
        existing: String,
    },

    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("bus journal error: {0}")]
    Journal(String),

    #[error("bus is closed")]
    Closed,
}

/// Result type alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;
