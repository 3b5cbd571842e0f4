//! Engine error types.

use rekon_bus::BusError;
use rekon_state::StateError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("malformed pipeline event: {0}")]
    Malformed(String),
}

impl EngineError {
    /// Worth redelivering the event that caused this error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::State(e) if e.is_retryable())
    }
}
