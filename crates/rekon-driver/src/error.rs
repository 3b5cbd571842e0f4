//! Driver error types.

use rekon_bus::BusError;
use thiserror::Error;

/// Errors raised while validating or binding a driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid driver: {0}")]
    Validation(String),

    #[error("unknown driver kind '{kind}' for driver {name}")]
    UnknownKind { name: String, kind: String },

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Errors from writing a log line. Never fail a reconciliation.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to encode log line: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to ship log line: {0}")]
    Ship(#[from] BusError),
}
