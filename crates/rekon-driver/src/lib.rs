//! rekon-driver — the driver side of reconciliation.
//!
//! - **`driver`** — the `Reconciler` contract and `Driver` registration
//! - **`manager`** — binds a driver to the bus and runs its dispatch loop
//! - **`logger`** — labelled log lines and their sinks
//! - **`builtin`** — drivers the daemon can host from config

pub mod builtin;
pub mod driver;
pub mod error;
pub mod logger;
pub mod manager;

pub use driver::{Driver, DriverResult, Reconciler};
pub use error::{DriverError, LogError};
pub use logger::{BusLogSink, DriverLogger, LogLine, LogSink, MemorySink, TeeSink, TracingSink};
pub use manager::{DriverManager, ManagerConfig};
