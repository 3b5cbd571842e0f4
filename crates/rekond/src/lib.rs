//! rekond — the rekon daemon.
//!
//! One process hosting every rekon subsystem:
//! - Resource store (redb)
//! - Event bus with the standard streams
//! - Pipeline engine
//! - Configured drivers, one dispatch loop each
//! - REST API

pub mod daemon;
pub mod telemetry;

pub use daemon::Daemon;
