//! rekon-engine — pipeline-run correlation.
//!
//! Drivers report each reconcile outcome on `pipelines.driver.result`.
//! The engine matches those outcomes to the steps of every pipeline bound
//! to the resource type and keeps the resulting `PipelineRun` records in
//! the store.

pub mod engine;
pub mod error;
pub mod progress;

pub use engine::{DriverEvents, ENGINE_CONSUMER, ENGINE_MAX_DELIVER, Engine};
pub use error::{EngineError, EngineResult};
pub use progress::{Transition, apply_result, complete_if_done, skip_unhandled};
