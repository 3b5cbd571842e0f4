//! rekon-state — the resource store for rekon.
//!
//! Backed by [redb](https://docs.rs/redb). Resource definitions,
//! resources, pipelines and pipeline runs are JSON-serialized into a
//! single table under hierarchical keys:
//!
//! | Key | Value |
//! |---|---|
//! | `/resource_definitions/{name}` | `ResourceDefinition` |
//! | `/resources/{type}/{name}` | `Resource` |
//! | `/pipelines/{name}` | `Pipeline` |
//! | `/runs/{run_id}/{pipeline}` | `PipelineRun` |
//!
//! redb serializes write transactions, so check-then-insert inside one
//! transaction gives create-if-absent semantics per key. Listing is a
//! range scan and returns records in key order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).
//! Async callers go through [`StateStore::call`], which bounds every
//! operation by the configured timeout.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
