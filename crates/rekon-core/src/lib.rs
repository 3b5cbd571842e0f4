//! rekon-core — shared types for the rekon control plane.
//!
//! Holds the persisted data model (resource definitions, resources,
//! pipelines, pipeline runs), the bus wire envelopes exchanged between the
//! service, drivers and the engine, subject naming, JSON-Schema
//! validation, and the `rekon.toml` config parser.

pub mod config;
pub mod id;
pub mod message;
pub mod schema;
pub mod subject;
pub mod types;

pub use config::RekonConfig;
pub use message::*;
pub use schema::SchemaError;
pub use types::*;
