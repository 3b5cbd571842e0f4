//! rekon-bus — the event bus connecting the service, drivers and engine.
//!
//! An in-process, subject-addressed publish/subscribe transport modelled on
//! durable streaming brokers:
//!
//! - **Streams** capture every message published on their subject filters
//!   and apply a retention policy (`Limits`, `Interest`, `WorkQueue`).
//! - **Durable consumers** are named cursors over a stream. Their state
//!   (delivery position, unacknowledged messages) lives in the bus, so a
//!   dropped handle can be re-bound by name without losing position.
//! - **Explicit acknowledgment** with `max_ack_pending` flow control and
//!   `ack_wait` redelivery gives at-least-once delivery.
//! - **Journal.** A bus opened over a redb database writes streams, messages
//!   and consumer positions through, so unacknowledged deliveries survive a
//!   restart. `Bus::new()` keeps everything in memory.
//!
//! # Components
//!
//! - **`subject`** — token-based subject matching (`*`, `>`)
//! - **`stream`** — stream configuration and retention
//! - **`consumer`** — consumer configuration, handles and delivered messages
//! - **`bus`** — the broker itself
//! - **`journal`** — redb persistence behind `Bus::open`
//! - **`publisher`** — the `Publisher` seam plus a recording test double
//! - **`topology`** — the standard rekon streams

pub mod bus;
pub mod consumer;
pub mod error;
mod journal;
pub mod publisher;
pub mod stream;
pub mod subject;
pub mod topology;

pub use bus::{Bus, PubAck, PubAckFuture};
pub use consumer::{AckPolicy, Consumer, ConsumerConfig, ConsumerInfo, DeliverPolicy, Message};
pub use error::{BusError, BusResult};
pub use publisher::{Publisher, RecordingPublisher};
pub use stream::{RetentionPolicy, StreamConfig, StreamInfo};
