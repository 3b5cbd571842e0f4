//! Durable consumers and delivered messages.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::bus::{Bus, Settle};
use crate::error::BusResult;
use crate::subject::subject_matches;

/// Whether delivered messages must be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Every message must be acked, nak'ed or terminated. Unacknowledged
    /// messages are redelivered after `ack_wait`.
    Explicit,
    /// Messages count as acknowledged on delivery.
    None,
}

/// Where a new consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// From the oldest retained message.
    All,
    /// Only messages published after the consumer was created.
    New,
}

/// Configuration for a durable consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub durable_name: String,
    /// Subject filters; empty means every subject of the stream.
    pub filter_subjects: Vec<String>,
    pub ack_policy: AckPolicy,
    /// Upper bound on delivered-but-unacknowledged messages; 0 is unbounded.
    pub max_ack_pending: usize,
    pub ack_wait: Duration,
    /// Deliveries before a message is given up on; 0 is unbounded.
    pub max_deliver: u32,
    pub deliver_policy: DeliverPolicy,
}

impl ConsumerConfig {
    /// A durable, explicitly acknowledged consumer with default limits.
    pub fn durable(name: &str) -> Self {
        Self {
            durable_name: name.to_string(),
            filter_subjects: Vec::new(),
            ack_policy: AckPolicy::Explicit,
            max_ack_pending: 1000,
            ack_wait: Duration::from_secs(30),
            max_deliver: 0,
            deliver_policy: DeliverPolicy::All,
        }
    }

    pub fn with_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter_subjects = filters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_ack_pending(mut self, max: usize) -> Self {
        self.max_ack_pending = max;
        self
    }

    pub fn with_ack_wait(mut self, wait: Duration) -> Self {
        self.ack_wait = wait;
        self
    }

    pub fn with_max_deliver(mut self, max: u32) -> Self {
        self.max_deliver = max;
        self
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn with_deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    /// Does this consumer want messages on `subject`?
    pub fn matches(&self, subject: &str) -> bool {
        self.filter_subjects.is_empty()
            || self.filter_subjects.iter().any(|f| subject_matches(f, subject))
    }
}

/// Point-in-time view of a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub stream: String,
    pub name: String,
    /// Delivered and awaiting acknowledgment.
    pub num_ack_pending: usize,
    /// Waiting for redelivery.
    pub num_redelivered: usize,
    /// Retained messages past the cursor that match the filters.
    pub num_pending: usize,
    /// Total deliveries, redeliveries included.
    pub delivered: u64,
    pub config: ConsumerConfig,
}

/// An outstanding delivery.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pending {
    pub deadline: Instant,
    pub deliveries: u32,
}

/// Position and in-flight state of one durable consumer.
pub(crate) struct ConsumerState {
    pub config: ConsumerConfig,
    /// Next stream sequence to consider for first delivery.
    pub next_seq: u64,
    pub pending: BTreeMap<u64, Pending>,
    /// Messages queued for redelivery: seq → deliveries so far.
    pub redeliver: BTreeMap<u64, u32>,
    pub delivered: u64,
}

impl ConsumerState {
    pub fn new(config: ConsumerConfig, next_seq: u64) -> Self {
        Self {
            config,
            next_seq,
            pending: BTreeMap::new(),
            redeliver: BTreeMap::new(),
            delivered: 0,
        }
    }

    /// Earliest ack deadline among outstanding deliveries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Has a message delivered `deliveries` times used up `max_deliver`?
    pub fn exhausted(&self, deliveries: u32) -> bool {
        self.config.max_deliver > 0 && deliveries >= self.config.max_deliver
    }

    pub fn at_capacity(&self) -> bool {
        self.config.ack_policy == AckPolicy::Explicit
            && self.config.max_ack_pending > 0
            && self.pending.len() >= self.config.max_ack_pending
    }

    /// Move expired deliveries to the redelivery queue. Returns the
    /// sequences that exhausted `max_deliver` and were given up on.
    pub fn expire(&mut self, now: Instant) -> Vec<u64> {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();

        let mut exhausted = Vec::new();
        for seq in expired {
            if let Some(p) = self.pending.remove(&seq) {
                if self.exhausted(p.deliveries) {
                    exhausted.push(seq);
                } else {
                    self.redeliver.insert(seq, p.deliveries);
                }
            }
        }
        exhausted
    }
}

/// A message delivered to a consumer.
#[derive(Debug)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
    /// Stream sequence number.
    pub seq: u64,
    /// 1 on first delivery, higher on redelivery.
    pub deliveries: u32,
    pub published_at: SystemTime,
    pub(crate) acker: Option<Acker>,
}

#[derive(Debug, Clone)]
pub(crate) struct Acker {
    pub bus: Bus,
    pub stream: String,
    pub consumer: String,
}

impl Message {
    pub fn is_redelivery(&self) -> bool {
        self.deliveries > 1
    }

    /// Acknowledge successful processing.
    pub fn ack(&self) -> BusResult<()> {
        self.settle(Settle::Ack)
    }

    /// Negative acknowledgment: queue for immediate redelivery, unless the
    /// consumer's `max_deliver` is spent.
    pub fn nak(&self) -> BusResult<()> {
        self.settle(Settle::Nak)
    }

    /// Stop redelivering this message.
    pub fn term(&self) -> BusResult<()> {
        self.settle(Settle::Term)
    }

    fn settle(&self, how: Settle) -> BusResult<()> {
        match &self.acker {
            Some(a) => a.bus.settle(&a.stream, &a.consumer, self.seq, how),
            None => Ok(()),
        }
    }
}

/// Handle to a durable consumer. Cheap to clone; clones compete for the
/// same messages.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub(crate) bus: Bus,
    pub(crate) stream: String,
    pub(crate) name: String,
}

impl Consumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Wait for the next deliverable message. Returns `None` once the bus
    /// is closed or the consumer was deleted.
    pub async fn next(&self) -> Option<Message> {
        self.bus.next_message(&self.stream, &self.name).await
    }

    pub fn info(&self) -> BusResult<ConsumerInfo> {
        self.bus.consumer_info(&self.stream, &self.name)
    }

    /// Push-style delivery: invoke `handler` once per message on a
    /// background task until the bus closes.
    pub fn consume<F, Fut>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let consumer = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = consumer.next().await {
                handler(msg).await;
            }
            debug!(stream = %consumer.stream, consumer = %consumer.name, "consume loop finished");
        })
    }
}
