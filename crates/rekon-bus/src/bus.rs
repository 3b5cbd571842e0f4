//! The bus: streams, publishing, and consumer delivery.
//!
//! All state sits behind one mutex that is never held across an await.
//! Waiting consumers park on a shared `Notify` and are woken by publishes,
//! acknowledgments and `close()`; ack deadlines are honoured with a timed
//! wait so expired deliveries are redelivered without outside help.
//!
//! A bus opened with [`Bus::open`] writes every change through to its
//! journal while the lock is held, so the journal never runs ahead of or
//! behind the order in which changes were applied.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use redb::Database;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::consumer::{
    AckPolicy, Acker, Consumer, ConsumerConfig, ConsumerInfo, ConsumerState, DeliverPolicy,
    Message, Pending,
};
use crate::error::{BusError, BusResult};
use crate::journal::{Batch, Journal};
use crate::stream::{RetentionPolicy, StreamConfig, StreamInfo, StreamState};
use crate::subject::{filters_overlap, is_valid_filter, is_valid_subject};

/// Acknowledgment of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    pub stream: String,
    pub seq: u64,
}

/// Completion of [`Bus::publish_async`]. The in-process bus stores the
/// message before returning, so the future is already resolved; callers
/// may await it for the ack or drop it.
pub type PubAckFuture = std::future::Ready<BusResult<PubAck>>;

/// How a delivered message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settle {
    Ack,
    Nak,
    Term,
}

enum Delivery {
    Ready(Message),
    /// Nothing deliverable; wake at the deadline (if any) to redeliver.
    Wait(Option<Instant>),
}

type Streams = BTreeMap<String, StreamState>;

struct Inner {
    streams: Mutex<Streams>,
    journal: Option<Journal>,
    notify: Notify,
    closed: AtomicBool,
}

/// In-process event bus. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("closed", &self.is_closed())
            .field("durable", &self.inner.journal.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// A bus that keeps everything in memory.
    pub fn new() -> Self {
        Self::with_state(BTreeMap::new(), None)
    }

    /// A bus journaled to `db`. Streams, retained messages and consumers
    /// stored there are restored; deliveries that were never settled are
    /// queued for redelivery.
    pub fn open(db: Arc<Database>) -> BusResult<Self> {
        let journal = Journal::open(db)?;
        let streams = journal.load()?;
        let outstanding: usize = streams
            .values()
            .flat_map(|s| s.consumers.values())
            .map(|c| c.redeliver.len())
            .sum();
        info!(streams = streams.len(), outstanding, "bus journal opened");
        Ok(Self::with_state(streams, Some(journal)))
    }

    fn with_state(streams: Streams, journal: Option<Journal>) -> Self {
        Self {
            inner: Arc::new(Inner {
                streams: Mutex::new(streams),
                journal,
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn streams(&self) -> MutexGuard<'_, Streams> {
        self.inner
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_open(&self) -> BusResult<()> {
        if self.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    /// Write `batch` to the journal, if there is one.
    fn persist(&self, batch: Batch) -> BusResult<()> {
        match &self.inner.journal {
            Some(journal) if !batch.is_empty() => journal.commit(batch),
            _ => Ok(()),
        }
    }

    // ── Streams ────────────────────────────────────────────────────

    /// Create a stream, or update the configuration of an existing one.
    pub fn add_stream(&self, config: StreamConfig) -> BusResult<StreamInfo> {
        self.check_open()?;
        if config.name.is_empty() {
            return Err(BusError::InvalidConfig("stream name must not be empty".into()));
        }
        if config.subjects.is_empty() {
            return Err(BusError::InvalidConfig(format!(
                "stream {} has no subjects",
                config.name
            )));
        }
        if let Some(bad) = config.subjects.iter().find(|s| !is_valid_filter(s)) {
            return Err(BusError::InvalidSubject(bad.clone()));
        }

        let mut streams = self.streams();
        for (name, other) in streams.iter() {
            if *name == config.name {
                continue;
            }
            let clash = config.subjects.iter().any(|a| {
                other.config.subjects.iter().any(|b| filters_overlap(a, b))
            });
            if clash {
                return Err(BusError::InvalidConfig(format!(
                    "stream {} subjects overlap stream {name}",
                    config.name
                )));
            }
        }

        let last_seq = streams.get(&config.name).map_or(0, |s| s.last_seq);
        let mut batch = Batch::default();
        batch.stream(&config, last_seq);
        self.persist(batch)?;

        let info = match streams.get_mut(&config.name) {
            Some(existing) => {
                existing.config = config;
                existing.info()
            }
            None => {
                let name = config.name.clone();
                let state = StreamState::new(config);
                let info = state.info();
                streams.insert(name, state);
                info
            }
        };
        debug!(stream = %info.name, "stream ready");
        Ok(info)
    }

    pub fn stream_info(&self, name: &str) -> BusResult<StreamInfo> {
        self.streams()
            .get(name)
            .map(StreamState::info)
            .ok_or_else(|| BusError::StreamNotFound(name.to_string()))
    }

    // ── Publishing ─────────────────────────────────────────────────

    /// Store a message on the stream that captures `subject`.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> BusResult<PubAck> {
        self.check_open()?;
        if !is_valid_subject(subject) {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }

        let ack = {
            let mut streams = self.streams();
            let stream = streams
                .values_mut()
                .find(|s| s.config.captures(subject))
                .ok_or_else(|| BusError::NoStream(subject.to_string()))?;

            let staged = stream.stage(subject, payload.into());
            let mut batch = Batch::default();
            batch.stream(&stream.config, staged.seq);
            if let Some(message) = &staged.message {
                batch.message(&stream.config.name, staged.seq, message);
            }
            for seq in &staged.evicted {
                batch.remove_message(&stream.config.name, *seq);
            }
            self.persist(batch)?;

            PubAck {
                stream: stream.config.name.clone(),
                seq: stream.commit(staged),
            }
        };
        debug!(%subject, stream = %ack.stream, seq = ack.seq, "message published");
        self.inner.notify.notify_waiters();
        Ok(ack)
    }

    /// Fire-and-forget publish.
    pub fn publish_async(&self, subject: &str, payload: impl Into<Bytes>) -> PubAckFuture {
        std::future::ready(self.publish(subject, payload))
    }

    // ── Consumers ──────────────────────────────────────────────────

    /// Create a durable consumer, or rebind to and reconfigure an existing
    /// one without losing its position or in-flight messages.
    pub fn create_or_update_consumer(
        &self,
        stream_name: &str,
        config: ConsumerConfig,
    ) -> BusResult<Consumer> {
        self.check_open()?;
        let name = config.durable_name.clone();
        if name.is_empty() {
            return Err(BusError::InvalidConfig("durable name must not be empty".into()));
        }

        let mut streams = self.streams();
        let stream = streams
            .get_mut(stream_name)
            .ok_or_else(|| BusError::StreamNotFound(stream_name.to_string()))?;

        for filter in &config.filter_subjects {
            let covered = is_valid_filter(filter)
                && stream
                    .config
                    .subjects
                    .iter()
                    .any(|s| filters_overlap(s, filter));
            if !covered {
                return Err(BusError::InvalidSubject(filter.clone()));
            }
        }

        if stream.config.retention == RetentionPolicy::WorkQueue {
            let mine = effective_filters(&config, &stream.config);
            for (other_name, other) in &stream.consumers {
                if *other_name == name {
                    continue;
                }
                let theirs = effective_filters(&other.config, &stream.config);
                let overlap = mine
                    .iter()
                    .any(|a| theirs.iter().any(|b| filters_overlap(a, b)));
                if overlap {
                    return Err(BusError::ConsumerConflict {
                        stream: stream_name.to_string(),
                        consumer: name,
                        existing: other_name.clone(),
                    });
                }
            }
        }

        let start = match config.deliver_policy {
            DeliverPolicy::All => stream
                .messages
                .keys()
                .next()
                .copied()
                .unwrap_or(stream.last_seq + 1),
            DeliverPolicy::New => stream.last_seq + 1,
        };

        let mut batch = Batch::default();
        match stream.consumers.get_mut(&name) {
            Some(existing) => {
                let previous = std::mem::replace(&mut existing.config, config);
                batch.consumer(stream_name, &name, existing);
                if let Err(e) = self.persist(batch) {
                    existing.config = previous;
                    return Err(e);
                }
                debug!(stream = %stream_name, consumer = %name, "consumer updated");
            }
            None => {
                let state = ConsumerState::new(config, start);
                batch.consumer(stream_name, &name, &state);
                self.persist(batch)?;
                stream.consumers.insert(name.clone(), state);
                debug!(stream = %stream_name, consumer = %name, start, "consumer created");
            }
        }
        drop(streams);
        self.inner.notify.notify_waiters();

        Ok(Consumer {
            bus: self.clone(),
            stream: stream_name.to_string(),
            name,
        })
    }

    /// Bind to an existing durable consumer by name.
    pub fn consumer(&self, stream_name: &str, name: &str) -> BusResult<Consumer> {
        self.consumer_info(stream_name, name)?;
        Ok(Consumer {
            bus: self.clone(),
            stream: stream_name.to_string(),
            name: name.to_string(),
        })
    }

    /// Remove a consumer, releasing its interest in retained messages.
    pub fn delete_consumer(&self, stream_name: &str, name: &str) -> BusResult<()> {
        {
            let mut streams = self.streams();
            let stream = streams
                .get_mut(stream_name)
                .ok_or_else(|| BusError::StreamNotFound(stream_name.to_string()))?;
            if stream.consumers.remove(name).is_none() {
                return Err(BusError::ConsumerNotFound {
                    stream: stream_name.to_string(),
                    consumer: name.to_string(),
                });
            }

            let mut batch = Batch::default();
            batch.remove_consumer(stream_name, name);
            if stream.config.retention == RetentionPolicy::Interest {
                let seqs: Vec<u64> = stream
                    .messages
                    .iter()
                    .filter(|(_, m)| m.interest.contains(name))
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in seqs {
                    if stream.release(seq, name) {
                        batch.remove_message(stream_name, seq);
                    }
                }
            }
            self.persist(batch)?;
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    pub fn consumer_info(&self, stream_name: &str, name: &str) -> BusResult<ConsumerInfo> {
        let streams = self.streams();
        let stream = streams
            .get(stream_name)
            .ok_or_else(|| BusError::StreamNotFound(stream_name.to_string()))?;
        let consumer = stream
            .consumers
            .get(name)
            .ok_or_else(|| BusError::ConsumerNotFound {
                stream: stream_name.to_string(),
                consumer: name.to_string(),
            })?;
        let num_pending = stream
            .messages
            .range(consumer.next_seq..)
            .filter(|(_, m)| consumer.config.matches(&m.subject))
            .count();
        Ok(ConsumerInfo {
            stream: stream_name.to_string(),
            name: name.to_string(),
            num_ack_pending: consumer.pending.len(),
            num_redelivered: consumer.redeliver.len(),
            num_pending,
            delivered: consumer.delivered,
            config: consumer.config.clone(),
        })
    }

    // ── Delivery ───────────────────────────────────────────────────

    pub(crate) async fn next_message(&self, stream: &str, consumer: &str) -> Option<Message> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so no wake-up is lost.
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }

            let deadline = match self.poll_delivery(stream, consumer) {
                Ok(Delivery::Ready(msg)) => return Some(msg),
                Ok(Delivery::Wait(deadline)) => deadline,
                Err(e) => {
                    debug!(%stream, %consumer, error = %e, "consumer no longer deliverable");
                    return None;
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn poll_delivery(&self, stream_name: &str, consumer_name: &str) -> BusResult<Delivery> {
        let mut streams = self.streams();
        let mut batch = Batch::default();
        let delivery = self.pick(&mut streams, stream_name, consumer_name, &mut batch);
        // Logged only; the delivery still goes out.
        if let Err(e) = self.persist(batch) {
            warn!(stream = %stream_name, consumer = %consumer_name, error = %e, "failed to journal delivery");
        }
        delivery
    }

    fn pick(
        &self,
        streams: &mut Streams,
        stream_name: &str,
        consumer_name: &str,
        batch: &mut Batch,
    ) -> BusResult<Delivery> {
        let now = Instant::now();
        let stream = streams
            .get_mut(stream_name)
            .ok_or_else(|| BusError::StreamNotFound(stream_name.to_string()))?;
        let not_found = || BusError::ConsumerNotFound {
            stream: stream_name.to_string(),
            consumer: consumer_name.to_string(),
        };

        let exhausted = stream
            .consumers
            .get_mut(consumer_name)
            .ok_or_else(not_found)?
            .expire(now);
        if !exhausted.is_empty() {
            for seq in exhausted {
                warn!(stream = %stream_name, consumer = %consumer_name, seq, "max deliveries reached, dropping message");
                if stream.release(seq, consumer_name) {
                    batch.remove_message(stream_name, seq);
                }
            }
            if let Some(consumer) = stream.consumers.get(consumer_name) {
                batch.consumer(stream_name, consumer_name, consumer);
            }
        }

        let StreamState {
            messages, consumers, ..
        } = &mut *stream;
        let consumer = consumers.get_mut(consumer_name).ok_or_else(not_found)?;

        if consumer.at_capacity() {
            return Ok(Delivery::Wait(consumer.next_deadline()));
        }

        // Redeliveries first, oldest sequence first.
        let mut picked = None;
        while let Some((seq, deliveries)) = consumer.redeliver.pop_first() {
            if messages.contains_key(&seq) {
                picked = Some((seq, deliveries));
                break;
            }
        }

        if picked.is_none() {
            let next = messages
                .range(consumer.next_seq..)
                .find(|(_, m)| consumer.config.matches(&m.subject))
                .map(|(seq, _)| *seq);
            match next {
                Some(seq) => {
                    consumer.next_seq = seq + 1;
                    picked = Some((seq, 0));
                }
                None => {
                    consumer.next_seq = consumer.next_seq.max(stream_tail(messages));
                }
            }
        }

        let Some((seq, previous)) = picked else {
            return Ok(Delivery::Wait(consumer.next_deadline()));
        };
        let Some(stored) = messages.get(&seq) else {
            return Ok(Delivery::Wait(consumer.next_deadline()));
        };

        let deliveries = previous + 1;
        consumer.delivered += 1;
        let explicit = consumer.config.ack_policy == AckPolicy::Explicit;
        if explicit {
            consumer.pending.insert(
                seq,
                Pending {
                    deadline: now + consumer.config.ack_wait,
                    deliveries,
                },
            );
        }

        let message = Message {
            subject: stored.subject.clone(),
            payload: stored.payload.clone(),
            seq,
            deliveries,
            published_at: stored.published_at,
            acker: explicit.then(|| Acker {
                bus: self.clone(),
                stream: stream_name.to_string(),
                consumer: consumer_name.to_string(),
            }),
        };

        if !explicit && stream.release(seq, consumer_name) {
            batch.remove_message(stream_name, seq);
        }
        if let Some(consumer) = stream.consumers.get(consumer_name) {
            batch.consumer(stream_name, consumer_name, consumer);
        }
        Ok(Delivery::Ready(message))
    }

    pub(crate) fn settle(&self, stream_name: &str, consumer_name: &str, seq: u64, how: Settle) -> BusResult<()> {
        {
            let mut streams = self.streams();
            let stream = streams
                .get_mut(stream_name)
                .ok_or_else(|| BusError::StreamNotFound(stream_name.to_string()))?;
            let consumer = stream.consumers.get_mut(consumer_name).ok_or_else(|| {
                BusError::ConsumerNotFound {
                    stream: stream_name.to_string(),
                    consumer: consumer_name.to_string(),
                }
            })?;

            let release = match how {
                Settle::Nak => match consumer.pending.remove(&seq) {
                    Some(p) if consumer.exhausted(p.deliveries) => {
                        warn!(stream = %stream_name, consumer = %consumer_name, seq, "max deliveries reached, dropping message");
                        true
                    }
                    Some(p) => {
                        consumer.redeliver.insert(seq, p.deliveries);
                        false
                    }
                    None => false,
                },
                Settle::Ack | Settle::Term => {
                    consumer.pending.remove(&seq).is_some()
                        | consumer.redeliver.remove(&seq).is_some()
                }
            };

            let mut batch = Batch::default();
            if release && stream.release(seq, consumer_name) {
                batch.remove_message(stream_name, seq);
            }
            if let Some(consumer) = stream.consumers.get(consumer_name) {
                batch.consumer(stream_name, consumer_name, consumer);
            }
            self.persist(batch)?;
        }
        debug!(stream = %stream_name, consumer = %consumer_name, seq, ?how, "message settled");
        self.inner.notify.notify_waiters();
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Stop accepting publishes and release every waiting consumer.
    /// Settling messages already delivered is still allowed.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("bus closed");
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

fn effective_filters(consumer: &ConsumerConfig, stream: &StreamConfig) -> Vec<String> {
    if consumer.filter_subjects.is_empty() {
        stream.subjects.clone()
    } else {
        consumer.filter_subjects.clone()
    }
}

fn stream_tail(messages: &BTreeMap<u64, crate::stream::StoredMessage>) -> u64 {
    messages.keys().next_back().map(|s| s + 1).unwrap_or(0)
}
