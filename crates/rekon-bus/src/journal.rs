//! Durable bus state in redb.
//!
//! Streams, retained messages and consumer positions are written through
//! on every change, in the same database as the resource store. When a
//! bus is reopened, deliveries that were still unacknowledged come back
//! queued for redelivery, with their delivery counts kept.
//!
//! Interest in a retained message is not stored: a consumer still owes an
//! ack for `seq` when its filters match and `seq` is either past its cursor
//! or outstanding.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::consumer::{ConsumerConfig, ConsumerState};
use crate::error::{BusError, BusResult};
use crate::stream::{RetentionPolicy, StoredMessage, StreamConfig, StreamState};

/// Stream configuration and last sequence, keyed by stream name.
pub const STREAMS: TableDefinition<&str, &[u8]> = TableDefinition::new("bus_streams");

/// Retained messages keyed by `{stream}/{seq:020}`.
pub const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("bus_messages");

/// Consumer cursors and outstanding deliveries keyed by `{stream}/{consumer}`.
pub const CONSUMERS: TableDefinition<&str, &[u8]> = TableDefinition::new("bus_consumers");

macro_rules! journal_err {
    () => {
        |e| BusError::Journal(e.to_string())
    };
}

#[derive(Serialize, Deserialize)]
struct StreamRecord {
    config: StreamConfig,
    last_seq: u64,
}

#[derive(Serialize, Deserialize)]
struct MessageRecord {
    stream: String,
    seq: u64,
    subject: String,
    payload: Vec<u8>,
    published_at: SystemTime,
}

#[derive(Serialize, Deserialize)]
struct ConsumerRecord {
    stream: String,
    config: ConsumerConfig,
    next_seq: u64,
    /// seq → deliveries so far, for every delivery not yet settled.
    outstanding: BTreeMap<u64, u32>,
    delivered: u64,
}

impl ConsumerRecord {
    fn owes(&self, seq: u64, subject: &str) -> bool {
        self.config.matches(subject) && (seq >= self.next_seq || self.outstanding.contains_key(&seq))
    }
}

#[derive(Clone, Copy)]
enum Table {
    Streams,
    Messages,
    Consumers,
}

impl Table {
    fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Table::Streams => STREAMS,
            Table::Messages => MESSAGES,
            Table::Consumers => CONSUMERS,
        }
    }
}

enum Op {
    Put(Table, String, Result<Vec<u8>, String>),
    Remove(Table, String),
}

/// Changes written in one transaction.
#[derive(Default)]
pub(crate) struct Batch {
    ops: Vec<Op>,
}

fn message_key(stream: &str, seq: u64) -> String {
    format!("{stream}/{seq:020}")
}

fn consumer_key(stream: &str, consumer: &str) -> String {
    format!("{stream}/{consumer}")
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    serde_json::to_vec(value).map_err(|e| e.to_string())
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn stream(&mut self, config: &StreamConfig, last_seq: u64) {
        let record = StreamRecord {
            config: config.clone(),
            last_seq,
        };
        self.ops
            .push(Op::Put(Table::Streams, config.name.clone(), encode(&record)));
    }

    pub fn message(&mut self, stream: &str, seq: u64, message: &StoredMessage) {
        let record = MessageRecord {
            stream: stream.to_string(),
            seq,
            subject: message.subject.clone(),
            payload: message.payload.to_vec(),
            published_at: message.published_at,
        };
        self.ops
            .push(Op::Put(Table::Messages, message_key(stream, seq), encode(&record)));
    }

    pub fn remove_message(&mut self, stream: &str, seq: u64) {
        self.ops
            .push(Op::Remove(Table::Messages, message_key(stream, seq)));
    }

    pub fn consumer(&mut self, stream: &str, name: &str, state: &ConsumerState) {
        let mut outstanding = state.redeliver.clone();
        outstanding.extend(state.pending.iter().map(|(seq, p)| (*seq, p.deliveries)));
        let record = ConsumerRecord {
            stream: stream.to_string(),
            config: state.config.clone(),
            next_seq: state.next_seq,
            outstanding,
            delivered: state.delivered,
        };
        self.ops
            .push(Op::Put(Table::Consumers, consumer_key(stream, name), encode(&record)));
    }

    pub fn remove_consumer(&mut self, stream: &str, name: &str) {
        self.ops
            .push(Op::Remove(Table::Consumers, consumer_key(stream, name)));
    }
}

/// Write-through persistence for one bus.
pub(crate) struct Journal {
    db: Arc<Database>,
}

impl Journal {
    pub fn open(db: Arc<Database>) -> BusResult<Self> {
        let txn = db.begin_write().map_err(journal_err!())?;
        for table in [STREAMS, MESSAGES, CONSUMERS] {
            txn.open_table(table).map_err(journal_err!())?;
        }
        txn.commit().map_err(journal_err!())?;
        Ok(Self { db })
    }

    pub fn commit(&self, batch: Batch) -> BusResult<()> {
        let txn = self.db.begin_write().map_err(journal_err!())?;
        for op in batch.ops {
            match op {
                Op::Put(table, key, bytes) => {
                    let bytes = bytes.map_err(BusError::Journal)?;
                    let mut t = txn.open_table(table.definition()).map_err(journal_err!())?;
                    t.insert(key.as_str(), bytes.as_slice())
                        .map_err(journal_err!())?;
                }
                Op::Remove(table, key) => {
                    let mut t = txn.open_table(table.definition()).map_err(journal_err!())?;
                    t.remove(key.as_str()).map_err(journal_err!())?;
                }
            }
        }
        txn.commit().map_err(journal_err!())?;
        Ok(())
    }

    /// Rebuild every stream with its messages and consumers.
    pub fn load(&self) -> BusResult<BTreeMap<String, StreamState>> {
        let txn = self.db.begin_read().map_err(journal_err!())?;

        let mut streams = BTreeMap::new();
        let table = txn.open_table(STREAMS).map_err(journal_err!())?;
        for entry in table.iter().map_err(journal_err!())? {
            let (_, value) = entry.map_err(journal_err!())?;
            let record: StreamRecord = serde_json::from_slice(value.value()).map_err(journal_err!())?;
            let mut state = StreamState::new(record.config);
            state.last_seq = record.last_seq;
            streams.insert(state.config.name.clone(), state);
        }

        let mut consumers: BTreeMap<String, Vec<(String, ConsumerRecord)>> = BTreeMap::new();
        let table = txn.open_table(CONSUMERS).map_err(journal_err!())?;
        for entry in table.iter().map_err(journal_err!())? {
            let (_, value) = entry.map_err(journal_err!())?;
            let record: ConsumerRecord = serde_json::from_slice(value.value()).map_err(journal_err!())?;
            consumers
                .entry(record.stream.clone())
                .or_default()
                .push((record.config.durable_name.clone(), record));
        }

        let table = txn.open_table(MESSAGES).map_err(journal_err!())?;
        for entry in table.iter().map_err(journal_err!())? {
            let (_, value) = entry.map_err(journal_err!())?;
            let record: MessageRecord = serde_json::from_slice(value.value()).map_err(journal_err!())?;
            let Some(stream) = streams.get_mut(&record.stream) else {
                continue;
            };
            let interest: BTreeSet<String> = consumers
                .get(&record.stream)
                .map(|list| {
                    list.iter()
                        .filter(|(_, c)| c.owes(record.seq, &record.subject))
                        .map(|(name, _)| name.clone())
                        .collect()
                })
                .unwrap_or_default();
            if stream.config.retention == RetentionPolicy::Interest && interest.is_empty() {
                continue;
            }
            stream.messages.insert(
                record.seq,
                StoredMessage {
                    subject: record.subject,
                    payload: Bytes::from(record.payload),
                    published_at: record.published_at,
                    interest,
                },
            );
        }

        for (stream_name, list) in consumers {
            let Some(stream) = streams.get_mut(&stream_name) else {
                continue;
            };
            for (name, record) in list {
                let mut state = ConsumerState::new(record.config, record.next_seq);
                state.delivered = record.delivered;
                state.redeliver = record.outstanding;
                if !state.redeliver.is_empty() {
                    debug!(stream = %stream_name, consumer = %name, outstanding = state.redeliver.len(), "restoring unacknowledged deliveries");
                }
                stream.consumers.insert(name, state);
            }
        }

        Ok(streams)
    }
}
