//! Stream configuration and retention.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerState;
use crate::subject::subject_matches;

/// How long a stream keeps a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep messages until `max_messages` is exceeded, oldest first.
    Limits,
    /// Keep a message only while some consumer that matched it at publish
    /// time has not acknowledged it. Messages nobody is interested in are
    /// discarded on publish. Used for fan-out.
    Interest,
    /// Each message is delivered to one worker and removed once
    /// acknowledged. Consumers may not overlap. Used for fan-in.
    WorkQueue,
}

/// Configuration for a named stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    /// Upper bound on retained messages; `None` is unbounded.
    pub max_messages: Option<usize>,
}

impl StreamConfig {
    pub fn new(name: &str, subjects: &[&str], retention: RetentionPolicy) -> Self {
        Self {
            name: name.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            retention,
            max_messages: None,
        }
    }

    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = Some(max);
        self
    }

    /// Does this stream capture `subject`?
    pub fn captures(&self, subject: &str) -> bool {
        self.subjects.iter().any(|f| subject_matches(f, subject))
    }
}

/// Point-in-time view of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    /// Messages currently retained.
    pub messages: usize,
    /// Sequence number of the last published message.
    pub last_seq: u64,
    pub consumers: Vec<String>,
}

/// A message held by a stream.
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub subject: String,
    pub payload: Bytes,
    pub published_at: SystemTime,
    /// Consumers that still owe an acknowledgment (interest retention).
    pub interest: BTreeSet<String>,
}

/// A publish worked out but not yet applied.
pub(crate) struct Staged {
    pub seq: u64,
    /// `None` when retention discards the message straight away.
    pub message: Option<StoredMessage>,
    /// Older sequences pushed out by `max_messages`.
    pub evicted: Vec<u64>,
}

/// Mutable state of one stream inside the bus.
pub(crate) struct StreamState {
    pub config: StreamConfig,
    pub messages: BTreeMap<u64, StoredMessage>,
    pub last_seq: u64,
    pub consumers: BTreeMap<String, ConsumerState>,
}

impl StreamState {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            messages: BTreeMap::new(),
            last_seq: 0,
            consumers: BTreeMap::new(),
        }
    }

    /// Work out what publishing on `subject` would store, without changing
    /// anything. The result is applied with [`StreamState::commit`].
    pub fn stage(&self, subject: &str, payload: Bytes) -> Staged {
        let seq = self.last_seq + 1;

        let interest: BTreeSet<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.config.matches(subject))
            .map(|(name, _)| name.clone())
            .collect();

        let discard = (self.config.retention == RetentionPolicy::Interest && interest.is_empty())
            || self.config.max_messages == Some(0);
        if discard {
            return Staged {
                seq,
                message: None,
                evicted: Vec::new(),
            };
        }

        let evicted = match self.config.max_messages {
            Some(max) => {
                let excess = (self.messages.len() + 1).saturating_sub(max);
                self.messages.keys().take(excess).copied().collect()
            }
            None => Vec::new(),
        };

        Staged {
            seq,
            message: Some(StoredMessage {
                subject: subject.to_string(),
                payload,
                published_at: SystemTime::now(),
                interest,
            }),
            evicted,
        }
    }

    /// Apply a staged publish. Returns its sequence number.
    pub fn commit(&mut self, staged: Staged) -> u64 {
        self.last_seq = staged.seq;
        for seq in &staged.evicted {
            self.messages.remove(seq);
        }
        if let Some(message) = staged.message {
            self.messages.insert(staged.seq, message);
        }
        staged.seq
    }

    /// A consumer has finished with `seq`; drop the message if retention
    /// allows. Returns whether the message was dropped.
    pub fn release(&mut self, seq: u64, consumer: &str) -> bool {
        match self.config.retention {
            RetentionPolicy::Limits => false,
            RetentionPolicy::WorkQueue => self.messages.remove(&seq).is_some(),
            RetentionPolicy::Interest => {
                let drained = match self.messages.get_mut(&seq) {
                    Some(msg) => {
                        msg.interest.remove(consumer);
                        msg.interest.is_empty()
                    }
                    None => false,
                };
                drained && self.messages.remove(&seq).is_some()
            }
        }
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            name: self.config.name.clone(),
            messages: self.messages.len(),
            last_seq: self.last_seq,
            consumers: self.consumers.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(stream: &mut StreamState, subject: &str, payload: &'static [u8]) -> u64 {
        let staged = stream.stage(subject, Bytes::from_static(payload));
        stream.commit(staged)
    }

    #[test]
    fn captures_by_filter() {
        let config = StreamConfig::new(
            "messages",
            &["resources.>", "events.>"],
            RetentionPolicy::Interest,
        );
        assert!(config.captures("resources.pipe"));
        assert!(config.captures("events.runs.deploy"));
        assert!(!config.captures("pipelines.driver.result"));
    }

    #[test]
    fn interest_stream_discards_unwanted_messages() {
        let mut stream = StreamState::new(StreamConfig::new(
            "messages",
            &["resources.>"],
            RetentionPolicy::Interest,
        ));
        let seq = append(&mut stream, "resources.pipe", b"{}");
        assert_eq!(seq, 1);
        assert_eq!(stream.info().messages, 0);
        assert_eq!(stream.info().last_seq, 1);
    }

    #[test]
    fn limits_stream_drops_oldest() {
        let mut stream = StreamState::new(
            StreamConfig::new("logs", &["logs.>"], RetentionPolicy::Limits).with_max_messages(2),
        );
        for _ in 0..3 {
            append(&mut stream, "logs.a", b"line");
        }
        let seqs: Vec<u64> = stream.messages.keys().copied().collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn work_queue_release_removes_message() {
        let mut stream = StreamState::new(StreamConfig::new(
            "pipeline-engine",
            &["pipelines.>"],
            RetentionPolicy::WorkQueue,
        ));
        let seq = append(&mut stream, "pipelines.driver.result", b"{}");
        assert_eq!(stream.info().messages, 1);
        assert!(stream.release(seq, "engine"));
        assert_eq!(stream.info().messages, 0);
        assert!(!stream.release(seq, "engine"));
    }

    #[test]
    fn staging_leaves_the_stream_untouched() {
        let mut stream = StreamState::new(
            StreamConfig::new("logs", &["logs.>"], RetentionPolicy::Limits).with_max_messages(1),
        );
        append(&mut stream, "logs.a", b"first");

        let staged = stream.stage("logs.a", Bytes::from_static(b"second"));
        assert_eq!(staged.seq, 2);
        assert_eq!(staged.evicted, vec![1]);
        assert_eq!(stream.info().last_seq, 1);
        assert_eq!(stream.info().messages, 1);

        stream.commit(staged);
        let seqs: Vec<u64> = stream.messages.keys().copied().collect();
        assert_eq!(seqs, vec![2]);
    }
}
