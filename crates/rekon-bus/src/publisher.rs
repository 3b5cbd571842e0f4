//! The publishing seam used by the service, drivers and engine.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::bus::{Bus, PubAck};
use crate::error::{BusError, BusResult};

/// Anything that can put a message on a subject.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<PubAck>;
}

#[async_trait]
impl Publisher for Bus {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<PubAck> {
        self.publish_async(subject, payload).await
    }
}

/// Records every publish instead of delivering it. Can be switched into a
/// failing mode to exercise error paths.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<(String, Bytes)>>>,
    failing: bool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher whose every publish fails with [`BusError::Closed`].
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.published().into_iter().map(|(s, _)| s).collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<PubAck> {
        if self.failing {
            return Err(BusError::Closed);
        }
        let mut published = self
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        published.push((subject.to_string(), payload));
        Ok(PubAck {
            stream: "recording".to_string(),
            seq: published.len() as u64,
        })
    }
}
