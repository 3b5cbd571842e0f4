//! Structured driver logging.
//!
//! Every reconcile call gets a [`DriverLogger`] pre-labelled with the
//! driver name, run id and event. Lines go to a [`LogSink`]: the local
//! `tracing` pipeline, the `logs` stream on the bus, or memory in tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use rekon_bus::Publisher;
use rekon_core::subject::log_subject;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LogError;

pub const LABEL_DRIVER: &str = "driver";
pub const LABEL_RUN_ID: &str = "run_id";
pub const LABEL_EVENT: &str = "event";

/// One log line as shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub labels: BTreeMap<String, String>,
    pub message: String,
    /// Unix time in nanoseconds.
    pub timestamp: i64,
}

/// Destination for driver log lines.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, line: &LogLine) -> Result<(), LogError>;
}

/// Emits each line as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl LogSink for TracingSink {
    async fn write(&self, line: &LogLine) -> Result<(), LogError> {
        let driver = line.labels.get(LABEL_DRIVER).map(String::as_str).unwrap_or("");
        let run_id = line.labels.get(LABEL_RUN_ID).map(String::as_str).unwrap_or("");
        info!(target: "rekon::driver_log", %driver, %run_id, labels = ?line.labels, "{}", line.message);
        Ok(())
    }
}

/// Publishes each line as JSON on `logs.<driver>`.
#[derive(Clone)]
pub struct BusLogSink {
    publisher: Arc<dyn Publisher>,
}

impl BusLogSink {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl LogSink for BusLogSink {
    async fn write(&self, line: &LogLine) -> Result<(), LogError> {
        let driver = line
            .labels
            .get(LABEL_DRIVER)
            .map(String::as_str)
            .unwrap_or("unknown");
        let body = serde_json::to_vec(line)?;
        self.publisher
            .publish(&log_subject(driver), Bytes::from(body))
            .await?;
        Ok(())
    }
}

/// Keeps lines in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LogSink for MemorySink {
    async fn write(&self, line: &LogLine) -> Result<(), LogError> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line.clone());
        Ok(())
    }
}

/// Writes every line to each inner sink. All sinks are tried; the first
/// error is returned.
#[derive(Clone, Default)]
pub struct TeeSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl TeeSink {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl LogSink for TeeSink {
    async fn write(&self, line: &LogLine) -> Result<(), LogError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.write(line).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Logger handed to a reconciler for one delivery.
#[derive(Clone)]
pub struct DriverLogger {
    sink: Arc<dyn LogSink>,
    labels: BTreeMap<String, String>,
}

impl DriverLogger {
    pub fn new(sink: Arc<dyn LogSink>, driver: &str, run_id: &str, event: &str) -> Self {
        let labels = BTreeMap::from([
            (LABEL_DRIVER.to_string(), driver.to_string()),
            (LABEL_RUN_ID.to_string(), run_id.to_string()),
            (LABEL_EVENT.to_string(), event.to_string()),
        ]);
        Self { sink, labels }
    }

    /// Labels attached to every line.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Write `message`. Call-site labels override the defaults.
    pub async fn log(&self, labels: &[(&str, &str)], message: &str) -> Result<(), LogError> {
        let mut merged = self.labels.clone();
        for (k, v) in labels {
            merged.insert((*k).to_string(), (*v).to_string());
        }
        let line = LogLine {
            labels: merged,
            message: message.to_string(),
            timestamp: unix_nanos(),
        };
        self.sink.write(&line).await
    }
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
