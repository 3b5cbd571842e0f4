//! rekon.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RekonConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub bus: BusConfig,
    pub logging: LoggingConfig,
    pub drivers: Vec<DriverConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Upper bound on graceful shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("/var/lib/rekon"),
            shutdown_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

/// When a driver acknowledges a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acknowledge on receipt, before reconciling. Failed or crashed
    /// reconciliations are never redelivered.
    BeforeReconcile,
    /// Acknowledge once reconcile returns. A panic, or a daemon restart
    /// mid-reconcile, leaves the message pending and the bus redelivers it.
    #[default]
    AfterReconcile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub ack_mode: AckMode,
    pub ack_wait_ms: u64,
    pub max_deliver: u32,
    /// Retained log lines before the oldest are discarded.
    pub log_stream_max: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::default(),
            ack_wait_ms: 30_000,
            max_deliver: 5,
            log_stream_max: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub filter: Option<String>,
}

/// A driver hosted by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverConfig {
    pub name: String,
    /// Built-in driver implementation, e.g. `event-log`.
    pub kind: String,
    pub resources: Vec<String>,
    #[serde(default = "default_events")]
    pub events: Vec<String>,
}

fn default_events() -> Vec<String> {
    vec![crate::message::EVENT_WILDCARD.to_string()]
}

impl RekonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RekonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check the parts of the config that cannot be expressed in types.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for driver in &self.drivers {
            if driver.name.is_empty() {
                anyhow::bail!("driver name must not be empty");
            }
            if !seen.insert(driver.name.as_str()) {
                anyhow::bail!("driver '{}' configured twice", driver.name);
            }
            if driver.resources.is_empty() {
                anyhow::bail!("driver '{}' must reconcile at least one resource", driver.name);
            }
        }
        Ok(())
    }
}
