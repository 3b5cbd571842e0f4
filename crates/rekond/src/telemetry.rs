//! Tracing subscriber setup.

use rekon_core::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info,rekond=debug,rekon=debug";

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// filter, which wins over [`DEFAULT_FILTER`].
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!(e))
}
