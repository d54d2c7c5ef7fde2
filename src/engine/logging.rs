//! Tracing setup shared by the server and the device agent.

use tracing_subscriber::EnvFilter;

use crate::engine::config::{LogFormat, LoggingConfig};

const LOG_ENV: &str = "DEVFLEET_LOG";

/// Install the global subscriber.
///
/// `DEVFLEET_LOG` wins over `RUST_LOG`; the configured filter (or `info`) is
/// the fallback. Calling this twice is harmless: the second install is ignored.
pub fn init_tracing(config: &LoggingConfig) {
    let fallback = config.filter.clone().unwrap_or_else(|| "info".to_string());
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(fallback));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
