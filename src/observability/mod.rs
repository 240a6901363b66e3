//! Process-wide tracing subscriber
//!
//! `logging.level` is an `EnvFilter` directive (`RUST_LOG` overrides it at
//! config load). `logging.json` switches to one JSON object per event.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// Filter for `level`, falling back to `info` when it does not parse
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.level))
        .with_target(true);

    if config.json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    }
}
