//! Logging setup for the agent

use crate::config::LoggingConfig;
use fleet_core::Result;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber from config. The
/// `GPUFLEET_LOG` environment variable overrides the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_env("GPUFLEET_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.show_target);

    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    // A second init (tests) is fine; the first subscriber wins
    if let Err(e) = result {
        tracing::debug!("logging already initialized: {}", e);
    }
    Ok(())
}
