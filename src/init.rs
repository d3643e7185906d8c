//! Initialization helpers for the application startup.

use crate::config::Config;

/// Sets up the tracing subscriber with the configured filters. The
/// environment variable takes precedence over the config file level.
pub fn setup_logging(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
