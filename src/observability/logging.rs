//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. The filter comes from `RUST_LOG`
//! when set and from the configured log level otherwise.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{AppConfig, ObservabilityConfig};
use crate::errors::{Result, TrustplaneError};

/// Build the log filter: `RUST_LOG` first, then the configured directive
pub fn env_filter(config: &ObservabilityConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            TrustplaneError::config(format!("Invalid log level '{}': {}", config.log_level, e))
        }),
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed (repeated
/// initialization in tests), which is not an error.
pub fn init_logging(config: &ObservabilityConfig) -> Result<bool> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json_logging {
        registry.with(fmt::layer().json().with_current_span(true)).try_init().is_ok()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init().is_ok()
    };
    Ok(installed)
}

/// Log configuration at startup
pub fn log_config_info(config: &AppConfig) {
    tracing::info!(
        datastore_backend = ?config.datastore.backend,
        call_metrics = config.datastore.enable_call_metrics,
        maintenance_enabled = config.maintenance.enabled,
        maintenance_interval_secs = config.maintenance.interval_seconds,
        event_retention_secs = config.maintenance.event_retention_seconds,
        metrics_enabled = config.observability.enable_metrics,
        "Trust store configuration"
    );
}
