//! # Configuration Management
//!
//! Server configuration is read from an optional file and then from
//! `TRUSTPLANE__*` environment variables, which take precedence. Nested keys
//! are separated by a double underscore, for example
//! `TRUSTPLANE__MAINTENANCE__INTERVAL_SECONDS=30`.

pub mod settings;

pub use settings::{
    AppConfig, DatastoreBackend, DatastoreConfig, MaintenanceConfig, ObservabilityConfig,
};

use std::path::Path;
use tracing::debug;

use crate::errors::Result;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "TRUSTPLANE";

/// Load and validate configuration from an optional file plus the environment
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let mut builder = ::config::Config::builder();
    if let Some(path) = path {
        debug!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(::config::File::from(path).required(true));
    }
    builder = builder.add_source(
        ::config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}
