//! # Configuration Settings
//!
//! Defines the configuration structure for the trust store server.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::errors::{Result, TrustplaneError};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    /// Storage backend configuration
    #[validate(nested)]
    pub datastore: DatastoreConfig,

    /// Background pruning configuration
    #[validate(nested)]
    pub maintenance: MaintenanceConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(TrustplaneError::from)?;
        self.validate_custom()
    }

    fn validate_custom(&self) -> Result<()> {
        if self.maintenance.event_retention() < self.maintenance.interval() {
            return Err(TrustplaneError::config(
                "Event retention must not be shorter than the maintenance interval",
            ));
        }
        Ok(())
    }
}

/// Available storage backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreBackend {
    /// Process-local store; contents are lost on restart
    #[default]
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DatastoreConfig {
    pub backend: DatastoreBackend,

    /// Wrap the backend in the call-metrics decorator
    pub enable_call_metrics: bool,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self { backend: DatastoreBackend::Memory, enable_call_metrics: true }
    }
}

/// Periodic pruning of events and expired records
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Run the pruning pass in the background
    pub enabled: bool,

    /// Seconds between pruning passes
    #[validate(range(
        min = 1,
        max = 86400,
        message = "Maintenance interval must be between 1 second and 24 hours"
    ))]
    pub interval_seconds: u64,

    /// Events older than this are pruned
    #[validate(range(min = 1, message = "Event retention must be at least 1 second"))]
    pub event_retention_seconds: u64,

    /// Nodes whose certificate expired more than this long ago are pruned
    pub node_expiry_grace_seconds: u64,

    /// Also prune expired nodes that cannot reattest
    pub include_non_reattestable_nodes: bool,

    /// Journals whose authorities all expired more than this long ago are pruned
    pub ca_journal_grace_seconds: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            event_retention_seconds: 12 * 3600,
            node_expiry_grace_seconds: 24 * 3600,
            include_non_reattestable_nodes: false,
            ca_journal_grace_seconds: 24 * 3600,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn event_retention(&self) -> Duration {
        Duration::from_secs(self.event_retention_seconds)
    }

    pub fn node_expiry_grace(&self) -> Duration {
        Duration::from_secs(self.node_expiry_grace_seconds)
    }

    pub fn ca_journal_grace(&self) -> Duration {
        Duration::from_secs(self.ca_journal_grace_seconds)
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus exporter
    pub enable_metrics: bool,

    /// Metrics server port (0 = disabled)
    pub metrics_port: u16,

    /// Service name added as a global metrics label
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log filter directive (trace, debug, info, warn, error, or a full filter)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_port: 9090,
            service_name: "trustplane".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.datastore.backend, DatastoreBackend::Memory);
        assert_eq!(config.maintenance.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let mut config = AppConfig::default();
        config.maintenance.interval_seconds = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn test_retention_shorter_than_interval_rejected() {
        let mut config = AppConfig::default();
        config.maintenance.interval_seconds = 600;
        config.maintenance.event_retention_seconds = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metrics_bind_address() {
        let mut config = ObservabilityConfig::default();
        assert_eq!(config.metrics_bind_address().as_deref(), Some("0.0.0.0:9090"));
        config.metrics_port = 0;
        assert!(config.metrics_bind_address().is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"maintenance": {"interval_seconds": 30}}"#).unwrap();
        assert_eq!(config.maintenance.interval_seconds, 30);
        assert_eq!(config.maintenance.event_retention_seconds, 12 * 3600);
        assert_eq!(config.observability.service_name, "trustplane");
    }
}
