//! # Trustplane
//!
//! The trust store of a workload-identity control plane: trust bundles,
//! attested nodes, registration entries, federation relationships, join
//! tokens and CA journals, together with the per-kind event logs agents use to
//! keep their view of authorized entries current.
//!
//! ## Architecture
//!
//! ```text
//! callers → MetricsDataStore → DataStore backend (MemoryDataStore)
//!                                   ↑
//!            MaintenanceService ────┘   (periodic pruning)
//! ```
//!
//! ## Core Components
//!
//! - **Storage**: the [`storage::DataStore`] contract, the in-memory backend
//!   and the forwarding decorators generated from one operation table
//! - **Domain**: identifiers, bundles, entries, events and the CA journal
//!   state machine
//! - **Services**: authorized-entry resolution and maintenance
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use trustplane::{config, Result, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = config::load(None)?;
//!     let server = Server::new(config)?;
//!     server.run(CancellationToken::new()).await
//! }
//! ```

pub mod config;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod services;
pub mod storage;
pub mod utils;

pub use config::AppConfig;
pub use errors::{Result, TrustplaneError};
pub use storage::{DataStore, MemoryDataStore, MetricsDataStore};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{DatastoreBackend, DatastoreConfig};
use crate::observability::MetricsRecorder;
use crate::services::{AuthorizedEntryResolver, MaintenanceService};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Build the configured storage stack
pub fn open_datastore(config: &DatastoreConfig) -> Arc<dyn DataStore> {
    let backend = match config.backend {
        DatastoreBackend::Memory => MemoryDataStore::new(),
    };
    if config.enable_call_metrics {
        Arc::new(MetricsDataStore::new(backend, Arc::new(MetricsRecorder::new())))
    } else {
        Arc::new(backend)
    }
}

/// Owns the storage stack and the background services
pub struct Server {
    config: AppConfig,
    store: Arc<dyn DataStore>,
}

impl Server {
    /// Create a new server instance with the given configuration
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let store = open_datastore(&config.datastore);
        Ok(Self { config, store })
    }

    /// Create a server around an existing store
    pub fn with_store(config: AppConfig, store: Arc<dyn DataStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, store })
    }

    pub fn store(&self) -> Arc<dyn DataStore> {
        self.store.clone()
    }

    pub fn resolver(&self) -> AuthorizedEntryResolver {
        AuthorizedEntryResolver::new(self.store.clone())
    }

    /// Run background services until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(app_name = APP_NAME, version = VERSION, "Starting trust store");
        observability::log_config_info(&self.config);

        let maintenance = if self.config.maintenance.enabled {
            let service =
                MaintenanceService::new(self.store.clone(), self.config.maintenance.clone());
            Some(service.spawn(shutdown.clone()))
        } else {
            None
        };

        shutdown.cancelled().await;
        if let Some(handle) = maintenance {
            handle.await.map_err(|e| {
                TrustplaneError::internal_with_source("Maintenance task failed", Box::new(e))
            })?;
        }
        tracing::info!("Trust store stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_server_runs_until_shutdown() {
        let server = Server::new(AppConfig::default()).unwrap();
        assert_eq!(server.store().count_bundles().await.unwrap(), 0);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));
        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        tokio_test::assert_ok!(result);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = AppConfig::default();
        config.observability.service_name.clear();
        assert!(Server::new(config).is_err());
    }
}
