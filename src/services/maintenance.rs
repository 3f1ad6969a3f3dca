//! Periodic pruning of the trust store.
//!
//! Each pass prunes node and entry events past the retention window, expired
//! registration entries, expired join tokens, attested nodes whose
//! certificate expired more than the grace period ago, and CA journals whose
//! authorities all expired more than the grace period ago.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::MaintenanceConfig;
use crate::errors::{Result, TrustplaneError};
use crate::storage::DataStore;
use crate::utils::{Clock, SystemClock};

/// Counts of records removed by one pruning pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub node_events: usize,
    pub entry_events: usize,
    pub registration_entries: usize,
    pub join_tokens: usize,
    pub attested_nodes: usize,
    pub ca_journals: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.node_events
            + self.entry_events
            + self.registration_entries
            + self.join_tokens
            + self.attested_nodes
            + self.ca_journals
    }
}

pub struct MaintenanceService {
    store: Arc<dyn DataStore>,
    config: MaintenanceConfig,
    clock: Arc<dyn Clock>,
}

impl MaintenanceService {
    pub fn new(store: Arc<dyn DataStore>, config: MaintenanceConfig) -> Self {
        Self { store, config, clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run one pruning pass. The first failing step aborts the pass.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<PruneReport> {
        let now = self.clock.now();
        let retention = self.config.event_retention();

        let report = PruneReport {
            node_events: self.store.prune_attested_node_events(retention).await?,
            entry_events: self.store.prune_registration_entry_events(retention).await?,
            registration_entries: self.store.prune_registration_entries(now).await?,
            join_tokens: self.store.prune_join_tokens(now).await?,
            attested_nodes: self
                .store
                .prune_attested_expired_nodes(
                    before(now, self.config.node_expiry_grace())?,
                    self.config.include_non_reattestable_nodes,
                )
                .await?,
            ca_journals: self
                .store
                .prune_ca_journals(before(now, self.config.ca_journal_grace())?)
                .await?,
        };

        if report.total() > 0 {
            info!(
                node_events = report.node_events,
                entry_events = report.entry_events,
                registration_entries = report.registration_entries,
                join_tokens = report.join_tokens,
                attested_nodes = report.attested_nodes,
                ca_journals = report.ca_journals,
                "Pruned trust store"
            );
        } else {
            debug!("Nothing to prune");
        }
        Ok(report)
    }

    /// Prune on every interval tick until `shutdown` is cancelled. Failed
    /// passes are logged and retried on the next tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval_seconds, "Starting trust store maintenance");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stopping trust store maintenance");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "Maintenance pass failed");
                    }
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

fn before(now: DateTime<Utc>, grace: Duration) -> Result<DateTime<Utc>> {
    let grace = chrono::Duration::from_std(grace)
        .map_err(|_| TrustplaneError::config("maintenance grace period is out of range"))?;
    Ok(now - grace)
}
