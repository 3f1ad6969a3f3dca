//! # Trustplane agent
//!
//! Agent-side half of the trust store: keeps a local cache of the
//! registration entries this agent is authorized for, holds the credential
//! caches built from them, and decides what to do when the server stops
//! presenting a recognized identity.
//!
//! ```text
//! Agent::run ─tick─▶ Synchronizer ──▶ EntrySource (server)
//!                        │ UntrustedServer
//!                        ▼
//!                  Rebootstrapper ──▶ NodeAttestor
//! ```

pub mod attestor;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod rebootstrap;
pub mod source;
pub mod svid_cache;
pub mod sync;

pub use attestor::{AttestationResult, JoinTokenAttestor, NodeAttestor};
pub use cache::{CacheSnapshot, EntryCache};
pub use config::{AgentArgs, AgentConfig, RebootstrapConfig, RebootstrapMode};
pub use error::{AgentError, Result};
pub use rebootstrap::{RebootstrapAction, RebootstrapPolicy, Rebootstrapper, TrustState};
pub use source::{EntrySource, ServerIdentity, StoreEntrySource};
pub use svid_cache::{Svid, SvidCache, SvidPin};
pub use sync::{SyncCursor, SyncKind, SyncReport, Synchronizer};

use std::sync::Arc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trustplane::utils::{Clock, RetryConfig, SystemClock};

pub struct Agent {
    config: AgentConfig,
    sync: Arc<Synchronizer>,
    attestor: Arc<dyn NodeAttestor>,
    rebootstrapper: Rebootstrapper,
    retry: RetryConfig,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        source: Arc<dyn EntrySource>,
        attestor: Arc<dyn NodeAttestor>,
    ) -> Result<Self> {
        Self::with_clock(config, source, attestor, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new) with the rebootstrap policy driven by `clock`
    pub fn with_clock(
        config: AgentConfig,
        source: Arc<dyn EntrySource>,
        attestor: Arc<dyn NodeAttestor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let sync = Arc::new(Synchronizer::new(&config, source));
        let policy = RebootstrapPolicy::with_clock(config.rebootstrap, clock);
        let rebootstrapper = Rebootstrapper::new(policy, attestor.clone(), sync.clone());
        Ok(Self { config, sync, attestor, rebootstrapper, retry: RetryConfig::default() })
    }

    /// Backoff applied between failed sync passes
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn synchronizer(&self) -> Arc<Synchronizer> {
        self.sync.clone()
    }

    pub fn rebootstrapper(&self) -> &Rebootstrapper {
        &self.rebootstrapper
    }

    /// Attest the node for the first time and fill the cache
    pub async fn bootstrap(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let result = self.attestor.attest().await?;
        if &result.agent_id != self.sync.agent_id() {
            return Err(AgentError::attestation(format!(
                "attested as '{}', configured as '{}'",
                result.agent_id,
                self.sync.agent_id()
            )));
        }
        self.sync.set_trust_bundle(result.bundle)?;
        self.rebootstrapper.record_rotation()?;
        info!(agent_id = %result.agent_id, "Agent bootstrapped");
        self.sync.force_full_sync(cancel).await
    }

    /// The issuance path rotated this agent's own credential
    pub fn record_svid_rotation(&self) -> Result<()> {
        self.rebootstrapper.record_rotation()
    }

    /// One sync pass, routing an untrusted server to the rebootstrap policy.
    /// Returns `None` when the pass was held back.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<Option<SyncReport>> {
        match self.rebootstrapper.before_sync()? {
            RebootstrapAction::Continue => {}
            RebootstrapAction::Rebootstrap => {
                return self.rebootstrapper.rebootstrap(cancel).await.map(Some);
            }
            RebootstrapAction::Hold => {
                debug!(state = %self.rebootstrapper.state()?, "Holding sync");
                return Ok(None);
            }
        }

        match self.sync.sync_once(cancel).await {
            Ok(report) => match self.rebootstrapper.server_trusted()? {
                RebootstrapAction::Continue => Ok(Some(report)),
                RebootstrapAction::Hold | RebootstrapAction::Rebootstrap => Ok(None),
            },
            Err(e) if e.is_untrusted_server() => self.rebootstrapper.server_untrusted(cancel).await,
            Err(e) => Err(e),
        }
    }

    /// Sync on every interval tick until `cancel` fires. Transient failures
    /// back off and the last good cache keeps serving.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            agent_id = %self.config.agent_id,
            interval_secs = self.config.sync_interval.as_secs(),
            event_sync = self.config.use_event_sync,
            "Starting agent sync loop"
        );

        let mut failures = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.tick(&cancel).await {
                Ok(_) => failures = 0,
                Err(e) if e.is_canceled() && cancel.is_cancelled() => break,
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    let delay = self.retry.backoff_for_attempt(failures);
                    warn!(error = %e, failures, ?delay, "Sync failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
                Err(e) => error!(error = %e, code = e.code(), "Sync failed"),
            }
        }

        info!("Agent sync loop stopped");
        Ok(())
    }
}
