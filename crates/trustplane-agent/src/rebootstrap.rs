//! Reaction to a server the agent no longer recognizes.
//!
//! ```text
//! Trusted ──untrusted identity──▶ Suspect ──mode allows──▶ Rebootstrapping
//!    ▲                              │                        │        │
//!    └────── trusted identity ──────┘                     success  failure
//!    ▲                                                       │        ▼
//!    └───────────────────────────────────────────────────────┘     Failed
//! ```
//!
//! `Failed` re-enters `Rebootstrapping` after a backoff when retries are
//! enabled and stays put otherwise.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use trustplane::utils::{Clock, RetryConfig, SystemClock};

use crate::attestor::NodeAttestor;
use crate::config::{RebootstrapConfig, RebootstrapMode};
use crate::error::{AgentError, Result};
use crate::sync::{SyncReport, Synchronizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    Trusted,
    Suspect,
    Rebootstrapping,
    Failed,
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trusted => "trusted",
            Self::Suspect => "suspect",
            Self::Rebootstrapping => "rebootstrapping",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the agent should do after reporting a server identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootstrapAction {
    /// The server is trusted; carry on syncing
    Continue,
    /// Do not talk to the server and do not re-attest
    Hold,
    /// Re-run node attestation now
    Rebootstrap,
}

#[derive(Debug)]
pub struct RebootstrapPolicy {
    config: RebootstrapConfig,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
    state: TrustState,
    /// Last successful rotation, or the policy's creation time before one
    last_rotation: DateTime<Utc>,
    failures: u32,
    next_retry_at: Option<DateTime<Utc>>,
}

impl RebootstrapPolicy {
    pub fn new(config: RebootstrapConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RebootstrapConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            retry: RetryConfig::default(),
            last_rotation: clock.now(),
            clock,
            state: TrustState::Trusted,
            failures: 0,
            next_retry_at: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> TrustState {
        self.state
    }

    pub fn last_rotation(&self) -> DateTime<Utc> {
        self.last_rotation
    }

    pub fn record_rotation(&mut self) {
        self.record_rotation_at(self.clock.now());
    }

    pub fn record_rotation_at(&mut self, at: DateTime<Utc>) {
        self.last_rotation = at;
    }

    /// Decide whether the agent may talk to the server before a sync pass.
    /// A failed rebootstrap whose retry is due re-attests without syncing.
    pub fn before_sync(&mut self) -> RebootstrapAction {
        match self.state {
            TrustState::Trusted | TrustState::Suspect => RebootstrapAction::Continue,
            TrustState::Rebootstrapping => RebootstrapAction::Hold,
            TrustState::Failed if self.retry_due() => {
                self.transition(TrustState::Rebootstrapping);
                RebootstrapAction::Rebootstrap
            }
            TrustState::Failed => RebootstrapAction::Hold,
        }
    }

    /// Report whether the identity the server just presented is recognized
    pub fn on_server_identity(&mut self, recognized: bool) -> RebootstrapAction {
        if recognized {
            return match self.state {
                TrustState::Trusted => RebootstrapAction::Continue,
                TrustState::Suspect => {
                    info!("Server identity recognized again");
                    self.transition(TrustState::Trusted);
                    RebootstrapAction::Continue
                }
                TrustState::Rebootstrapping | TrustState::Failed => RebootstrapAction::Hold,
            };
        }

        match self.state {
            TrustState::Trusted => {
                self.transition(TrustState::Suspect);
                self.decide()
            }
            TrustState::Suspect => self.decide(),
            TrustState::Rebootstrapping => RebootstrapAction::Hold,
            TrustState::Failed if self.retry_due() => {
                self.transition(TrustState::Rebootstrapping);
                RebootstrapAction::Rebootstrap
            }
            TrustState::Failed => RebootstrapAction::Hold,
        }
    }

    /// Report the outcome of a rebootstrap attempt
    pub fn on_attestation_result(&mut self, succeeded: bool) {
        let now = self.clock.now();
        if succeeded {
            self.failures = 0;
            self.next_retry_at = None;
            self.last_rotation = now;
            self.transition(TrustState::Trusted);
            return;
        }

        self.failures += 1;
        let retrying = self.config.retry_bootstrap && !self.retry.exhausted(self.failures);
        self.next_retry_at = if retrying {
            let backoff = self.retry.backoff_for_attempt(self.failures);
            chrono::Duration::from_std(backoff).ok().map(|backoff| now + backoff)
        } else {
            None
        };
        self.transition(TrustState::Failed);
        match self.next_retry_at {
            Some(at) => warn!(failures = self.failures, retry_at = %at, "Rebootstrap failed"),
            None => error!(failures = self.failures, "Rebootstrap failed, not retrying"),
        }
    }

    /// A failed rebootstrap may be retried now
    pub fn retry_due(&self) -> bool {
        self.state == TrustState::Failed
            && self.next_retry_at.is_some_and(|at| at <= self.clock.now())
    }

    fn decide(&mut self) -> RebootstrapAction {
        let allowed = match self.config.mode {
            RebootstrapMode::Never => false,
            RebootstrapMode::Always => true,
            RebootstrapMode::Auto => {
                let elapsed = self.clock.now() - self.last_rotation;
                self.config.retry_bootstrap
                    && chrono::Duration::from_std(self.config.delay)
                        .is_ok_and(|delay| elapsed > delay)
            }
        };
        if allowed {
            self.transition(TrustState::Rebootstrapping);
            RebootstrapAction::Rebootstrap
        } else {
            RebootstrapAction::Hold
        }
    }

    fn transition(&mut self, to: TrustState) {
        if self.state != to {
            info!(from = %self.state, to = %to, "Trust state changed");
            metrics::counter!("agent_trust_state_transitions_total", "to" => to.to_string())
                .increment(1);
            self.state = to;
        }
    }
}

/// Runs the policy's decisions: re-attests through the [`NodeAttestor`] and
/// resynchronizes after a successful rebootstrap
pub struct Rebootstrapper {
    policy: Mutex<RebootstrapPolicy>,
    attestor: Arc<dyn NodeAttestor>,
    sync: Arc<Synchronizer>,
}

impl Rebootstrapper {
    pub fn new(
        policy: RebootstrapPolicy,
        attestor: Arc<dyn NodeAttestor>,
        sync: Arc<Synchronizer>,
    ) -> Self {
        Self { policy: Mutex::new(policy), attestor, sync }
    }

    pub fn state(&self) -> Result<TrustState> {
        Ok(self.policy.lock()?.state())
    }

    pub fn record_rotation(&self) -> Result<()> {
        self.policy.lock()?.record_rotation();
        Ok(())
    }

    /// Ask the policy whether a sync pass may run
    pub fn before_sync(&self) -> Result<RebootstrapAction> {
        Ok(self.policy.lock()?.before_sync())
    }

    /// A sync pass verified the server
    pub fn server_trusted(&self) -> Result<RebootstrapAction> {
        Ok(self.policy.lock()?.on_server_identity(true))
    }

    /// A sync pass failed with an untrusted server identity. Returns the
    /// report of the post-rebootstrap sync when one ran.
    pub async fn server_untrusted(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<SyncReport>> {
        let action = self.policy.lock()?.on_server_identity(false);
        match action {
            RebootstrapAction::Rebootstrap => self.rebootstrap(cancel).await.map(Some),
            RebootstrapAction::Continue | RebootstrapAction::Hold => Ok(None),
        }
    }

    /// Re-attest and resynchronize. The policy must already be in
    /// `Rebootstrapping`.
    pub async fn rebootstrap(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        info!(attestation_type = self.attestor.attestation_type(), "Rebootstrapping agent");
        let attested = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::canceled("node attestation")),
            result = self.attestor.attest() => result,
        };
        let attested = attested.and_then(|result| {
            if &result.agent_id == self.sync.agent_id() {
                Ok(result)
            } else {
                Err(AgentError::attestation(format!(
                    "re-attested as '{}', expected '{}'",
                    result.agent_id,
                    self.sync.agent_id()
                )))
            }
        });

        let result = match attested {
            Ok(result) => result,
            Err(e) => {
                self.policy.lock()?.on_attestation_result(false);
                return Err(e);
            }
        };
        self.sync.set_trust_bundle(result.bundle)?;
        self.policy.lock()?.on_attestation_result(true);
        self.sync.force_full_sync(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::time::Duration as StdDuration;
    use trustplane::utils::ManualClock;

    fn config(mode: RebootstrapMode, retry_bootstrap: bool) -> RebootstrapConfig {
        RebootstrapConfig { mode, delay: StdDuration::from_secs(3600), retry_bootstrap }
    }

    #[test]
    fn test_never_holds_in_suspect() {
        let mut policy = RebootstrapPolicy::new(config(RebootstrapMode::Never, true));
        assert_eq!(policy.on_server_identity(false), RebootstrapAction::Hold);
        assert_eq!(policy.state(), TrustState::Suspect);
        assert_eq!(policy.on_server_identity(false), RebootstrapAction::Hold);
        assert_eq!(policy.on_server_identity(true), RebootstrapAction::Continue);
        assert_eq!(policy.state(), TrustState::Trusted);
    }

    #[test]
    fn test_always_rebootstraps_immediately() {
        let mut policy = RebootstrapPolicy::new(config(RebootstrapMode::Always, false));
        assert_eq!(policy.on_server_identity(false), RebootstrapAction::Rebootstrap);
        assert_eq!(policy.state(), TrustState::Rebootstrapping);
        // already in progress
        assert_eq!(policy.on_server_identity(false), RebootstrapAction::Hold);
        policy.on_attestation_result(true);
        assert_eq!(policy.state(), TrustState::Trusted);
    }

    #[test]
    fn test_auto_requires_retry_flag() {
        let clock = ManualClock::default();
        let mut policy = RebootstrapPolicy::with_clock(
            config(RebootstrapMode::Auto, false),
            Arc::new(clock.clone()),
        );
        clock.advance(Duration::hours(2));
        assert_eq!(policy.on_server_identity(false), RebootstrapAction::Hold);
    }

    #[test]
    fn test_failure_backs_off_when_retrying() {
        let clock = ManualClock::default();
        let retry = RetryConfig {
            max_attempts: Some(2),
            initial_backoff: StdDuration::from_secs(10),
            max_backoff: StdDuration::from_secs(60),
            backoff_multiplier: 2.0,
        };
        let mut policy = RebootstrapPolicy::with_clock(
            config(RebootstrapMode::Always, true),
            Arc::new(clock.clone()),
        )
        .with_retry(retry);

        assert_eq!(policy.on_server_identity(false), RebootstrapAction::Rebootstrap);
        policy.on_attestation_result(false);
        assert_eq!(policy.state(), TrustState::Failed);
        assert!(!policy.retry_due());
        assert_eq!(policy.on_server_identity(false), RebootstrapAction::Hold);

        clock.advance(Duration::seconds(10));
        assert!(policy.retry_due());
        assert_eq!(policy.on_server_identity(false), RebootstrapAction::Rebootstrap);
        policy.on_attestation_result(false);
        clock.advance(Duration::seconds(20));
        assert_eq!(policy.on_server_identity(false), RebootstrapAction::Rebootstrap);

        // third failure exceeds max_attempts
        policy.on_attestation_result(false);
        clock.advance(Duration::hours(1));
        assert!(!policy.retry_due());
        assert_eq!(policy.state(), TrustState::Failed);
    }

    #[test]
    fn test_failure_is_terminal_without_retry() {
        let clock = ManualClock::default();
        let mut policy = RebootstrapPolicy::with_clock(
            config(RebootstrapMode::Always, false),
            Arc::new(clock.clone()),
        );
        policy.on_server_identity(false);
        policy.on_attestation_result(false);
        clock.advance(Duration::days(1));
        assert!(!policy.retry_due());
        assert_eq!(policy.on_server_identity(true), RebootstrapAction::Hold);
        assert_eq!(policy.before_sync(), RebootstrapAction::Hold);
        assert_eq!(policy.state(), TrustState::Failed);
    }

    #[test]
    fn test_before_sync_holds_until_retry_is_due() {
        let clock = ManualClock::default();
        let retry = RetryConfig {
            max_attempts: Some(3),
            initial_backoff: StdDuration::from_secs(30),
            max_backoff: StdDuration::from_secs(60),
            backoff_multiplier: 2.0,
        };
        let mut policy = RebootstrapPolicy::with_clock(
            config(RebootstrapMode::Always, true),
            Arc::new(clock.clone()),
        )
        .with_retry(retry);
        assert_eq!(policy.before_sync(), RebootstrapAction::Continue);

        policy.on_server_identity(false);
        assert_eq!(policy.before_sync(), RebootstrapAction::Hold);
        policy.on_attestation_result(false);
        assert_eq!(policy.before_sync(), RebootstrapAction::Hold);

        clock.advance(Duration::seconds(30));
        assert_eq!(policy.before_sync(), RebootstrapAction::Rebootstrap);
        assert_eq!(policy.state(), TrustState::Rebootstrapping);
    }
}
