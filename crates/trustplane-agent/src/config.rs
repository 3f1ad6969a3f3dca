//! # Agent configuration
//!
//! Command-line flags (each overridable from the environment) and the
//! validated configuration the agent components consume.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use trustplane::domain::{SpiffeId, TrustDomain};

use crate::error::{AgentError, Result};

/// Shortest availability target the agent accepts
pub const MIN_AVAILABILITY_TARGET: Duration = Duration::from_secs(24 * 60 * 60);

/// What to do when the server presents an identity the agent does not trust
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebootstrapMode {
    /// Stay suspect and refuse to re-attest
    #[default]
    Never,
    /// Re-attest once the last successful rotation is older than the delay
    Auto,
    /// Re-attest immediately
    Always,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "trustplane-agent")]
#[command(about = "Trustplane workload identity agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct AgentArgs {
    /// Trust domain the agent belongs to
    #[arg(long, env = "TRUSTPLANE_AGENT_TRUST_DOMAIN")]
    pub trust_domain: String,

    /// SPIFFE ID the agent attested as
    #[arg(long, env = "TRUSTPLANE_AGENT_ID")]
    pub agent_id: String,

    /// Seconds between sync passes
    #[arg(long, env = "TRUSTPLANE_AGENT_SYNC_INTERVAL", default_value_t = 5)]
    pub sync_interval_secs: u64,

    /// Use the event log for incremental sync instead of full listing
    #[arg(
        long,
        env = "TRUSTPLANE_AGENT_USE_EVENT_SYNC",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub use_event_sync: bool,

    /// Soft limit on cached X.509 credentials
    #[arg(long, env = "TRUSTPLANE_AGENT_X509_CACHE_SIZE", default_value_t = 1000)]
    pub x509_svid_cache_max_size: usize,

    /// Soft limit on cached JWT credentials
    #[arg(long, env = "TRUSTPLANE_AGENT_JWT_CACHE_SIZE", default_value_t = 1000)]
    pub jwt_svid_cache_max_size: usize,

    #[arg(long, env = "TRUSTPLANE_AGENT_REBOOTSTRAP_MODE", value_enum, default_value_t)]
    pub rebootstrap_mode: RebootstrapMode,

    /// Minimum seconds since the last rotation before `auto` re-attests
    #[arg(long, env = "TRUSTPLANE_AGENT_REBOOTSTRAP_DELAY", default_value_t = 600)]
    pub rebootstrap_delay_secs: u64,

    /// Retry node attestation after a failure
    #[arg(long, env = "TRUSTPLANE_AGENT_RETRY_BOOTSTRAP")]
    pub retry_bootstrap: bool,

    /// Keep credentials valid for at least this many seconds of outage
    #[arg(long, env = "TRUSTPLANE_AGENT_AVAILABILITY_TARGET")]
    pub availability_target_secs: Option<u64>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "TRUSTPLANE_AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "TRUSTPLANE_AGENT_JSON_LOGS")]
    pub json_logs: bool,
}

/// Validated agent configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub trust_domain: TrustDomain,
    pub agent_id: SpiffeId,
    pub sync_interval: Duration,
    pub use_event_sync: bool,
    pub x509_svid_cache_max_size: usize,
    pub jwt_svid_cache_max_size: usize,
    pub rebootstrap: RebootstrapConfig,
    pub availability_target: Option<Duration>,
    pub log_level: String,
    pub json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootstrapConfig {
    pub mode: RebootstrapMode,
    pub delay: Duration,
    pub retry_bootstrap: bool,
}

impl Default for RebootstrapConfig {
    fn default() -> Self {
        Self {
            mode: RebootstrapMode::Never,
            delay: Duration::from_secs(600),
            retry_bootstrap: false,
        }
    }
}

impl AgentConfig {
    /// Defaults for an agent with the given identity
    pub fn new(agent_id: SpiffeId) -> Self {
        Self {
            trust_domain: agent_id.trust_domain().clone(),
            agent_id,
            sync_interval: Duration::from_secs(5),
            use_event_sync: true,
            x509_svid_cache_max_size: 1000,
            jwt_svid_cache_max_size: 1000,
            rebootstrap: RebootstrapConfig::default(),
            availability_target: None,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.agent_id.is_member_of(&self.trust_domain) {
            return Err(AgentError::config(format!(
                "agent ID '{}' is not a member of trust domain '{}'",
                self.agent_id, self.trust_domain
            )));
        }
        if self.sync_interval.is_zero() {
            return Err(AgentError::config("sync interval must be positive"));
        }
        if self.x509_svid_cache_max_size == 0 || self.jwt_svid_cache_max_size == 0 {
            return Err(AgentError::config("credential cache sizes must be positive"));
        }
        if let Some(target) = self.availability_target {
            if target < MIN_AVAILABILITY_TARGET {
                return Err(AgentError::config(format!(
                    "availability target must be at least {}s",
                    MIN_AVAILABILITY_TARGET.as_secs()
                )));
            }
        }
        Ok(())
    }
}

impl TryFrom<AgentArgs> for AgentConfig {
    type Error = AgentError;

    fn try_from(args: AgentArgs) -> Result<Self> {
        let trust_domain = TrustDomain::new(args.trust_domain)?;
        let agent_id = SpiffeId::parse(&args.agent_id)?;
        let config = Self {
            trust_domain,
            agent_id,
            sync_interval: Duration::from_secs(args.sync_interval_secs),
            use_event_sync: args.use_event_sync,
            x509_svid_cache_max_size: args.x509_svid_cache_max_size,
            jwt_svid_cache_max_size: args.jwt_svid_cache_max_size,
            rebootstrap: RebootstrapConfig {
                mode: args.rebootstrap_mode,
                delay: Duration::from_secs(args.rebootstrap_delay_secs),
                retry_bootstrap: args.retry_bootstrap,
            },
            availability_target: args.availability_target_secs.map(Duration::from_secs),
            log_level: args.log_level,
            json_logs: args.json_logs,
        };
        config.validate()?;
        Ok(config)
    }
}
