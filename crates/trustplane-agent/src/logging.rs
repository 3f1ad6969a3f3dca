//! Agent log setup, shared with the server's subscriber configuration

use trustplane::config::ObservabilityConfig;
use trustplane::observability;

use crate::config::AgentConfig;
use crate::error::Result;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
/// Returns false when a subscriber was already installed.
pub fn init_logging(config: &AgentConfig) -> Result<bool> {
    let observability = ObservabilityConfig {
        service_name: "trustplane-agent".to_string(),
        log_level: config.log_level.clone(),
        json_logging: config.json_logs,
        ..Default::default()
    };
    Ok(observability::init_logging(&observability)?)
}
