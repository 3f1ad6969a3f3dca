//! Agent error types

use thiserror::Error;
use trustplane::domain::SpiffeId;
use trustplane::TrustplaneError;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    /// Failure reported by the trust store or the entry source
    #[error(transparent)]
    Store(#[from] TrustplaneError),

    /// The server presented an identity the agent does not recognize
    #[error("Untrusted server identity '{server_id}' (authority '{authority_id}')")]
    UntrustedServer { server_id: SpiffeId, authority_id: String },

    #[error("Node attestation failed: {message}")]
    Attestation { message: String },

    #[error("Operation canceled: {operation}")]
    Canceled { operation: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl AgentError {
    pub fn attestation<S: Into<String>>(message: S) -> Self {
        Self::Attestation { message: message.into() }
    }

    pub fn canceled<S: Into<String>>(operation: S) -> Self {
        Self::Canceled { operation: operation.into() }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    /// Transient failures the sync loop retries with backoff. An untrusted
    /// server is never retried silently.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_retryable(),
            Self::Attestation { .. } => true,
            Self::UntrustedServer { .. } | Self::Canceled { .. } | Self::Config { .. } => false,
        }
    }

    pub fn is_untrusted_server(&self) -> bool {
        matches!(self, Self::UntrustedServer { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. } | Self::Store(TrustplaneError::Canceled { .. }))
    }

    /// Short label for metrics
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(err) => err.code(),
            Self::UntrustedServer { .. } => "untrusted_server",
            Self::Attestation { .. } => "attestation",
            Self::Canceled { .. } => "canceled",
            Self::Config { .. } => "config",
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for AgentError {
    fn from(error: std::sync::PoisonError<T>) -> Self {
        Self::Store(TrustplaneError::from(error))
    }
}
