//! # Error Types
//!
//! Error taxonomy shared by the trust store, the event log and the authority
//! journal. Every backend and decorator speaks this type so that errors pass
//! through wrappers unmodified.

/// Custom result type for trustplane operations
pub type Result<T> = std::result::Result<T, TrustplaneError>;

/// Main error type for the trust store and its services
#[derive(thiserror::Error, Debug)]
pub enum TrustplaneError {
    /// The addressed record does not exist
    #[error("Resource not found: {resource_type} with ID '{id}'")]
    NotFound { resource_type: String, id: String },

    /// A record with the same key (or uniqueness key) already exists
    #[error("Resource already exists: {resource_type} with ID '{id}'")]
    AlreadyExists { resource_type: String, id: String },

    /// Input rejected before any mutation was attempted
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String, field: Option<String> },

    /// Storage failure
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The caller gave up on the operation
    #[error("Operation canceled: {operation}")]
    Canceled { operation: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl TrustplaneError {
    /// Create a new not-found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a new already-exists error
    pub fn already_exists<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::AlreadyExists { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a new invalid-argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument { message: message.into(), field: None }
    }

    /// Create a new invalid-argument error naming the offending field
    pub fn invalid_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::InvalidArgument { message: message.into(), field: Some(field.into()) }
    }

    /// Create an invalid-argument error from rejected record fields, naming
    /// the first failing field
    pub fn invalid_record(errors: validator::ValidationErrors) -> Self {
        let field = errors.errors().keys().min().map(|field| field.to_string());
        Self::InvalidArgument { message: errors.to_string(), field }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Create a new internal error with a source
    pub fn internal_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(source) }
    }

    /// Create a new canceled error
    pub fn canceled<S: Into<String>>(operation: S) -> Self {
        Self::Canceled { operation: operation.into() }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a new configuration error with a source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Stable machine-readable code, used as the status label in metrics
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::Internal { .. } => "internal",
            Self::Canceled { .. } => "canceled",
            Self::Config { .. } => "config",
        }
    }

    /// Check if the error is a transient fault worth retrying.
    ///
    /// Invalid arguments (including taint/revoke of unknown keys) are
    /// administrative mistakes and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }
}

impl From<config::ConfigError> for TrustplaneError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Failed to load configuration", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for TrustplaneError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::config(format!("Validation failed: {}", errors))
    }
}

impl<T> From<std::sync::PoisonError<T>> for TrustplaneError {
    fn from(error: std::sync::PoisonError<T>) -> Self {
        Self::internal(format!("Storage lock poisoned: {}", error))
    }
}
