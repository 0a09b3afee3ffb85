//! Error types for receive pipeline operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all receive pipeline operations
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Invalid argument '{name}': {message}")]
    InvalidArgument { name: String, message: String },

    #[error("Broker reported a timeout: {message}")]
    BrokerTimeout { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Timed out acquiring a session on '{entity_path}'")]
    SessionAcquireTimeout {
        entity_path: String,
        #[source]
        source: Box<ReceiverError>,
    },

    #[error("Message lock lost for lock token {lock_token}")]
    MessageLockLost { lock_token: String },

    #[error("Session lock lost for session '{session_id}'")]
    SessionLockLost { session_id: String },

    #[error("Message not found for lock token {lock_token}")]
    MessageNotFound { lock_token: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Receiver has been disposed")]
    Disposed,

    #[error("Worker failed: {message}")]
    WorkerFailed { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl ReceiverError {
    /// Shorthand for an [`ReceiverError::InvalidArgument`].
    pub fn invalid_argument(name: &str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Check if the error is a broker-side or client-side timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::BrokerTimeout { .. } | Self::Timeout { .. })
    }

    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InvalidArgument { .. } => false,
            Self::BrokerTimeout { .. } => true,
            Self::Timeout { .. } => true,
            Self::SessionAcquireTimeout { .. } => true,
            Self::MessageLockLost { .. } => false,
            Self::SessionLockLost { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::Disposed => false,
            Self::WorkerFailed { .. } => false,
            Self::Configuration(_) => false,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(key) => Self::Missing { key },
            other => Self::Parsing {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
