//! Error types for message bus operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all bus operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Topic not found: {topic}")]
    TopicNotFound { topic: String },

    #[error("Partition {partition} does not exist in topic {topic}")]
    PartitionNotFound { topic: String, partition: i32 },

    #[error("Offset commit for group '{group}' on topic {topic} rejected: {message}")]
    CommitRejected {
        group: String,
        topic: String,
        message: String,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Permission denied for operation: {operation}")]
    PermissionDenied { operation: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl BusError {
    /// Check if a later attempt of the same call may succeed.
    ///
    /// Only timeouts and connection failures qualify. Providers classify
    /// retryable broker codes into one of the two.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionFailed { .. })
    }

    /// Attribute a failed offset commit to its consumer group.
    ///
    /// Transient failures pass through unchanged so callers can retry them.
    pub fn commit_failure(self, group: &str, topic: &str) -> Self {
        match self {
            Self::CommitRejected { .. } => self,
            error if error.is_transient() => error,
            error => Self::CommitRejected {
                group: group.to_string(),
                topic: topic.to_string(),
                message: error.to_string(),
            },
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

    #[error("Provider '{provider}' is not available: {message}")]
    UnsupportedProvider { provider: String, message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
