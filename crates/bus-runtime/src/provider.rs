//! Provider types and configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Enumeration of supported bus providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Kafka,
    InMemory,
}

impl ProviderType {
    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::Kafka => 1024 * 1024,          // broker default message.max.bytes
            Self::InMemory => 10 * 1024 * 1024, // 10MB
        }
    }

    /// Whether this provider can be compiled into the current build
    pub fn is_available(&self) -> bool {
        match self {
            Self::Kafka => cfg!(feature = "kafka"),
            Self::InMemory => true,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kafka => write!(f, "kafka"),
            Self::InMemory => write!(f, "in_memory"),
        }
    }
}

/// Configuration for bus client initialization
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub provider: ProviderConfig,
    /// Deadline applied to every single provider call
    pub operation_timeout: Duration,
    /// Maximum concurrent calls borrowed from the connection pool
    pub pool_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::InMemory(InMemoryConfig::default()),
            operation_timeout: Duration::from_secs(10),
            pool_size: 4,
        }
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    Kafka(KafkaConfig),
    InMemory(InMemoryConfig),
}

impl ProviderConfig {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::Kafka(_) => ProviderType::Kafka,
            Self::InMemory(_) => ProviderType::InMemory,
        }
    }
}

/// Kafka connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Ordered list of bootstrap brokers (host:port)
    pub brokers: Vec<String>,
    pub client_id: String,
}

impl KafkaConfig {
    pub fn new(brokers: Vec<String>) -> Self {
        Self {
            brokers,
            client_id: "repl-keeper".to_string(),
        }
    }

    /// Comma separated bootstrap list as expected by the client library
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// In-memory provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryConfig {
    /// Partition count used when a topic is created implicitly by a produce
    pub default_partitions: u32,
    /// Create topics on first produce instead of failing with TopicNotFound
    pub auto_create_topics: bool,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            default_partitions: 4,
            auto_create_topics: false,
        }
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
