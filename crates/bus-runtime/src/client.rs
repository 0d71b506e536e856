//! Client trait and pooled client implementation for bus operations.

use crate::error::{BusError, ConfigurationError};
use crate::message::{
    BusMessage, ConsumerGroup, Offset, PartitionId, ReceivedMessage, TopicName, Watermarks,
};
use crate::provider::{BusConfig, ProviderConfig, ProviderType};
use crate::providers::InMemoryProvider;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Interface implemented by specific bus providers (Kafka, in-memory)
///
/// Every call is a single blocking round trip against the broker. Producing
/// returns only once the broker acknowledged the write.
#[async_trait]
pub trait BusProvider: Send + Sync {
    /// Number of partitions of an existing topic
    async fn partition_count(&self, topic: &TopicName) -> Result<u32, BusError>;

    /// Produce one message to a partition and wait for the acknowledgement
    async fn produce(
        &self,
        topic: &TopicName,
        partition: PartitionId,
        message: &BusMessage,
    ) -> Result<Offset, BusError>;

    /// Read up to `max_messages` starting at `from` (inclusive)
    async fn fetch(
        &self,
        topic: &TopicName,
        partition: PartitionId,
        from: Offset,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, BusError>;

    /// Current low/high watermarks of a partition
    async fn watermarks(
        &self,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Result<Watermarks, BusError>;

    /// Offset committed by a consumer group, if any
    async fn committed_offset(
        &self,
        group: &ConsumerGroup,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Result<Option<Offset>, BusError>;

    /// Commit an offset on behalf of a consumer group
    async fn commit_offset(
        &self,
        group: &ConsumerGroup,
        topic: &TopicName,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<(), BusError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// Factory for creating bus clients with appropriate providers
pub struct BusClientFactory;

impl BusClientFactory {
    /// Create bus client from configuration
    pub fn create_client(config: BusConfig) -> Result<BusClient, BusError> {
        let provider: Arc<dyn BusProvider> = match &config.provider {
            ProviderConfig::InMemory(in_memory_config) => {
                Arc::new(InMemoryProvider::new(in_memory_config.clone()))
            }
            #[cfg(feature = "kafka")]
            ProviderConfig::Kafka(kafka_config) => Arc::new(
                crate::providers::KafkaProvider::new(kafka_config.clone(), config.operation_timeout)?,
            ),
            #[cfg(not(feature = "kafka"))]
            ProviderConfig::Kafka(_) => {
                return Err(BusError::ConfigurationError(
                    ConfigurationError::UnsupportedProvider {
                        provider: ProviderType::Kafka.to_string(),
                        message: "built without the `kafka` feature".to_string(),
                    },
                ));
            }
        };

        BusClient::new(provider, &config)
    }

    /// Create test client backed by the given in-memory provider
    pub fn create_test_client(provider: Arc<InMemoryProvider>) -> BusClient {
        let config = BusConfig::default();
        BusClient {
            provider,
            pool: Arc::new(Semaphore::new(config.pool_size)),
            operation_timeout: config.operation_timeout,
        }
    }
}

/// Bus client sharing a bounded pool of provider connections.
///
/// Each call borrows one pool slot for its whole duration and returns it on
/// completion, failure or timeout. Calls exceeding `operation_timeout` fail
/// with [`BusError::Timeout`], which is transient.
#[derive(Clone)]
pub struct BusClient {
    provider: Arc<dyn BusProvider>,
    pool: Arc<Semaphore>,
    operation_timeout: Duration,
}

impl BusClient {
    /// Create client wrapping a provider
    pub fn new(provider: Arc<dyn BusProvider>, config: &BusConfig) -> Result<Self, BusError> {
        if config.pool_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "pool_size must be at least 1".to_string(),
            }
            .into());
        }

        Ok(Self {
            provider,
            pool: Arc::new(Semaphore::new(config.pool_size)),
            operation_timeout: config.operation_timeout,
        })
    }

    /// Pool slots not currently borrowed
    pub fn available_connections(&self) -> usize {
        self.pool.available_permits()
    }

    pub fn provider_type(&self) -> ProviderType {
        self.provider.provider_type()
    }

    async fn pooled<T, F>(&self, operation: &'static str, call: F) -> Result<T, BusError>
    where
        F: Future<Output = Result<T, BusError>>,
    {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| BusError::ConnectionFailed {
                message: "connection pool closed".to_string(),
            })?;

        match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                debug!(operation, timeout = ?self.operation_timeout, "Bus call timed out");
                Err(BusError::Timeout {
                    duration: self.operation_timeout,
                })
            }
        }
    }

    pub async fn partition_count(&self, topic: &TopicName) -> Result<u32, BusError> {
        self.pooled("partition_count", self.provider.partition_count(topic))
            .await
    }

    pub async fn produce(
        &self,
        topic: &TopicName,
        partition: PartitionId,
        message: &BusMessage,
    ) -> Result<Offset, BusError> {
        let max_size = self.provider.provider_type().max_message_size();
        if message.size() > max_size {
            return Err(BusError::MessageTooLarge {
                size: message.size(),
                max_size,
            });
        }

        self.pooled("produce", self.provider.produce(topic, partition, message))
            .await
    }

    pub async fn fetch(
        &self,
        topic: &TopicName,
        partition: PartitionId,
        from: Offset,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.pooled(
            "fetch",
            self.provider.fetch(topic, partition, from, max_messages),
        )
        .await
    }

    pub async fn watermarks(
        &self,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Result<Watermarks, BusError> {
        self.pooled("watermarks", self.provider.watermarks(topic, partition))
            .await
    }

    pub async fn committed_offset(
        &self,
        group: &ConsumerGroup,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Result<Option<Offset>, BusError> {
        self.pooled(
            "committed_offset",
            self.provider.committed_offset(group, topic, partition),
        )
        .await
    }

    pub async fn commit_offset(
        &self,
        group: &ConsumerGroup,
        topic: &TopicName,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<(), BusError> {
        self.pooled(
            "commit_offset",
            self.provider.commit_offset(group, topic, partition, offset),
        )
        .await
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("provider", &self.provider.provider_type())
            .field("available_connections", &self.pool.available_permits())
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}
