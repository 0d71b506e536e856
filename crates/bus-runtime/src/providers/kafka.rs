//! Kafka bus provider backed by librdkafka.
//!
//! Producing uses the async `FutureProducer` and resolves once the partition
//! leader acknowledged the write (`acks=all`). Metadata, watermark, fetch and
//! offset commit calls use blocking `BaseConsumer` handles run on the blocking
//! thread pool so they never stall the async workers.

use crate::client::BusProvider;
use crate::error::{BusError, ConfigurationError};
use crate::message::{
    BusMessage, ConsumerGroup, Offset, PartitionId, ReceivedMessage, TopicName, Watermarks,
};
use crate::provider::{KafkaConfig, ProviderType};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::TopicPartitionList;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(test)]
#[path = "kafka_tests.rs"]
mod tests;

/// Kafka implementation of [`BusProvider`]
pub struct KafkaProvider {
    config: KafkaConfig,
    producer: FutureProducer,
    metadata: Arc<BaseConsumer>,
    call_timeout: Duration,
}

impl KafkaProvider {
    /// Connect producer and metadata handles to the configured brokers
    pub fn new(config: KafkaConfig, call_timeout: Duration) -> Result<Self, BusError> {
        if config.brokers.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "brokers".to_string(),
            }
            .into());
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", call_timeout.as_millis().to_string())
            .create()
            .map_err(map_kafka_error)?;

        let metadata: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", &config.client_id)
            .create()
            .map_err(map_kafka_error)?;

        Ok(Self {
            config,
            producer,
            metadata: Arc::new(metadata),
            call_timeout,
        })
    }

    fn group_consumer(&self, group: &str) -> Result<BaseConsumer, BusError> {
        ClientConfig::new()
            .set("bootstrap.servers", self.config.bootstrap_servers())
            .set("client.id", &self.config.client_id)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(map_kafka_error)
    }
}

/// Run a blocking librdkafka call on the blocking pool
async fn blocking<T, F>(call: F) -> Result<T, BusError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BusError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| BusError::ProviderError {
            provider: ProviderType::Kafka.to_string(),
            code: "JoinError".to_string(),
            message: e.to_string(),
        })?
}

fn map_kafka_error(error: KafkaError) -> BusError {
    classify_error_code(error.rdkafka_error_code(), error.to_string())
}

/// Sort a librdkafka error code into retryable transport failures and
/// permanent broker refusals
fn classify_error_code(code: Option<RDKafkaErrorCode>, message: String) -> BusError {
    use RDKafkaErrorCode::*;

    match code {
        Some(UnknownTopicOrPartition) | Some(UnknownTopic) => BusError::TopicNotFound { topic: message },
        Some(TopicAuthorizationFailed)
        | Some(GroupAuthorizationFailed)
        | Some(ClusterAuthorizationFailed) => BusError::PermissionDenied { operation: message },
        Some(RequestTimedOut) | Some(OperationTimedOut) | Some(MessageTimedOut) => {
            BusError::Timeout {
                duration: Duration::from_millis(0),
            }
        }
        Some(BrokerTransportFailure)
        | Some(AllBrokersDown)
        | Some(NetworkException)
        | Some(Transport)
        | Some(LeaderNotAvailable)
        | Some(NotLeaderForPartition)
        | Some(NotEnoughReplicas)
        | Some(NotEnoughReplicasAfterAppend)
        | Some(CoordinatorLoadInProgress)
        | Some(CoordinatorNotAvailable)
        | Some(NotCoordinator)
        | Some(RebalanceInProgress)
        | Some(QueueFull) => BusError::ConnectionFailed { message },
        code => BusError::ProviderError {
            provider: ProviderType::Kafka.to_string(),
            code: code
                .map(|c| format!("{:?}", c))
                .unwrap_or_else(|| "Client".to_string()),
            message,
        },
    }
}

fn partition_list(
    topic: &str,
    partition: PartitionId,
    offset: Option<Offset>,
) -> Result<TopicPartitionList, BusError> {
    let mut list = TopicPartitionList::new();
    match offset {
        Some(offset) => list
            .add_partition_offset(topic, partition, rdkafka::Offset::Offset(offset))
            .map_err(map_kafka_error)?,
        None => {
            list.add_partition(topic, partition);
        }
    }
    Ok(list)
}

#[async_trait]
impl BusProvider for KafkaProvider {
    async fn partition_count(&self, topic: &TopicName) -> Result<u32, BusError> {
        let consumer = Arc::clone(&self.metadata);
        let name = topic.to_string();
        let timeout = self.call_timeout;

        blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&name), timeout)
                .map_err(map_kafka_error)?;
            let entry = metadata
                .topics()
                .iter()
                .find(|t| t.name() == name)
                .ok_or_else(|| BusError::TopicNotFound {
                    topic: name.clone(),
                })?;

            if entry.error().is_some() || entry.partitions().is_empty() {
                return Err(BusError::TopicNotFound { topic: name });
            }
            Ok(entry.partitions().len() as u32)
        })
        .await
    }

    async fn produce(
        &self,
        topic: &TopicName,
        partition: PartitionId,
        message: &BusMessage,
    ) -> Result<Offset, BusError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let mut record = FutureRecord::<[u8], [u8]>::to(topic.as_str())
            .partition(partition)
            .payload(message.payload.as_ref())
            .headers(headers);
        if let Some(key) = &message.key {
            record = record.key(key.as_ref());
        }

        let (_, offset) = self
            .producer
            .send(record, Timeout::After(self.call_timeout))
            .await
            .map_err(|(error, _)| map_kafka_error(error))?;
        Ok(offset)
    }

    async fn fetch(
        &self,
        topic: &TopicName,
        partition: PartitionId,
        from: Offset,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        let consumer = self.group_consumer(&format!("{}-reader", self.config.client_id))?;
        let topic = topic.clone();
        let timeout = self.call_timeout;

        blocking(move || {
            let high = consumer
                .fetch_watermarks(topic.as_str(), partition, timeout)
                .map_err(map_kafka_error)?
                .1;
            let assignment = partition_list(topic.as_str(), partition, Some(from))?;
            consumer.assign(&assignment).map_err(map_kafka_error)?;

            let mut messages = Vec::new();
            let deadline = Instant::now() + timeout;
            let mut next = from;
            while messages.len() < max_messages && next < high && Instant::now() < deadline {
                let Some(polled) = consumer.poll(Duration::from_millis(200)) else {
                    continue;
                };
                let borrowed = polled.map_err(map_kafka_error)?;
                next = borrowed.offset() + 1;

                let headers = borrowed
                    .headers()
                    .map(|headers| {
                        headers
                            .iter()
                            .filter_map(|h| {
                                h.value.map(|v| {
                                    (h.key.to_string(), String::from_utf8_lossy(v).into_owned())
                                })
                            })
                            .collect::<HashMap<_, _>>()
                    })
                    .unwrap_or_default();

                messages.push(ReceivedMessage {
                    topic: topic.clone(),
                    partition: borrowed.partition(),
                    offset: borrowed.offset(),
                    key: borrowed.key().map(Bytes::copy_from_slice),
                    payload: borrowed
                        .payload()
                        .map(Bytes::copy_from_slice)
                        .unwrap_or_default(),
                    headers,
                });
            }
            Ok(messages)
        })
        .await
    }

    async fn watermarks(
        &self,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Result<Watermarks, BusError> {
        let consumer = Arc::clone(&self.metadata);
        let name = topic.to_string();
        let timeout = self.call_timeout;

        blocking(move || {
            let (low, high) = consumer
                .fetch_watermarks(&name, partition, timeout)
                .map_err(map_kafka_error)?;
            Ok(Watermarks { low, high })
        })
        .await
    }

    async fn committed_offset(
        &self,
        group: &ConsumerGroup,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Result<Option<Offset>, BusError> {
        let consumer = self.group_consumer(group.as_str())?;
        let name = topic.to_string();
        let timeout = self.call_timeout;

        blocking(move || {
            let request = partition_list(&name, partition, None)?;
            let committed = consumer
                .committed_offsets(request, timeout)
                .map_err(map_kafka_error)?;
            Ok(committed
                .find_partition(&name, partition)
                .and_then(|element| match element.offset() {
                    rdkafka::Offset::Offset(offset) => Some(offset),
                    _ => None,
                }))
        })
        .await
    }

    async fn commit_offset(
        &self,
        group: &ConsumerGroup,
        topic: &TopicName,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<(), BusError> {
        let consumer = self.group_consumer(group.as_str())?;
        let group = group.to_string();
        let name = topic.to_string();

        blocking(move || {
            let list = partition_list(&name, partition, Some(offset))?;
            consumer
                .commit(&list, CommitMode::Sync)
                .map_err(|error| map_kafka_error(error).commit_failure(&group, &name))
        })
        .await
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Kafka
    }
}
