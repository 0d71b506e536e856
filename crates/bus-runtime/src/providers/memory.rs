//! In-memory bus provider implementation for testing and development.
//!
//! This module provides a fully functional in-memory partitioned log that:
//! - Assigns monotonically increasing offsets per partition
//! - Tracks low/high watermarks, including simulated retention
//! - Stores consumer group commits
//! - Supports fault injection for produce and commit paths
//!
//! This provider is intended for:
//! - Unit testing of bus-runtime consumers
//! - Dry runs of recovery commands
//! - Reference implementation for broker-backed providers

use crate::client::BusProvider;
use crate::error::BusError;
use crate::message::{
    BusMessage, ConsumerGroup, Offset, PartitionId, ReceivedMessage, TopicName, Watermarks,
};
use crate::provider::{InMemoryConfig, ProviderType};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Thread-safe storage for all topics and group commits
struct BusStorage {
    topics: HashMap<TopicName, Vec<PartitionLog>>,
    commits: HashMap<(ConsumerGroup, TopicName, PartitionId), Offset>,
    faults: FaultPlan,
    commit_calls: u64,
    config: InMemoryConfig,
}

impl BusStorage {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            topics: HashMap::new(),
            commits: HashMap::new(),
            faults: FaultPlan::default(),
            commit_calls: 0,
            config,
        }
    }

    fn partition(
        &self,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Result<&PartitionLog, BusError> {
        let partitions = self
            .topics
            .get(topic)
            .ok_or_else(|| BusError::TopicNotFound {
                topic: topic.to_string(),
            })?;

        usize::try_from(partition)
            .ok()
            .and_then(|index| partitions.get(index))
            .ok_or_else(|| BusError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })
    }

    fn partition_mut(
        &mut self,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Result<&mut PartitionLog, BusError> {
        if !self.topics.contains_key(topic) && self.config.auto_create_topics {
            let count = self.config.default_partitions.max(1) as usize;
            self.topics
                .insert(topic.clone(), (0..count).map(|_| PartitionLog::default()).collect());
        }

        let partitions = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| BusError::TopicNotFound {
                topic: topic.to_string(),
            })?;

        usize::try_from(partition)
            .ok()
            .and_then(|index| partitions.get_mut(index))
            .ok_or_else(|| BusError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })
    }
}

/// Append-only log of one partition.
///
/// The message at `messages[i]` has offset `low + i`.
#[derive(Default)]
struct PartitionLog {
    low: Offset,
    messages: Vec<StoredMessage>,
}

impl PartitionLog {
    fn high(&self) -> Offset {
        self.low + self.messages.len() as Offset
    }
}

#[derive(Clone)]
struct StoredMessage {
    key: Option<Bytes>,
    payload: Bytes,
    headers: HashMap<String, String>,
}

/// Injected failures consumed by subsequent calls
#[derive(Default)]
struct FaultPlan {
    produce_failures: u32,
    produce_failure: Option<InjectedFault>,
    commit_failures: u32,
    commit_failure: Option<InjectedFault>,
    rejected_groups: HashSet<ConsumerGroup>,
}

/// Kind of failure injected into produce or commit calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// Broker unreachable (transient)
    Connection,
    /// Request timed out (transient)
    Timeout,
    /// Authorization failure (permanent)
    PermissionDenied,
}

impl InjectedFault {
    fn to_error(self, operation: &str) -> BusError {
        match self {
            Self::Connection => BusError::ConnectionFailed {
                message: "injected connection failure".to_string(),
            },
            Self::Timeout => BusError::Timeout {
                duration: std::time::Duration::from_millis(0),
            },
            Self::PermissionDenied => BusError::PermissionDenied {
                operation: operation.to_string(),
            },
        }
    }
}

// ============================================================================
// InMemoryProvider
// ============================================================================

/// In-memory bus provider implementation
pub struct InMemoryProvider {
    storage: Arc<RwLock<BusStorage>>,
}

impl InMemoryProvider {
    /// Create new in-memory provider with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            storage: Arc::new(RwLock::new(BusStorage::new(config))),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BusStorage>, BusError> {
        self.storage.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BusStorage>, BusError> {
        self.storage.write().map_err(|_| poisoned())
    }

    /// Create a topic with the given number of partitions (no-op if it exists)
    pub fn create_topic(&self, topic: &TopicName, partitions: u32) -> Result<(), BusError> {
        let mut storage = self.write()?;
        storage.topics.entry(topic.clone()).or_insert_with(|| {
            (0..partitions.max(1))
                .map(|_| PartitionLog::default())
                .collect()
        });
        Ok(())
    }

    /// Drop messages below `new_low`, simulating broker retention
    pub fn truncate(
        &self,
        topic: &TopicName,
        partition: PartitionId,
        new_low: Offset,
    ) -> Result<(), BusError> {
        let mut storage = self.write()?;
        let log = storage.partition_mut(topic, partition)?;
        let drop_count = (new_low - log.low).clamp(0, log.messages.len() as Offset) as usize;
        log.messages.drain(..drop_count);
        log.low += drop_count as Offset;
        Ok(())
    }

    /// Snapshot of every retained message in a partition
    pub fn messages(
        &self,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        let storage = self.read()?;
        let log = storage.partition(topic, partition)?;
        Ok(to_received(topic, partition, log, log.low, log.messages.len()))
    }

    /// Fail the next `count` produce calls with the given fault
    pub fn fail_next_produces(&self, count: u32, fault: InjectedFault) -> Result<(), BusError> {
        let mut storage = self.write()?;
        storage.faults.produce_failures = count;
        storage.faults.produce_failure = Some(fault);
        Ok(())
    }

    /// Fail the next `count` offset commits with the given fault
    pub fn fail_next_commits(&self, count: u32, fault: InjectedFault) -> Result<(), BusError> {
        let mut storage = self.write()?;
        storage.faults.commit_failures = count;
        storage.faults.commit_failure = Some(fault);
        Ok(())
    }

    /// Reject every offset commit made on behalf of `group`
    pub fn reject_commits_for(&self, group: &ConsumerGroup) -> Result<(), BusError> {
        self.write()?.faults.rejected_groups.insert(group.clone());
        Ok(())
    }

    /// Number of commit calls the provider accepted
    pub fn commit_calls(&self) -> Result<u64, BusError> {
        Ok(self.read()?.commit_calls)
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

fn poisoned() -> BusError {
    BusError::ProviderError {
        provider: ProviderType::InMemory.to_string(),
        code: "LockPoisoned".to_string(),
        message: "storage lock poisoned by a panicked writer".to_string(),
    }
}

fn to_received(
    topic: &TopicName,
    partition: PartitionId,
    log: &PartitionLog,
    from: Offset,
    max_messages: usize,
) -> Vec<ReceivedMessage> {
    let start = (from - log.low).max(0) as usize;
    log.messages
        .iter()
        .enumerate()
        .skip(start)
        .take(max_messages)
        .map(|(index, stored)| ReceivedMessage {
            topic: topic.clone(),
            partition,
            offset: log.low + index as Offset,
            key: stored.key.clone(),
            payload: stored.payload.clone(),
            headers: stored.headers.clone(),
        })
        .collect()
}

#[async_trait]
impl BusProvider for InMemoryProvider {
    async fn partition_count(&self, topic: &TopicName) -> Result<u32, BusError> {
        let storage = self.read()?;
        storage
            .topics
            .get(topic)
            .map(|partitions| partitions.len() as u32)
            .ok_or_else(|| BusError::TopicNotFound {
                topic: topic.to_string(),
            })
    }

    async fn produce(
        &self,
        topic: &TopicName,
        partition: PartitionId,
        message: &BusMessage,
    ) -> Result<Offset, BusError> {
        let mut storage = self.write()?;

        if storage.faults.produce_failures > 0 {
            storage.faults.produce_failures -= 1;
            if let Some(fault) = storage.faults.produce_failure {
                return Err(fault.to_error("produce"));
            }
        }

        let log = storage.partition_mut(topic, partition)?;
        let offset = log.high();
        log.messages.push(StoredMessage {
            key: message.key.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
        });
        Ok(offset)
    }

    async fn fetch(
        &self,
        topic: &TopicName,
        partition: PartitionId,
        from: Offset,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        let storage = self.read()?;
        let log = storage.partition(topic, partition)?;
        Ok(to_received(topic, partition, log, from, max_messages))
    }

    async fn watermarks(
        &self,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Result<Watermarks, BusError> {
        let storage = self.read()?;
        let log = storage.partition(topic, partition)?;
        Ok(Watermarks {
            low: log.low,
            high: log.high(),
        })
    }

    async fn committed_offset(
        &self,
        group: &ConsumerGroup,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Result<Option<Offset>, BusError> {
        let storage = self.read()?;
        storage.partition(topic, partition)?;
        Ok(storage
            .commits
            .get(&(group.clone(), topic.clone(), partition))
            .copied())
    }

    async fn commit_offset(
        &self,
        group: &ConsumerGroup,
        topic: &TopicName,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<(), BusError> {
        let mut storage = self.write()?;
        storage.partition(topic, partition)?;

        if storage.faults.commit_failures > 0 {
            storage.faults.commit_failures -= 1;
            if let Some(fault) = storage.faults.commit_failure {
                return Err(fault
                    .to_error("commit")
                    .commit_failure(group.as_str(), topic.as_str()));
            }
        }

        if storage.faults.rejected_groups.contains(group) {
            return Err(BusError::CommitRejected {
                group: group.to_string(),
                topic: topic.to_string(),
                message: "group authorization failed".to_string(),
            });
        }

        storage
            .commits
            .insert((group.clone(), topic.clone(), partition), offset);
        storage.commit_calls += 1;
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}
