//! Common test utilities for repl-keeper integration tests
//!
//! This module provides:
//! - An in-memory standby cluster with a task topic and a dead-letter topic
//! - Builders for replication tasks and history batches

#![allow(dead_code)]

use bus_runtime::{
    BusClient, BusClientFactory, BusMessage, BusProvider, InMemoryProvider, PartitionId,
    TopicName,
};
use bytes::Bytes;
use repl_keeper_core::publisher::{PublishTarget, TaskPublisher};
use repl_keeper_core::retry::RetryPolicy;
use repl_keeper_core::topology::ClusterConnections;
use repl_keeper_core::{HistoryBatch, ReplicationTask, ShardRouter, TaskCodec, TaskType};
use std::sync::Arc;
use std::time::Duration;

pub const CLUSTER: &str = "standby";
pub const SHARDS: i32 = 64;
pub const PARTITIONS: u32 = 8;

pub fn replication_topic() -> TopicName {
    TopicName::new("replication-tasks".to_string()).unwrap()
}

pub fn dlq_topic() -> TopicName {
    TopicName::new("replication-tasks-dlq".to_string()).unwrap()
}

/// Standby cluster backed by one in-memory provider
pub struct StandbyCluster {
    pub provider: Arc<InMemoryProvider>,
    pub publisher: Arc<TaskPublisher>,
}

impl StandbyCluster {
    pub fn new() -> Self {
        let provider = Arc::new(InMemoryProvider::default());
        provider.create_topic(&replication_topic(), PARTITIONS).unwrap();
        provider.create_topic(&dlq_topic(), 2).unwrap();

        let mut connections = ClusterConnections::new();
        connections.insert(CLUSTER, BusClientFactory::create_test_client(provider.clone()));

        let publisher = TaskPublisher::new(
            Arc::new(connections),
            ShardRouter::new(SHARDS).unwrap(),
            fast_retry(),
        );

        Self {
            provider,
            publisher: Arc::new(publisher),
        }
    }

    pub fn client(&self) -> BusClient {
        BusClientFactory::create_test_client(self.provider.clone())
    }

    pub fn target(&self) -> PublishTarget {
        PublishTarget::new(CLUSTER, replication_topic())
    }

    /// Every task on the replication topic, partition by partition
    pub fn published(&self) -> Vec<ReplicationTask> {
        (0..PARTITIONS as PartitionId)
            .flat_map(|p| self.provider.messages(&replication_topic(), p).unwrap())
            .map(|m| TaskCodec::decode_message(&m).unwrap())
            .collect()
    }

    /// Append raw payloads to one dead-letter partition
    pub async fn fill_dlq(&self, partition: PartitionId, payloads: &[Bytes]) {
        for payload in payloads {
            self.provider
                .produce(&dlq_topic(), partition, &BusMessage::new(payload.clone()))
                .await
                .unwrap();
        }
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(4), 2.0).without_jitter()
}

pub fn task(workflow_id: &str, run_id: &str, first: i64, next: i64) -> ReplicationTask {
    ReplicationTask {
        domain_id: "orders".to_string(),
        workflow_id: workflow_id.to_string(),
        run_id: run_id.to_string(),
        first_event_id: first,
        next_event_id: next,
        version: 2,
        task_type: TaskType::HistoryAppend,
        payload: Bytes::from(format!("{}:{}-{}", workflow_id, first, next)),
    }
}

pub fn batch(first: i64, next: i64) -> HistoryBatch {
    HistoryBatch {
        first_event_id: first,
        next_event_id: next,
        version: 2,
        events: Bytes::from(format!("events {}-{}", first, next)),
    }
}
