//! # Task Publisher
//!
//! Writes replication tasks to the partition owned by the workflow's shard.
//!
//! The partition is `shard_id mod partition_count(topic)` and the message key
//! is the decimal shard ID, so consumers co-partitioned with history shards
//! receive exactly the tasks they own. Transient bus failures are retried
//! with exponential backoff; permanent failures surface immediately.

use crate::codec::TaskCodec;
use crate::retry::{retry_transient, RetryPolicy};
use crate::shard::{ShardId, ShardRouter};
use crate::task::ReplicationTask;
use crate::topology::ClusterConnections;
use crate::AdminError;
use bus_runtime::{BusError, BusMessage, Offset, PartitionId, TopicName};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

#[cfg(test)]
#[path = "publisher_tests.rs"]
mod tests;

/// Message header naming the workflow of a task
pub const HEADER_WORKFLOW_ID: &str = "workflow_id";
pub const HEADER_RUN_ID: &str = "run_id";
pub const HEADER_FIRST_EVENT_ID: &str = "first_event_id";
pub const HEADER_TASK_TYPE: &str = "task_type";

/// Cluster and topic receiving published tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub cluster: String,
    pub topic: TopicName,
}

impl PublishTarget {
    pub fn new(cluster: impl Into<String>, topic: TopicName) -> Self {
        Self {
            cluster: cluster.into(),
            topic,
        }
    }
}

impl fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.topic)
    }
}

/// Where an acknowledged task was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub shard_id: ShardId,
    pub partition: PartitionId,
    pub offset: Offset,
    pub attempts: u32,
}

/// Shard-aligned producer of replication tasks
pub struct TaskPublisher {
    connections: Arc<ClusterConnections>,
    router: ShardRouter,
    retry: RetryPolicy,
}

impl TaskPublisher {
    pub fn new(connections: Arc<ClusterConnections>, router: ShardRouter, retry: RetryPolicy) -> Self {
        Self {
            connections,
            router,
            retry,
        }
    }

    /// Publish one task and wait for the bus acknowledgement.
    ///
    /// # Errors
    ///
    /// - [`AdminError::PublishExhausted`] when transient failures outlast the retry policy
    /// - the mapped bus error for permanent failures, without retrying
    pub async fn publish(
        &self,
        task: &ReplicationTask,
        target: &PublishTarget,
    ) -> Result<PublishOutcome, AdminError> {
        let client = self.connections.client(&target.cluster)?;
        let shard_id = self.router.shard_for(&task.workflow_id);
        let message = BusMessage::new(TaskCodec::encode(task)?)
            .with_key(shard_id.to_string())
            .with_header(HEADER_WORKFLOW_ID, task.workflow_id.clone())
            .with_header(HEADER_RUN_ID, task.run_id.clone())
            .with_header(HEADER_FIRST_EVENT_ID, task.first_event_id.to_string())
            .with_header(HEADER_TASK_TYPE, task.task_type.as_str());

        let topic = &target.topic;
        let message = &message;
        let (result, attempts) = retry_transient(
            &self.retry,
            "publish",
            BusError::is_transient,
            move || async move {
                let partitions = client.partition_count(topic).await?;
                if partitions == 0 {
                    return Err(BusError::TopicNotFound {
                        topic: topic.to_string(),
                    });
                }
                let partition = shard_id % partitions as PartitionId;
                let offset = client.produce(topic, partition, message).await?;
                Ok((partition, offset))
            },
        )
        .await;

        match result {
            Ok((partition, offset)) => {
                debug!(
                    workflow_id = %task.workflow_id,
                    run_id = %task.run_id,
                    first_event_id = task.first_event_id,
                    shard_id,
                    partition,
                    offset,
                    attempts,
                    "Published replication task"
                );
                Ok(PublishOutcome {
                    shard_id,
                    partition,
                    offset,
                    attempts,
                })
            }
            Err(e) if e.is_transient() => {
                error!(
                    workflow_id = %task.workflow_id,
                    run_id = %task.run_id,
                    first_event_id = task.first_event_id,
                    target = %target,
                    attempts,
                    "Giving up on replication task"
                );
                Err(AdminError::PublishExhausted {
                    run: task.run_key(),
                    first_event_id: task.first_event_id,
                    attempts,
                    last_error: e.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
