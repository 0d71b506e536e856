//! # Topic Purge
//!
//! Skips a consumer group past the backlog of a topic by committing each
//! partition's current high-water mark. No message is fetched.
//!
//! A partition whose committed offset already reaches the high-water mark is
//! left untouched, so purging twice in a row commits nothing the second time.

use crate::retry::{retry_transient, RetryPolicy};
use crate::AdminError;
use bus_runtime::{BusClient, BusError, ConsumerGroup, Offset, PartitionId, TopicName};
use std::future::Future;
use tracing::{debug, info};

#[cfg(test)]
#[path = "topic_purge_tests.rs"]
mod tests;

/// What a purge did to one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPurge {
    pub partition: PartitionId,
    /// Offset committed before the purge, if the group had one
    pub previous: Option<Offset>,
    /// Position of the group after the purge
    pub committed: Offset,
    /// Messages skipped by this purge
    pub advanced: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub topic: TopicName,
    pub group: ConsumerGroup,
    pub partitions: Vec<PartitionPurge>,
}

impl PurgeReport {
    pub fn total_advanced(&self) -> i64 {
        self.partitions.iter().map(|p| p.advanced).sum()
    }
}

pub struct TopicPurger {
    client: BusClient,
    retry: RetryPolicy,
}

impl TopicPurger {
    pub fn new(client: BusClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Advance `group` to the high-water mark of every partition of `topic`.
    ///
    /// # Errors
    ///
    /// - [`AdminError::TopicNotFound`] when the topic does not exist
    /// - [`AdminError::GroupCommit`] when a commit is rejected or keeps failing
    pub async fn purge(
        &self,
        topic: &TopicName,
        group: &ConsumerGroup,
    ) -> Result<PurgeReport, AdminError> {
        let client = &self.client;
        let partitions = self
            .call("partition_count", move || client.partition_count(topic))
            .await?;
        if partitions == 0 {
            return Err(AdminError::TopicNotFound {
                topic: topic.to_string(),
            });
        }

        let mut report = PurgeReport {
            topic: topic.clone(),
            group: group.clone(),
            partitions: Vec::with_capacity(partitions as usize),
        };
        for partition in 0..partitions as PartitionId {
            report
                .partitions
                .push(self.purge_partition(topic, group, partition).await?);
        }

        info!(
            topic = %topic,
            group = %group,
            partitions,
            advanced = report.total_advanced(),
            "Topic purged"
        );
        Ok(report)
    }

    async fn purge_partition(
        &self,
        topic: &TopicName,
        group: &ConsumerGroup,
        partition: PartitionId,
    ) -> Result<PartitionPurge, AdminError> {
        let client = &self.client;
        let marks = self
            .call("watermarks", move || client.watermarks(topic, partition))
            .await?;
        let previous = self
            .call("committed_offset", move || {
                client.committed_offset(group, topic, partition)
            })
            .await?;

        let position = previous.unwrap_or(marks.low).max(marks.low);
        if position >= marks.high {
            debug!(topic = %topic, group = %group, partition, offset = position, "Partition already purged");
            return Ok(PartitionPurge {
                partition,
                previous,
                committed: previous.unwrap_or(position),
                advanced: 0,
            });
        }

        let high = marks.high;
        self.call("commit_offset", move || {
            client.commit_offset(group, topic, partition, high)
        })
        .await
        .map_err(|error| match error {
            AdminError::GroupCommit { .. } => error,
            other => AdminError::GroupCommit {
                group: group.to_string(),
                topic: topic.to_string(),
                message: other.to_string(),
            },
        })?;

        let advanced = high - position;
        info!(
            topic = %topic,
            group = %group,
            partition,
            previous = ?previous,
            committed = high,
            advanced,
            "Partition purged"
        );
        Ok(PartitionPurge {
            partition,
            previous,
            committed: high,
            advanced,
        })
    }

    async fn call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, AdminError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        let (result, _) = retry_transient(&self.retry, operation, BusError::is_transient, call).await;
        result.map_err(AdminError::from)
    }
}
