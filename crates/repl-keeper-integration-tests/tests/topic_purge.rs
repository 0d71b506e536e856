//! Integration tests for purging a consumer group's backlog

mod common;

use bus_runtime::ConsumerGroup;
use common::{task, StandbyCluster};
use repl_keeper_core::topic_purge::TopicPurger;
use repl_keeper_core::{AdminError, TaskCodec};

fn group() -> ConsumerGroup {
    ConsumerGroup::new("standby-replicator".to_string()).unwrap()
}

/// Verify that purging twice advances the group once
#[tokio::test]
async fn test_purge_is_idempotent() {
    // Arrange
    let cluster = StandbyCluster::new();
    let payload = TaskCodec::encode(&task("wf-1", "run-1", 0, 10)).unwrap();
    cluster.fill_dlq(0, &[payload.clone(), payload.clone()]).await;
    cluster.fill_dlq(1, &[payload]).await;
    let purger = TopicPurger::new(cluster.client(), common::fast_retry());

    // Act
    let first = purger.purge(&common::dlq_topic(), &group()).await.unwrap();
    let second = purger.purge(&common::dlq_topic(), &group()).await.unwrap();

    // Assert
    assert_eq!(first.total_advanced(), 3);
    assert_eq!(second.total_advanced(), 0);
    assert_eq!(second.partitions[0].previous, Some(2));
    assert_eq!(second.partitions[1].previous, Some(1));
    assert_eq!(cluster.provider.commit_calls().unwrap(), 2);
}

/// Verify that new backlog after a purge is purged again
#[tokio::test]
async fn test_purge_after_new_messages_advances_only_the_new_backlog() {
    // Arrange
    let cluster = StandbyCluster::new();
    let payload = TaskCodec::encode(&task("wf-1", "run-1", 0, 10)).unwrap();
    cluster.fill_dlq(0, &[payload.clone()]).await;
    let purger = TopicPurger::new(cluster.client(), common::fast_retry());
    purger.purge(&common::dlq_topic(), &group()).await.unwrap();

    cluster.fill_dlq(0, &[payload.clone(), payload]).await;

    // Act
    let report = purger.purge(&common::dlq_topic(), &group()).await.unwrap();

    // Assert
    assert_eq!(report.partitions[0].previous, Some(1));
    assert_eq!(report.partitions[0].committed, 3);
    assert_eq!(report.total_advanced(), 2);
}

/// Verify that a rejected commit fails the purge
#[tokio::test]
async fn test_rejected_commit_fails_the_purge() {
    // Arrange
    let cluster = StandbyCluster::new();
    let payload = TaskCodec::encode(&task("wf-1", "run-1", 0, 10)).unwrap();
    cluster.fill_dlq(0, &[payload]).await;
    cluster.provider.reject_commits_for(&group()).unwrap();
    let purger = TopicPurger::new(cluster.client(), common::fast_retry());

    // Act
    let result = purger.purge(&common::dlq_topic(), &group()).await;

    // Assert
    assert!(matches!(result, Err(AdminError::GroupCommit { .. })));
}
