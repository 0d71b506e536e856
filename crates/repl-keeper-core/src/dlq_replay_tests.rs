//! Tests for DLQ replay.

use super::*;
use crate::shard::ShardRouter;
use crate::sink::{OutputDestination, SharedBuffer};
use crate::task::TaskType;
use crate::topology::ClusterConnections;
use bus_runtime::{BusClientFactory, BusMessage, BusProvider, InMemoryProvider, InjectedFault};
use std::io::Cursor;
use std::time::Duration;

fn task(workflow_id: &str, run_id: &str, first: i64) -> ReplicationTask {
    ReplicationTask {
        domain_id: "d-1".to_string(),
        workflow_id: workflow_id.to_string(),
        run_id: run_id.to_string(),
        first_event_id: first,
        next_event_id: first + 10,
        version: 1,
        task_type: TaskType::HistoryAppend,
        payload: Bytes::from(format!("events-{}", first)),
    }
}

fn line(task: &ReplicationTask) -> String {
    TaskCodec::encode_line(task).unwrap()
}

/// Five tasks of distinct runs with the third one corrupt
fn five_with_third_malformed() -> String {
    let mut lines = Vec::new();
    for i in 1..=5 {
        if i == 3 {
            lines.push("{\"domainId\": broken".to_string());
        } else {
            lines.push(line(&task(&format!("wf-{}", i), "run", i)));
        }
    }
    lines.join("\n")
}

fn source(text: String) -> ReplaySource {
    ReplaySource::from_reader(Cursor::new(text.into_bytes()))
}

fn replayer(policy: ErrorPolicy) -> DlqReplayer {
    DlqReplayer::new(
        ReplayOptions {
            policy,
            filter: TaskFilter::default(),
            parallelism: 2,
        },
        CancellationToken::new(),
    )
}

async fn buffer_output(format: OutputFormat) -> (SharedBuffer, ReplayOutput) {
    let buffer = SharedBuffer::default();
    let writer = TaskWriter::create(OutputDestination::Buffer(buffer.clone()), format)
        .await
        .unwrap();
    (buffer, ReplayOutput::Writer(writer))
}

fn buffer_lines(buffer: &SharedBuffer) -> Vec<String> {
    String::from_utf8(buffer.lock().unwrap().clone())
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

fn dlq_topic() -> TopicName {
    TopicName::new("repl-dlq".to_string()).unwrap()
}

fn target_topic() -> TopicName {
    TopicName::new("replication".to_string()).unwrap()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2), 2.0).without_jitter()
}

/// Standby cluster with a 4-partition replication topic
fn standby() -> (Arc<InMemoryProvider>, Arc<TaskPublisher>, PublishTarget) {
    let provider = Arc::new(InMemoryProvider::default());
    provider.create_topic(&target_topic(), 4).unwrap();
    let mut connections = ClusterConnections::new();
    connections.insert("standby", BusClientFactory::create_test_client(provider.clone()));
    let publisher = TaskPublisher::new(
        Arc::new(connections),
        ShardRouter::new(8).unwrap(),
        fast_retry(),
    );
    (
        provider,
        Arc::new(publisher),
        PublishTarget::new("standby", target_topic()),
    )
}

fn published(provider: &InMemoryProvider) -> Vec<ReplicationTask> {
    let mut tasks: Vec<ReplicationTask> = (0..4)
        .flat_map(|p| provider.messages(&target_topic(), p).unwrap())
        .map(|m| TaskCodec::decode_message(&m).unwrap())
        .collect();
    tasks.sort_by_key(|t| t.first_event_id);
    tasks
}

// ============================================================================
// Writer Output Tests
// ============================================================================

mod writer_output {
    use super::*;

    #[tokio::test]
    async fn test_skip_mode_forwards_valid_tasks_and_counts_malformed() {
        let (buffer, output) = buffer_output(OutputFormat::Full).await;

        let report = replayer(ErrorPolicy::SkipAndCount)
            .run(source(five_with_third_malformed()), output)
            .await
            .unwrap();

        assert_eq!(report.read, 5);
        assert_eq!(report.forwarded, 4);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].location, SourceLocation::Line(3));
        assert!(report.is_success());
        assert_eq!(buffer_lines(&buffer).len(), 4);
    }

    #[tokio::test]
    async fn test_abort_mode_stops_and_writes_nothing() {
        let (buffer, output) = buffer_output(OutputFormat::Full).await;

        let report = replayer(ErrorPolicy::Abort)
            .run(source(five_with_third_malformed()), output)
            .await
            .unwrap();

        assert_eq!(report.read, 3);
        assert_eq!(report.forwarded, 0);
        assert_eq!(
            report.aborted.as_ref().map(|a| a.location),
            Some(SourceLocation::Line(3))
        );
        assert!(!report.is_success());
        assert!(buffer_lines(&buffer).is_empty());
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_skipped_as_malformed() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(line(&task("wf", "r", 1)).as_bytes());
        bytes.extend_from_slice(b"\n\xff\xfe{\r\n");
        bytes.extend_from_slice(line(&task("wf", "r", 2)).as_bytes());
        bytes.push(b'\n');
        let (buffer, output) = buffer_output(OutputFormat::Full).await;

        let report = replayer(ErrorPolicy::SkipAndCount)
            .run(ReplaySource::from_reader(Cursor::new(bytes)), output)
            .await
            .unwrap();

        assert_eq!(report.read, 3);
        assert_eq!(report.forwarded, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].location, SourceLocation::Line(2));
        assert_eq!(buffer_lines(&buffer).len(), 2);
    }

    #[tokio::test]
    async fn test_blank_lines_skipped_but_counted_in_locations() {
        let text = format!("\n{}\n\n   \nnot json\n", line(&task("wf", "r", 1)));
        let (_buffer, output) = buffer_output(OutputFormat::Full).await;

        let report = replayer(ErrorPolicy::SkipAndCount)
            .run(source(text), output)
            .await
            .unwrap();

        assert_eq!(report.read, 2);
        assert_eq!(report.skipped[0].location, SourceLocation::Line(5));
    }

    #[tokio::test]
    async fn test_filters_drop_other_runs() {
        let text = [
            line(&task("wf-a", "r1", 1)),
            line(&task("wf-a", "r2", 1)),
            line(&task("wf-b", "r1", 1)),
        ]
        .join("\n");
        let (buffer, output) = buffer_output(OutputFormat::Full).await;
        let replayer = DlqReplayer::new(
            ReplayOptions {
                filter: TaskFilter {
                    workflow_id: Some("wf-a".to_string()),
                    run_id: Some("r2".to_string()),
                },
                ..ReplayOptions::default()
            },
            CancellationToken::new(),
        );

        let report = replayer.run(source(text), output).await.unwrap();

        assert_eq!(report.filtered, 2);
        assert_eq!(report.forwarded, 1);
        let written: ReplicationTask = serde_json::from_str(&buffer_lines(&buffer)[0]).unwrap();
        assert_eq!(written.run_id, "r2");
    }

    #[tokio::test]
    async fn test_headers_only_skips_payload_decoding() {
        let mut value = serde_json::to_value(task("wf", "r", 4)).unwrap();
        value["payload"] = serde_json::Value::String("%%%".to_string());
        let (buffer, output) = buffer_output(OutputFormat::HeadersOnly).await;

        let report = replayer(ErrorPolicy::Abort)
            .run(source(value.to_string()), output)
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(
            buffer_lines(&buffer),
            vec![
                "domainID,workflowID,runID,firstEventID,nextEventID".to_string(),
                "d-1,wf,r,4,14".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_replay_writes_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (buffer, output) = buffer_output(OutputFormat::Full).await;

        let report = DlqReplayer::new(ReplayOptions::default(), cancel)
            .run(source(line(&task("wf", "r", 1))), output)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.read, 0);
        assert!(buffer_lines(&buffer).is_empty());
    }
}

// ============================================================================
// Topic Source Tests
// ============================================================================

mod topic_source {
    use super::*;

    async fn dlq_with(messages: &[(PartitionId, String)]) -> Arc<InMemoryProvider> {
        let provider = Arc::new(InMemoryProvider::default());
        provider.create_topic(&dlq_topic(), 2).unwrap();
        for (partition, body) in messages {
            provider
                .produce(&dlq_topic(), *partition, &BusMessage::new(Bytes::from(body.clone())))
                .await
                .unwrap();
        }
        provider
    }

    fn topic_source(provider: &Arc<InMemoryProvider>, options: TopicReadOptions) -> ReplaySource {
        ReplaySource::topic(
            BusClientFactory::create_test_client(provider.clone()),
            dlq_topic(),
            TopicReadOptions {
                retry: fast_retry(),
                ..options
            },
        )
    }

    #[tokio::test]
    async fn test_reads_all_partitions_from_start_offset() {
        let provider = dlq_with(&[
            (0, line(&task("a", "r", 1))),
            (0, line(&task("a", "r", 11))),
            (1, line(&task("b", "r", 1))),
            (1, line(&task("b", "r", 11))),
            (1, line(&task("b", "r", 21))),
        ])
        .await;

        let mut source = topic_source(
            &provider,
            TopicReadOptions {
                start_offset: 1,
                batch_size: 1,
                ..TopicReadOptions::default()
            },
        );

        let mut locations = Vec::new();
        while let Some(record) = source.next_record().await.unwrap() {
            locations.push(record.location);
        }

        assert_eq!(
            locations,
            vec![
                SourceLocation::Offset { partition: 0, offset: 1 },
                SourceLocation::Offset { partition: 1, offset: 1 },
                SourceLocation::Offset { partition: 1, offset: 2 },
            ]
        );
        assert_eq!(provider.commit_calls().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_stops_at_high_water_mark_captured_at_start() {
        let provider = dlq_with(&[(0, line(&task("a", "r", 1)))]).await;
        let mut source = topic_source(&provider, TopicReadOptions::default());

        let first = source.next_record().await.unwrap();
        assert!(first.is_some());

        provider
            .produce(&dlq_topic(), 0, &BusMessage::new(Bytes::from(line(&task("a", "r", 11)))))
            .await
            .unwrap();

        assert!(source.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_below_retention_reads_from_low_watermark() {
        let provider = dlq_with(&[
            (0, line(&task("a", "r", 1))),
            (0, line(&task("a", "r", 11))),
            (0, line(&task("a", "r", 21))),
        ])
        .await;
        provider.truncate(&dlq_topic(), 0, 2).unwrap();

        let mut source = topic_source(
            &provider,
            TopicReadOptions {
                partition: Some(0),
                ..TopicReadOptions::default()
            },
        );

        let record = source.next_record().await.unwrap().unwrap();
        assert_eq!(record.location, SourceLocation::Offset { partition: 0, offset: 2 });
        assert!(source.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_partition_is_configuration_error() {
        let provider = dlq_with(&[]).await;
        let mut source = topic_source(
            &provider,
            TopicReadOptions {
                partition: Some(7),
                ..TopicReadOptions::default()
            },
        );

        let result = source.next_record().await;
        assert!(matches!(
            result,
            Err(AdminError::InvalidConfiguration { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_topic_is_topic_not_found() {
        let provider = Arc::new(InMemoryProvider::default());
        let mut source = topic_source(&provider, TopicReadOptions::default());

        let result = source.next_record().await;
        assert!(matches!(result, Err(AdminError::TopicNotFound { .. })));
    }

    #[tokio::test]
    async fn test_malformed_message_reports_partition_and_offset() {
        let provider = dlq_with(&[(1, line(&task("b", "r", 1))), (1, "garbage".to_string())]).await;
        let (_buffer, output) = buffer_output(OutputFormat::Full).await;

        let report = replayer(ErrorPolicy::Abort)
            .run(topic_source(&provider, TopicReadOptions::default()), output)
            .await
            .unwrap();

        assert_eq!(
            report.aborted.map(|a| a.location),
            Some(SourceLocation::Offset { partition: 1, offset: 1 })
        );
    }
}

// ============================================================================
// Republish Tests
// ============================================================================

mod republish {
    use super::*;

    #[tokio::test]
    async fn test_skip_mode_republishes_four_of_five() {
        let (provider, publisher, target) = standby();

        let report = replayer(ErrorPolicy::SkipAndCount)
            .run(
                source(five_with_third_malformed()),
                ReplayOutput::Republish { publisher, target },
            )
            .await
            .unwrap();

        assert_eq!(report.forwarded, 4);
        assert_eq!(report.skipped.len(), 1);
        let firsts: Vec<i64> = published(&provider).iter().map(|t| t.first_event_id).collect();
        assert_eq!(firsts, vec![1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn test_abort_mode_publishes_only_tasks_before_failure() {
        let (provider, publisher, target) = standby();

        let report = replayer(ErrorPolicy::Abort)
            .run(
                source(five_with_third_malformed()),
                ReplayOutput::Republish { publisher, target },
            )
            .await
            .unwrap();

        assert!(report.aborted.is_some());
        assert_eq!(report.forwarded, 2);
        let firsts: Vec<i64> = published(&provider).iter().map(|t| t.first_event_id).collect();
        assert_eq!(firsts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failed_run_blocks_its_later_tasks() {
        let (provider, publisher, target) = standby();
        provider
            .fail_next_produces(1, InjectedFault::PermissionDenied)
            .unwrap();
        let text = [
            line(&task("wf", "r", 1)),
            line(&task("wf", "r", 11)),
            line(&task("wf", "r", 21)),
        ]
        .join("\n");

        let report = replayer(ErrorPolicy::Abort)
            .run(source(text), ReplayOutput::Republish { publisher, target })
            .await
            .unwrap();

        assert_eq!(report.forwarded, 0);
        assert_eq!(report.publish_failures.len(), 1);
        assert_eq!(report.publish_failures[0].header.first_event_id, 1);
        assert_eq!(report.blocked.len(), 2);
        assert!(!report.is_success());
        assert!(published(&provider).is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_runs() {
        let (provider, publisher, target) = standby();
        provider
            .fail_next_produces(1, InjectedFault::PermissionDenied)
            .unwrap();
        let text = [line(&task("wf", "r1", 1)), line(&task("wf", "r2", 1))].join("\n");
        let replayer = DlqReplayer::new(
            ReplayOptions {
                parallelism: 1,
                ..ReplayOptions::default()
            },
            CancellationToken::new(),
        );

        let report = replayer
            .run(source(text), ReplayOutput::Republish { publisher, target })
            .await
            .unwrap();

        assert_eq!(report.forwarded, 1);
        assert_eq!(report.publish_failures.len(), 1);
        assert!(report.blocked.is_empty());
        assert_eq!(published(&provider)[0].run_id, "r2");
    }
}
