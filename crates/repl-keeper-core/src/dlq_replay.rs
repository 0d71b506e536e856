//! # DLQ Replay
//!
//! Reads replication tasks from a dead-letter topic or a task file and
//! either writes them out for inspection or republishes them.
//!
//! Reading a topic is bounded: each partition is read from the requested
//! start offset up to the high-water mark captured when reading begins.
//! Consumed offsets are never committed, so a replay can be repeated.
//!
//! Malformed records are handled according to [`ErrorPolicy`]. Under
//! [`ErrorPolicy::Abort`] the first malformed record stops the run and
//! nothing reaches the writer destination; under
//! [`ErrorPolicy::SkipAndCount`] it is recorded in the report and skipped.

use crate::codec::{SourceLocation, TaskCodec};
use crate::publisher::{PublishTarget, TaskPublisher};
use crate::retry::{retry_transient, RetryPolicy};
use crate::sink::{OutputFormat, TaskWriter};
use crate::task::{ReplicationTask, TaskHeader};
use crate::worker_pool::{RunPartitionedPool, RunWorker};
use crate::{AdminError, RunKey};
use async_trait::async_trait;
use bus_runtime::{BusClient, BusError, Offset, PartitionId, ReceivedMessage, TopicName};
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "dlq_replay_tests.rs"]
mod tests;

/// Jobs queued per worker before the reader waits
const WORKER_QUEUE_DEPTH: usize = 64;

// ============================================================================
// Options
// ============================================================================

/// Reaction to a record that cannot be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Stop at the first malformed record
    #[default]
    Abort,
    /// Record the malformed record in the report and continue
    SkipAndCount,
}

/// Restricts a replay to one workflow and/or run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub workflow_id: Option<String>,
    pub run_id: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, workflow_id: &str, run_id: &str) -> bool {
        self.workflow_id.as_deref().map_or(true, |w| w == workflow_id)
            && self.run_id.as_deref().map_or(true, |r| r == run_id)
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub policy: ErrorPolicy,
    pub filter: TaskFilter,
    /// Workers used when republishing
    pub parallelism: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            policy: ErrorPolicy::Abort,
            filter: TaskFilter::default(),
            parallelism: 4,
        }
    }
}

// ============================================================================
// Sources
// ============================================================================

/// One undecoded record and where it came from
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub location: SourceLocation,
    pub bytes: Bytes,
}

/// Bounds of a topic read
#[derive(Debug, Clone)]
pub struct TopicReadOptions {
    /// Read a single partition instead of all of them
    pub partition: Option<PartitionId>,
    /// First offset read in each partition
    pub start_offset: Offset,
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for TopicReadOptions {
    fn default() -> Self {
        Self {
            partition: None,
            start_offset: 0,
            batch_size: 500,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PartitionRange {
    partition: PartitionId,
    next: Offset,
    end: Offset,
}

struct TopicCursor {
    client: BusClient,
    topic: TopicName,
    options: TopicReadOptions,
    ranges: Option<VecDeque<PartitionRange>>,
    buffered: VecDeque<ReceivedMessage>,
}

impl TopicCursor {
    /// Capture the read bounds of every partition
    async fn plan(&self) -> Result<VecDeque<PartitionRange>, AdminError> {
        let count = self.with_retry("partition_count", |client, topic| async move {
            client.partition_count(topic).await
        })
        .await?;

        let partitions: Vec<PartitionId> = match self.options.partition {
            Some(p) if p < 0 || p >= count as PartitionId => {
                return Err(AdminError::invalid_configuration(format!(
                    "partition {} does not exist in topic '{}' ({} partitions)",
                    p, self.topic, count
                )));
            }
            Some(p) => vec![p],
            None => (0..count as PartitionId).collect(),
        };

        let mut ranges = VecDeque::with_capacity(partitions.len());
        for partition in partitions {
            let marks = self
                .with_retry("watermarks", |client, topic| async move {
                    client.watermarks(topic, partition).await
                })
                .await?;

            let start = if self.options.start_offset < marks.low {
                warn!(
                    topic = %self.topic,
                    partition,
                    requested = self.options.start_offset,
                    low_watermark = marks.low,
                    "Start offset below retention, reading from low watermark"
                );
                marks.low
            } else {
                self.options.start_offset
            };

            debug!(topic = %self.topic, partition, start, end = marks.high, "Planned partition read");
            if start < marks.high {
                ranges.push_back(PartitionRange {
                    partition,
                    next: start,
                    end: marks.high,
                });
            }
        }
        Ok(ranges)
    }

    async fn with_retry<'a, T, F, Fut>(&'a self, operation: &str, call: F) -> Result<T, AdminError>
    where
        F: Fn(&'a BusClient, &'a TopicName) -> Fut,
        Fut: std::future::Future<Output = Result<T, BusError>>,
    {
        let client = &self.client;
        let topic = &self.topic;
        let (result, _) = retry_transient(&self.options.retry, operation, BusError::is_transient, || {
            call(client, topic)
        })
        .await;
        result.map_err(AdminError::from)
    }

    async fn next_record(&mut self) -> Result<Option<RawRecord>, AdminError> {
        if self.ranges.is_none() {
            self.ranges = Some(self.plan().await?);
        }

        loop {
            if let Some(message) = self.buffered.pop_front() {
                return Ok(Some(RawRecord {
                    location: SourceLocation::Offset {
                        partition: message.partition,
                        offset: message.offset,
                    },
                    bytes: message.payload,
                }));
            }

            let Some(range) = self.ranges.as_ref().and_then(|r| r.front().copied()) else {
                return Ok(None);
            };
            if range.next >= range.end {
                self.advance_partition();
                continue;
            }

            let wanted = self
                .options
                .batch_size
                .max(1)
                .min((range.end - range.next) as usize);
            let fetched = self
                .with_retry("fetch", |client, topic| async move {
                    client.fetch(topic, range.partition, range.next, wanted).await
                })
                .await?;

            let fetched: Vec<ReceivedMessage> = fetched
                .into_iter()
                .filter(|m| m.offset >= range.next && m.offset < range.end)
                .collect();

            match fetched.last() {
                Some(last) => {
                    let next = last.offset + 1;
                    if let Some(current) = self.ranges.as_mut().and_then(|r| r.front_mut()) {
                        current.next = next;
                    }
                }
                None => {
                    warn!(
                        topic = %self.topic,
                        partition = range.partition,
                        offset = range.next,
                        end = range.end,
                        "No messages returned before high-water mark, skipping rest of partition"
                    );
                    self.advance_partition();
                }
            }
            self.buffered.extend(fetched);
        }
    }

    fn advance_partition(&mut self) {
        if let Some(ranges) = self.ranges.as_mut() {
            ranges.pop_front();
        }
    }
}

enum SourceKind {
    Lines {
        reader: Box<dyn AsyncBufRead + Unpin + Send>,
        line: u64,
    },
    Topic(Box<TopicCursor>),
}

/// Lazily read sequence of raw task records
pub struct ReplaySource {
    kind: SourceKind,
}

impl ReplaySource {
    /// Line-oriented task file
    pub async fn file(path: &Path) -> Result<Self, AdminError> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::from_reader(BufReader::new(file)))
    }

    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }

    pub fn from_reader(reader: impl AsyncBufRead + Unpin + Send + 'static) -> Self {
        Self {
            kind: SourceKind::Lines {
                reader: Box::new(reader),
                line: 0,
            },
        }
    }

    /// Bounded read of a bus topic
    pub fn topic(client: BusClient, topic: TopicName, options: TopicReadOptions) -> Self {
        Self {
            kind: SourceKind::Topic(Box::new(TopicCursor {
                client,
                topic,
                options,
                ranges: None,
                buffered: VecDeque::new(),
            })),
        }
    }

    /// Next record, or `None` once the source is exhausted
    pub async fn next_record(&mut self) -> Result<Option<RawRecord>, AdminError> {
        match &mut self.kind {
            SourceKind::Lines { reader, line } => {
                let mut buffer = Vec::new();
                loop {
                    buffer.clear();
                    if reader.read_until(b'\n', &mut buffer).await? == 0 {
                        return Ok(None);
                    }
                    *line += 1;
                    let content = buffer.trim_ascii();
                    if content.is_empty() {
                        continue;
                    }
                    return Ok(Some(RawRecord {
                        location: SourceLocation::Line(*line),
                        bytes: Bytes::copy_from_slice(content),
                    }));
                }
            }
            SourceKind::Topic(cursor) => cursor.next_record().await,
        }
    }
}

// ============================================================================
// Outputs and Report
// ============================================================================

/// Destination of replayed tasks; exactly one per run
pub enum ReplayOutput {
    Writer(TaskWriter),
    Republish {
        publisher: Arc<TaskPublisher>,
        target: PublishTarget,
    },
}

/// A record that was not forwarded because it could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub location: SourceLocation,
    pub reason: String,
}

/// A task whose publish failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFailure {
    pub location: SourceLocation,
    pub header: TaskHeader,
    pub error: String,
}

/// A task withheld because an earlier task of its run failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedTask {
    pub location: SourceLocation,
    pub header: TaskHeader,
}

/// Outcome of one replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Records pulled from the source
    pub read: u64,
    /// Tasks written or acknowledged by the bus
    pub forwarded: u64,
    /// Tasks dropped by the workflow/run filter
    pub filtered: u64,
    pub skipped: Vec<SkippedRecord>,
    pub publish_failures: Vec<PublishFailure>,
    pub blocked: Vec<BlockedTask>,
    /// Queued tasks dropped after cancellation
    pub unattempted: u64,
    /// First malformed record under [`ErrorPolicy::Abort`]
    pub aborted: Option<SkippedRecord>,
    pub cancelled: bool,
}

impl ReplayReport {
    pub fn is_success(&self) -> bool {
        self.aborted.is_none()
            && self.publish_failures.is_empty()
            && self.blocked.is_empty()
            && self.unattempted == 0
            && !self.cancelled
    }
}

// ============================================================================
// Replayer
// ============================================================================

enum Decoded {
    Task(ReplicationTask),
    Header(TaskHeader),
}

impl Decoded {
    fn ids(&self) -> (&str, &str) {
        match self {
            Self::Task(t) => (t.workflow_id.as_str(), t.run_id.as_str()),
            Self::Header(h) => (h.workflow_id.as_str(), h.run_id.as_str()),
        }
    }
}

/// Drives one replay from a source to an output
pub struct DlqReplayer {
    options: ReplayOptions,
    cancel: CancellationToken,
}

impl DlqReplayer {
    pub fn new(options: ReplayOptions, cancel: CancellationToken) -> Self {
        Self { options, cancel }
    }

    /// Replay every record of `source` into `output`.
    ///
    /// Decode failures and publish failures are reported in the returned
    /// [`ReplayReport`]; only source and writer failures are returned as errors.
    pub async fn run(
        &self,
        source: ReplaySource,
        output: ReplayOutput,
    ) -> Result<ReplayReport, AdminError> {
        let report = match output {
            ReplayOutput::Writer(writer) => self.run_to_writer(source, writer).await?,
            ReplayOutput::Republish { publisher, target } => {
                self.run_republish(source, publisher, target).await?
            }
        };

        info!(
            read = report.read,
            forwarded = report.forwarded,
            filtered = report.filtered,
            skipped = report.skipped.len(),
            publish_failures = report.publish_failures.len(),
            blocked = report.blocked.len(),
            aborted = report.aborted.is_some(),
            cancelled = report.cancelled,
            "Replay finished"
        );
        Ok(report)
    }

    /// Pull the next record that decodes and passes the filter
    async fn next_task(
        &self,
        source: &mut ReplaySource,
        header_only: bool,
        report: &mut ReplayReport,
    ) -> Result<Option<(SourceLocation, Decoded)>, AdminError> {
        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(None);
            }

            let Some(record) = source.next_record().await? else {
                return Ok(None);
            };
            report.read += 1;

            let decoded = if header_only {
                TaskCodec::decode_header_only(&record.bytes, record.location).map(Decoded::Header)
            } else {
                TaskCodec::decode(&record.bytes, record.location).map(Decoded::Task)
            };

            let decoded = match decoded {
                Ok(decoded) => decoded,
                Err(e) => match self.record_malformed(e, report) {
                    ControlFlow::Continue(()) => continue,
                    ControlFlow::Break(()) => return Ok(None),
                },
            };

            let (workflow_id, run_id) = decoded.ids();
            if !self.options.filter.matches(workflow_id, run_id) {
                report.filtered += 1;
                continue;
            }
            return Ok(Some((record.location, decoded)));
        }
    }

    fn record_malformed(&self, error: AdminError, report: &mut ReplayReport) -> ControlFlow<()> {
        let record = match error {
            AdminError::MalformedTask { location, message } => SkippedRecord {
                location,
                reason: message,
            },
            other => SkippedRecord {
                location: SourceLocation::Unknown,
                reason: other.to_string(),
            },
        };

        match self.options.policy {
            ErrorPolicy::SkipAndCount => {
                warn!(location = %record.location, reason = %record.reason, "Skipping malformed task");
                report.skipped.push(record);
                ControlFlow::Continue(())
            }
            ErrorPolicy::Abort => {
                error!(location = %record.location, reason = %record.reason, "Aborting on malformed task");
                report.aborted = Some(record);
                ControlFlow::Break(())
            }
        }
    }

    async fn run_to_writer(
        &self,
        mut source: ReplaySource,
        mut writer: TaskWriter,
    ) -> Result<ReplayReport, AdminError> {
        let header_only = writer.format() == OutputFormat::HeadersOnly;
        let mut report = ReplayReport::default();

        loop {
            let next = self.next_task(&mut source, header_only, &mut report).await;
            let written = match next {
                Ok(Some((_, Decoded::Task(task)))) => writer.write_task(&task).await,
                Ok(Some((_, Decoded::Header(header)))) => writer.write_header(&header).await,
                Ok(None) => break,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                discard(writer).await;
                return Err(e);
            }
        }

        if report.aborted.is_some() || report.cancelled {
            writer.abort().await?;
        } else {
            report.forwarded = writer.lines();
            writer.commit().await?;
        }
        Ok(report)
    }

    async fn run_republish(
        &self,
        mut source: ReplaySource,
        publisher: Arc<TaskPublisher>,
        target: PublishTarget,
    ) -> Result<ReplayReport, AdminError> {
        let mut report = ReplayReport::default();
        let pool = RunPartitionedPool::spawn(self.options.parallelism, WORKER_QUEUE_DEPTH, |_| {
            RepublishWorker {
                publisher: Arc::clone(&publisher),
                target: target.clone(),
                cancel: self.cancel.clone(),
                failed_runs: HashSet::new(),
                output: WorkerOutput::default(),
            }
        });

        let mut failure = None;
        loop {
            match self.next_task(&mut source, false, &mut report).await {
                Ok(Some((location, Decoded::Task(task)))) => {
                    if let Err(e) = pool.submit(&task.run_key(), (location, task)).await {
                        failure = Some(e);
                        break;
                    }
                }
                Ok(Some((_, Decoded::Header(_)))) | Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let outputs = pool.join().await?;
        for output in outputs {
            report.forwarded += output.published;
            report.unattempted += output.unattempted;
            report.publish_failures.extend(output.failures);
            report.blocked.extend(output.blocked);
        }
        report.publish_failures.sort_by_key(|f| f.location);
        report.blocked.sort_by_key(|b| b.location);

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

async fn discard(writer: TaskWriter) {
    if let Err(e) = writer.abort().await {
        warn!(error = %e, "Failed to discard pending output");
    }
}

#[derive(Default)]
struct WorkerOutput {
    published: u64,
    unattempted: u64,
    failures: Vec<PublishFailure>,
    blocked: Vec<BlockedTask>,
}

/// Publishes tasks of its runs, holding back a run after its first failure
struct RepublishWorker {
    publisher: Arc<TaskPublisher>,
    target: PublishTarget,
    cancel: CancellationToken,
    failed_runs: HashSet<RunKey>,
    output: WorkerOutput,
}

#[async_trait]
impl RunWorker for RepublishWorker {
    type Job = (SourceLocation, ReplicationTask);
    type Output = WorkerOutput;

    async fn handle(&mut self, (location, task): Self::Job) {
        if self.cancel.is_cancelled() {
            self.output.unattempted += 1;
            return;
        }

        let run = task.run_key();
        if self.failed_runs.contains(&run) {
            warn!(
                workflow_id = %task.workflow_id,
                run_id = %task.run_id,
                first_event_id = task.first_event_id,
                "Holding back task after earlier failure in run"
            );
            self.output.blocked.push(BlockedTask {
                location,
                header: task.header(),
            });
            return;
        }

        match self.publisher.publish(&task, &self.target).await {
            Ok(_) => self.output.published += 1,
            Err(e) => {
                error!(
                    workflow_id = %task.workflow_id,
                    run_id = %task.run_id,
                    location = %location,
                    error = %e,
                    "Failed to republish task"
                );
                self.output.failures.push(PublishFailure {
                    location,
                    header: task.header(),
                    error: e.to_string(),
                });
                self.failed_runs.insert(run);
            }
        }
    }

    fn finish(self) -> Self::Output {
        self.output
    }
}
