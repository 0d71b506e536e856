//! # Re-replication
//!
//! Regenerates replication tasks for event ranges of workflow runs from the
//! history store and publishes them to the target cluster.
//!
//! Each stored history batch becomes one `history-append` task spanning the
//! batch's event range with its version. Before anything of a range is
//! published its batches are checked to tile the history: every batch is
//! non-empty and starts exactly where the previous one ended. A range that
//! fails this check is reported and nothing of it is published.
//!
//! Ranges run concurrently across runs through a [`RunPartitionedPool`].
//! Within a run, ranges execute in increasing `minEventID` order and a task
//! already published by an earlier range of the run is not published again.
//! Once a range of a run fails, the run's later ranges are held back as
//! [`RangeOutcome::Blocked`].

use crate::history::{HistoryBatch, HistoryError, HistoryReader, HistoryRequest};
use crate::publisher::{PublishTarget, TaskPublisher};
use crate::retry::{retry_transient, RetryPolicy};
use crate::task::{ReplicationTask, TaskType};
use crate::worker_pool::{RunPartitionedPool, RunWorker};
use crate::{AdminError, RunKey};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(test)]
#[path = "rereplication_tests.rs"]
mod tests;

const WORKER_QUEUE_DEPTH: usize = 16;

// ============================================================================
// Ranges
// ============================================================================

/// Event range of one workflow run to regenerate.
///
/// The range covers `[min_event_id, max_event_id)`; an absent bound is open-ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRange {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub min_event_id: Option<i64>,
    pub max_event_id: Option<i64>,
}

impl WorkflowRange {
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            min_event_id: None,
            max_event_id: None,
        }
    }

    pub fn with_bounds(mut self, min_event_id: Option<i64>, max_event_id: Option<i64>) -> Self {
        self.min_event_id = min_event_id;
        self.max_event_id = max_event_id;
        self
    }

    pub fn run_key(&self) -> RunKey {
        RunKey::new(self.workflow_id.clone(), self.run_id.clone())
    }

    /// Both bounds are set and equal, so no event can fall inside
    pub fn is_empty(&self) -> bool {
        matches!((self.min_event_id, self.max_event_id), (Some(min), Some(max)) if min == max)
    }

    pub fn validate(&self) -> Result<(), AdminError> {
        let invalid = |message: String| Err(AdminError::InvalidRange { message });

        if self.domain_id.is_empty() || self.workflow_id.is_empty() || self.run_id.is_empty() {
            return invalid(format!("{}: identifiers must not be empty", self));
        }
        for bound in [self.min_event_id, self.max_event_id].into_iter().flatten() {
            if bound < 0 {
                return invalid(format!("{}: event ID {} is negative", self, bound));
            }
        }
        if let (Some(min), Some(max)) = (self.min_event_id, self.max_event_id) {
            if min > max {
                return invalid(format!(
                    "{}: min event ID {} exceeds max event ID {}",
                    self, min, max
                ));
            }
        }
        Ok(())
    }

    /// Parse `domainID,workflowID,runID[,minEventID[,maxEventID]]`.
    ///
    /// Fields are trimmed and either bound may be empty.
    pub fn parse_line(line: &str) -> Result<Self, AdminError> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if !(3..=5).contains(&fields.len()) {
            return Err(AdminError::InvalidRange {
                message: format!(
                    "expected domainID,workflowID,runID[,minEventID,maxEventID], got {} fields",
                    fields.len()
                ),
            });
        }

        let range = Self::new(fields[0], fields[1], fields[2]).with_bounds(
            parse_bound(fields.get(3).copied(), "minEventID")?,
            parse_bound(fields.get(4).copied(), "maxEventID")?,
        );
        range.validate()?;
        Ok(range)
    }
}

fn parse_bound(field: Option<&str>, name: &str) -> Result<Option<i64>, AdminError> {
    match field {
        None | Some("") => Ok(None),
        Some(text) => text
            .parse::<i64>()
            .map(Some)
            .map_err(|_| AdminError::InvalidRange {
                message: format!("{} '{}' is not an integer", name, text),
            }),
    }
}

impl fmt::Display for WorkflowRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)?;
        match (self.min_event_id, self.max_event_id) {
            (None, None) => Ok(()),
            (min, max) => write!(
                f,
                "[{}..{})",
                min.map(|v| v.to_string()).unwrap_or_default(),
                max.map(|v| v.to_string()).unwrap_or_default()
            ),
        }
    }
}

/// One input line of a batch, parsed or not
#[derive(Debug)]
pub struct RangeEntry {
    /// 1-based input line, absent for ranges built in code
    pub line: Option<u64>,
    pub range: Result<WorkflowRange, AdminError>,
}

impl From<WorkflowRange> for RangeEntry {
    fn from(range: WorkflowRange) -> Self {
        Self {
            line: None,
            range: Ok(range),
        }
    }
}

/// Parse a batch of range lines, skipping blank lines and `#` comments
pub fn parse_range_lines(text: &str) -> Vec<RangeEntry> {
    text.lines()
        .enumerate()
        .filter_map(|(index, raw)| {
            let content = raw.trim();
            if content.is_empty() || content.starts_with('#') {
                return None;
            }
            Some(RangeEntry {
                line: Some(index as u64 + 1),
                range: WorkflowRange::parse_line(content),
            })
        })
        .collect()
}

pub async fn read_range_file(path: &Path) -> Result<Vec<RangeEntry>, AdminError> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(parse_range_lines(&text))
}

// ============================================================================
// Tiling
// ============================================================================

/// Convert stored batches into tasks, checking they tile the history
pub fn tasks_from_batches(
    range: &WorkflowRange,
    batches: &[HistoryBatch],
) -> Result<Vec<ReplicationTask>, AdminError> {
    let gap = |message: String| AdminError::HistoryGap {
        run: range.run_key(),
        message,
    };

    let mut previous: Option<&HistoryBatch> = None;
    for batch in batches {
        if batch.first_event_id >= batch.next_event_id {
            return Err(gap(format!(
                "batch [{}, {}) is empty",
                batch.first_event_id, batch.next_event_id
            )));
        }
        if let Some(prev) = previous {
            if batch.first_event_id > prev.next_event_id {
                return Err(gap(format!(
                    "events [{}, {}) are missing",
                    prev.next_event_id, batch.first_event_id
                )));
            }
            if batch.first_event_id < prev.next_event_id {
                return Err(gap(format!(
                    "batch starting at {} overlaps batch ending at {}",
                    batch.first_event_id, prev.next_event_id
                )));
            }
        }
        previous = Some(batch);
    }

    Ok(batches
        .iter()
        .map(|batch| ReplicationTask {
            domain_id: range.domain_id.clone(),
            workflow_id: range.workflow_id.clone(),
            run_id: range.run_id.clone(),
            first_event_id: batch.first_event_id,
            next_event_id: batch.next_event_id,
            version: batch.version,
            task_type: TaskType::HistoryAppend,
            payload: batch.events.clone(),
        })
        .collect())
}

// ============================================================================
// Report
// ============================================================================

/// Result of one range
#[derive(Debug)]
pub enum RangeOutcome {
    /// Every regenerated task was acknowledged
    Published { tasks: usize },
    /// The store holds no events in the range
    NoOp,
    /// The range stopped after `published` tasks
    Failed { published: usize, error: AdminError },
    /// Skipped after cancellation or an earlier failure
    NotAttempted,
    /// Held back because an earlier range of the same run failed
    Blocked,
}

impl RangeOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug)]
pub struct RangeReport {
    /// Position of the range in the input batch
    pub index: usize,
    pub line: Option<u64>,
    pub range: Option<WorkflowRange>,
    pub outcome: RangeOutcome,
}

/// Per-range outcomes in input order
#[derive(Debug, Default)]
pub struct RereplicationReport {
    pub ranges: Vec<RangeReport>,
}

impl RereplicationReport {
    pub fn published_tasks(&self) -> usize {
        self.ranges
            .iter()
            .map(|r| match &r.outcome {
                RangeOutcome::Published { tasks } => *tasks,
                RangeOutcome::Failed { published, .. } => *published,
                _ => 0,
            })
            .sum()
    }

    pub fn failed(&self) -> usize {
        self.ranges.iter().filter(|r| r.outcome.is_failure()).count()
    }

    pub fn not_attempted(&self) -> usize {
        self.ranges
            .iter()
            .filter(|r| matches!(r.outcome, RangeOutcome::NotAttempted))
            .count()
    }

    pub fn blocked(&self) -> usize {
        self.ranges
            .iter()
            .filter(|r| matches!(r.outcome, RangeOutcome::Blocked))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.not_attempted() == 0 && self.blocked() == 0
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Reaction of a batch to a failed range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    ContinueOnError,
    StopOnFirstError,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub parallelism: usize,
    pub store_timeout: Duration,
    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            store_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::ContinueOnError,
        }
    }
}

struct RangeExecutor {
    history: Arc<dyn HistoryReader>,
    publisher: Arc<TaskPublisher>,
    target: PublishTarget,
    store_timeout: Duration,
    retry: RetryPolicy,
}

impl RangeExecutor {
    async fn read_history(&self, range: &WorkflowRange) -> Result<Vec<HistoryBatch>, AdminError> {
        let request = HistoryRequest {
            domain_id: range.domain_id.clone(),
            run: range.run_key(),
            min_event_id: range.min_event_id,
            max_event_id: range.max_event_id,
        };

        let history = &self.history;
        let request = &request;
        let timeout = self.store_timeout;
        let (result, attempts) = retry_transient(
            &self.retry,
            "read_history",
            HistoryError::is_transient,
            move || async move {
                match tokio::time::timeout(timeout, history.read_history(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(HistoryError::Timeout { duration: timeout }),
                }
            },
        )
        .await;

        match result {
            Ok(batches) => Ok(batches),
            Err(e) if e.is_transient() => Err(AdminError::Connection {
                target: "history store".to_string(),
                message: format!("{} (after {} attempts)", e, attempts),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn execute(&self, range: &WorkflowRange) -> RangeOutcome {
        self.execute_from(range, None).await.0
    }

    /// Regenerate and publish one range, skipping tasks that start before `resume_from`.
    ///
    /// Also returns the end of the last published task when the range succeeds.
    async fn execute_from(
        &self,
        range: &WorkflowRange,
        resume_from: Option<i64>,
    ) -> (RangeOutcome, Option<i64>) {
        if let Err(error) = range.validate() {
            let outcome = RangeOutcome::Failed {
                published: 0,
                error,
            };
            return (outcome, None);
        }
        if range.is_empty() {
            info!(range = %range, "Range is empty");
            return (RangeOutcome::NoOp, None);
        }

        let mut tasks = match self
            .read_history(range)
            .await
            .and_then(|batches| tasks_from_batches(range, &batches))
        {
            Ok(tasks) => tasks,
            Err(error) => {
                error!(range = %range, error = %error, "Cannot regenerate range");
                let outcome = RangeOutcome::Failed {
                    published: 0,
                    error,
                };
                return (outcome, None);
            }
        };

        if let Some(from) = resume_from {
            tasks.retain(|task| task.first_event_id >= from);
        }
        if tasks.is_empty() {
            info!(range = %range, "No stored events in range");
            return (RangeOutcome::NoOp, None);
        }

        for (published, task) in tasks.iter().enumerate() {
            if let Err(error) = self.publisher.publish(task, &self.target).await {
                error!(
                    range = %range,
                    first_event_id = task.first_event_id,
                    published,
                    error = %error,
                    "Range stopped on publish failure"
                );
                return (RangeOutcome::Failed { published, error }, None);
            }
        }

        info!(range = %range, tasks = tasks.len(), target = %self.target, "Range re-replicated");
        let end = tasks.last().map(|task| task.next_event_id);
        (RangeOutcome::Published { tasks: tasks.len() }, end)
    }
}

/// Regenerates and publishes replication tasks for batches of ranges
pub struct RereplicationOrchestrator {
    executor: Arc<RangeExecutor>,
    parallelism: usize,
    failure_policy: FailurePolicy,
    cancel: CancellationToken,
}

impl RereplicationOrchestrator {
    pub fn new(
        history: Arc<dyn HistoryReader>,
        publisher: Arc<TaskPublisher>,
        target: PublishTarget,
        settings: OrchestratorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor: Arc::new(RangeExecutor {
                history,
                publisher,
                target,
                store_timeout: settings.store_timeout,
                retry: settings.retry,
            }),
            parallelism: settings.parallelism,
            failure_policy: settings.failure_policy,
            cancel,
        }
    }

    /// Re-replicate a single range
    pub async fn rereplicate(&self, range: &WorkflowRange) -> RangeOutcome {
        self.executor.execute(range).await
    }

    /// Re-replicate a batch of ranges, reporting every range in input order.
    ///
    /// Ranges of one run are submitted in increasing `minEventID` order. Under
    /// [`FailurePolicy::StopOnFirstError`] an invalid input line stops every
    /// range after it.
    pub async fn run(&self, entries: Vec<RangeEntry>) -> Result<RereplicationReport, AdminError> {
        let stop = self.cancel.child_token();
        let stop_on_error = self.failure_policy == FailurePolicy::StopOnFirstError;

        let mut reports = Vec::with_capacity(entries.len());
        let mut runs: Vec<Vec<RangeJob>> = Vec::new();
        let mut run_slots: HashMap<RunKey, usize> = HashMap::new();
        let mut input_stopped = false;

        for (index, entry) in entries.into_iter().enumerate() {
            match entry.range {
                Ok(range) if !input_stopped => {
                    let slot = *run_slots.entry(range.run_key()).or_insert_with(|| {
                        runs.push(Vec::new());
                        runs.len() - 1
                    });
                    runs[slot].push(RangeJob {
                        index,
                        line: entry.line,
                        range,
                    });
                }
                Ok(range) => reports.push(RangeReport {
                    index,
                    line: entry.line,
                    range: Some(range),
                    outcome: RangeOutcome::NotAttempted,
                }),
                Err(error) => {
                    warn!(line = ?entry.line, error = %error, "Invalid range input");
                    reports.push(RangeReport {
                        index,
                        line: entry.line,
                        range: None,
                        outcome: RangeOutcome::Failed {
                            published: 0,
                            error,
                        },
                    });
                    input_stopped |= stop_on_error;
                }
            }
        }

        let pool = RunPartitionedPool::spawn(self.parallelism, WORKER_QUEUE_DEPTH, |_| RangeWorker {
            executor: Arc::clone(&self.executor),
            stop: stop.clone(),
            stop_on_error,
            failed_runs: HashSet::new(),
            published_through: HashMap::new(),
            reports: Vec::new(),
        });

        let mut submit_error = None;
        'submit: for mut jobs in runs {
            jobs.sort_by_key(|job| job.range.min_event_id.unwrap_or(i64::MIN));
            for job in jobs {
                if stop.is_cancelled() {
                    reports.push(RangeReport {
                        index: job.index,
                        line: job.line,
                        range: Some(job.range),
                        outcome: RangeOutcome::NotAttempted,
                    });
                    continue;
                }
                let run = job.range.run_key();
                if let Err(e) = pool.submit(&run, job).await {
                    submit_error = Some(e);
                    stop.cancel();
                    break 'submit;
                }
            }
        }

        let joined = pool.join().await;
        if let Some(e) = submit_error {
            return Err(e);
        }
        for worker_reports in joined? {
            reports.extend(worker_reports);
        }
        reports.sort_by_key(|r| r.index);

        let report = RereplicationReport { ranges: reports };
        info!(
            ranges = report.ranges.len(),
            published_tasks = report.published_tasks(),
            failed = report.failed(),
            blocked = report.blocked(),
            not_attempted = report.not_attempted(),
            "Re-replication finished"
        );
        Ok(report)
    }
}

struct RangeJob {
    index: usize,
    line: Option<u64>,
    range: WorkflowRange,
}

/// Executes the ranges of its runs, holding back a run after its first failure
struct RangeWorker {
    executor: Arc<RangeExecutor>,
    stop: CancellationToken,
    stop_on_error: bool,
    failed_runs: HashSet<RunKey>,
    /// End of the last task published for each run
    published_through: HashMap<RunKey, i64>,
    reports: Vec<RangeReport>,
}

#[async_trait]
impl RunWorker for RangeWorker {
    type Job = RangeJob;
    type Output = Vec<RangeReport>;

    async fn handle(&mut self, job: RangeJob) {
        let run = job.range.run_key();
        let outcome = if self.stop.is_cancelled() {
            RangeOutcome::NotAttempted
        } else if self.failed_runs.contains(&run) {
            warn!(range = %job.range, "Holding back range after an earlier failure of its run");
            RangeOutcome::Blocked
        } else {
            let resume_from = self.published_through.get(&run).copied();
            let (outcome, end) = self.executor.execute_from(&job.range, resume_from).await;
            if let Some(end) = end {
                self.published_through.insert(run.clone(), end);
            }
            outcome
        };

        if outcome.is_failure() {
            self.failed_runs.insert(run);
            if self.stop_on_error {
                self.stop.cancel();
            }
        }

        self.reports.push(RangeReport {
            index: job.index,
            line: job.line,
            range: Some(job.range),
            outcome,
        });
    }

    fn finish(self) -> Self::Output {
        self.reports
    }
}
