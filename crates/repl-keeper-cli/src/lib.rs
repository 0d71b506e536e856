//! # Repl-Keeper CLI
//!
//! Operator commands for recovering cross-cluster replication:
//! - `get-shard` prints the history shard owning a workflow
//! - `parse` decodes dead-letter tasks to stdout or a file
//! - `merge-dlq` replays dead-letter tasks into a target topic
//! - `purge-topic` skips a consumer group past a topic's backlog
//! - `rereplicate` regenerates tasks from exported history
//!
//! Task data goes to stdout. Logs and run summaries go to stderr.

use bus_runtime::{ConsumerGroup, Offset, PartitionId, TopicName};
use clap::{ArgGroup, Args, CommandFactory, Parser, Subcommand};
use repl_keeper_core::adapters::FilesystemHistoryStore;
use repl_keeper_core::config::AdminConfig;
use repl_keeper_core::dlq_replay::{
    DlqReplayer, ErrorPolicy, ReplayOptions, ReplayOutput, ReplayReport, ReplaySource, TaskFilter,
    TopicReadOptions,
};
use repl_keeper_core::publisher::{PublishTarget, TaskPublisher};
use repl_keeper_core::rereplication::{
    read_range_file, FailurePolicy, OrchestratorSettings, RangeEntry, RangeOutcome,
    RereplicationOrchestrator, RereplicationReport, WorkflowRange,
};
use repl_keeper_core::sink::{OutputDestination, OutputFormat, TaskWriter};
use repl_keeper_core::topic_purge::{PurgeReport, TopicPurger};
use repl_keeper_core::topology::{ClusterConnections, ClusterTopology};
use repl_keeper_core::{AdminError, ShardRouter};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// CLI Structure
// ============================================================================

/// Repl-Keeper CLI - recovery toolkit for cross-cluster workflow replication
#[derive(Debug, Parser)]
#[command(name = "repl-keeper")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Recovery toolkit for cross-cluster workflow replication")]
#[command(
    long_about = "Repl-Keeper recomputes shard ownership, regenerates replication tasks from stored history, replays dead-letter queues and purges stuck consumer groups"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "REPL_KEEPER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level, overridden by RUST_LOG
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the history shard owning a workflow
    GetShard {
        #[arg(long)]
        workflow_id: String,

        /// Overrides number_of_shards from the configuration
        #[arg(long, allow_negative_numbers = true)]
        number_of_shards: Option<i32>,
    },

    /// Decode replication tasks from a file or stdin
    Parse(ParseArgs),

    /// Replay dead-letter tasks into a target topic
    MergeDlq(MergeDlqArgs),

    /// Skip a consumer group past the backlog of a topic
    PurgeTopic(PurgeTopicArgs),

    /// Regenerate replication tasks from exported history
    Rereplicate(RereplicateArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Filters and error handling shared by the replay commands
#[derive(Debug, Clone, Args)]
pub struct FilterArgs {
    /// Only keep tasks of this workflow
    #[arg(long)]
    pub workflow_id: Option<String>,

    /// Only keep tasks of this run
    #[arg(long)]
    pub run_id: Option<String>,

    /// Count undecodable records and continue instead of aborting
    #[arg(long)]
    pub skip_errors: bool,
}

impl FilterArgs {
    fn replay_options(&self, parallelism: usize) -> ReplayOptions {
        ReplayOptions {
            policy: if self.skip_errors {
                ErrorPolicy::SkipAndCount
            } else {
                ErrorPolicy::Abort
            },
            filter: TaskFilter {
                workflow_id: self.workflow_id.clone(),
                run_id: self.run_id.clone(),
            },
            parallelism,
        }
    }
}

#[derive(Debug, Args)]
pub struct ParseArgs {
    /// File with one JSON task per line, stdin when absent
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Write tasks to this file instead of stdout
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    /// Print only domainID,workflowID,runID,firstEventID,nextEventID
    #[arg(long)]
    pub headers_only: bool,

    #[command(flatten)]
    pub filter: FilterArgs,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("source").required(true).args(["input_file", "input_topic"])))]
pub struct MergeDlqArgs {
    /// File with one JSON task per line
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Dead-letter topic to read up to its current high-water mark
    #[arg(long, requires = "input_cluster")]
    pub input_topic: Option<String>,

    /// Cluster hosting the dead-letter topic
    #[arg(long, requires = "input_topic")]
    pub input_cluster: Option<String>,

    /// First offset read in each partition (default 0)
    #[arg(long, requires = "input_topic")]
    pub start_offset: Option<Offset>,

    /// Read only this partition
    #[arg(long, requires = "input_topic")]
    pub partition: Option<PartitionId>,

    /// Target cluster
    #[arg(long)]
    pub cluster: String,

    /// Target topic
    #[arg(long)]
    pub topic: String,

    /// Cluster topology file
    #[arg(long)]
    pub host_file: PathBuf,

    /// Overrides number_of_shards from the configuration
    #[arg(long, allow_negative_numbers = true)]
    pub number_of_shards: Option<i32>,

    #[command(flatten)]
    pub filter: FilterArgs,
}

#[derive(Debug, Args)]
pub struct PurgeTopicArgs {
    #[arg(long)]
    pub cluster: String,

    #[arg(long)]
    pub topic: String,

    /// Consumer group whose offsets are advanced
    #[arg(long)]
    pub group: String,

    /// Cluster topology file
    #[arg(long)]
    pub host_file: PathBuf,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("ranges").required(true).args(["input_file", "workflow_id"])))]
pub struct RereplicateArgs {
    #[arg(long, requires_all = ["domain_id", "run_id"])]
    pub workflow_id: Option<String>,

    #[arg(long, requires = "workflow_id")]
    pub domain_id: Option<String>,

    #[arg(long, requires = "workflow_id")]
    pub run_id: Option<String>,

    /// First event to regenerate (inclusive)
    #[arg(long, requires = "workflow_id", allow_negative_numbers = true)]
    pub min_event_id: Option<i64>,

    /// End of the range to regenerate (exclusive)
    #[arg(long, requires = "workflow_id", allow_negative_numbers = true)]
    pub max_event_id: Option<i64>,

    /// File of domainID,workflowID,runID[,minEventID,maxEventID] lines
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Root directory of exported history
    #[arg(long)]
    pub history_dir: PathBuf,

    /// Target cluster
    #[arg(long)]
    pub cluster: String,

    /// Target topic
    #[arg(long)]
    pub topic: String,

    /// Cluster topology file
    #[arg(long)]
    pub host_file: PathBuf,

    /// Overrides number_of_shards from the configuration
    #[arg(long, allow_negative_numbers = true)]
    pub number_of_shards: Option<i32>,

    /// Overrides parallelism from the configuration
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Stop the batch after the first failed range
    #[arg(long)]
    pub stop_on_error: bool,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("{message}")]
    Failed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Admin(#[from] AdminError),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. } => 1,
            Self::Failed { .. } => 2,
            Self::InvalidArgument { .. } => 3,
            Self::Io(_) => 4,
            Self::Admin(error) => match error {
                AdminError::InvalidConfiguration { .. } => 1,
                AdminError::InvalidRange { .. } => 3,
                AdminError::Io(_) => 4,
                _ => 2,
            },
        }
    }
}

fn invalid_argument(arg: &str, message: impl ToString) -> CliError {
    CliError::InvalidArgument {
        arg: arg.to_string(),
        message: message.to_string(),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli.log_level, cli.json_logs)?;
    let config = load_configuration(cli.config.as_deref())?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    execute(cli.command, &config, cancel).await
}

/// Run one parsed command against a loaded configuration
pub async fn execute(
    command: Commands,
    config: &AdminConfig,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    match command {
        Commands::GetShard {
            workflow_id,
            number_of_shards,
        } => execute_get_shard_command(&workflow_id, number_of_shards, config, &mut io::stdout()),
        Commands::Parse(args) => execute_parse_command(args, config, cancel).await,
        Commands::MergeDlq(args) => execute_merge_dlq_command(args, config, cancel).await,
        Commands::PurgeTopic(args) => execute_purge_topic_command(args, config).await,
        Commands::Rereplicate(args) => execute_rereplicate_command(args, config, cancel).await,
        Commands::Completions { shell } => execute_completions_command(shell),
    }
}

/// Initialize logging on stderr
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| invalid_argument("--log-level", e))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
    };
    result.map_err(|e| CliError::Configuration {
        message: format!("cannot initialize logging: {}", e),
    })
}

/// Per-user configuration file consulted when none is given
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("repl-keeper").join("config.toml"))
}

/// Load configuration from the given file, or the per-user file if present
pub fn load_configuration(explicit: Option<&Path>) -> Result<AdminConfig, CliError> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path().filter(|path| path.is_file()),
    };

    let config = AdminConfig::load(path.as_deref())?;
    config.validate()?;
    info!(path = ?path, provider = %config.bus_provider, "Configuration loaded");
    Ok(config)
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current unit");
            cancel.cancel();
        }
    });
}

fn shard_router(flag: Option<i32>, config: &AdminConfig) -> Result<ShardRouter, CliError> {
    let shards = match flag {
        Some(shards) => shards,
        None => config.require_shards()?,
    };
    Ok(ShardRouter::new(shards)?)
}

fn topic_arg(arg: &str, value: &str) -> Result<TopicName, CliError> {
    TopicName::new(value.to_string()).map_err(|e| invalid_argument(arg, e))
}

// ============================================================================
// Command Implementations
// ============================================================================

fn execute_get_shard_command(
    workflow_id: &str,
    number_of_shards: Option<i32>,
    config: &AdminConfig,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let router = shard_router(number_of_shards, config)?;
    let shard = router.shard_for(workflow_id);
    info!(
        workflow_id,
        shard,
        number_of_shards = router.number_of_shards(),
        "Computed shard"
    );
    writeln!(out, "{}", shard)?;
    Ok(())
}

async fn execute_parse_command(
    args: ParseArgs,
    config: &AdminConfig,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    let source = match &args.input_file {
        Some(path) => ReplaySource::file(path).await?,
        None => ReplaySource::stdin(),
    };
    let destination = match args.output_file {
        Some(path) => OutputDestination::File(path),
        None => OutputDestination::Stdout,
    };
    let format = if args.headers_only {
        OutputFormat::HeadersOnly
    } else {
        OutputFormat::Full
    };
    let writer = TaskWriter::create(destination, format).await?;

    let replayer = DlqReplayer::new(args.filter.replay_options(config.parallelism), cancel);
    let report = replayer.run(source, ReplayOutput::Writer(writer)).await?;

    write_replay_summary(&report, &mut io::stderr())?;
    replay_result(&report)
}

async fn execute_merge_dlq_command(
    args: MergeDlqArgs,
    config: &AdminConfig,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    let router = shard_router(args.number_of_shards, config)?;
    let target = PublishTarget::new(args.cluster.clone(), topic_arg("--topic", &args.topic)?);
    let input_topic = args
        .input_topic
        .as_deref()
        .map(|topic| topic_arg("--input-topic", topic))
        .transpose()?;

    let topology = ClusterTopology::load(&args.host_file).await?;
    let mut clusters = vec![args.cluster.as_str()];
    if let Some(cluster) = args.input_cluster.as_deref() {
        clusters.push(cluster);
    }
    let connections = Arc::new(ClusterConnections::connect(&topology, &clusters, config)?);

    let source = match (&args.input_file, input_topic, args.input_cluster.as_deref()) {
        (Some(path), _, _) => ReplaySource::file(path).await?,
        (None, Some(topic), Some(cluster)) => ReplaySource::topic(
            connections.client(cluster)?.clone(),
            topic,
            TopicReadOptions {
                partition: args.partition,
                start_offset: args.start_offset.unwrap_or(0),
                batch_size: config.fetch_batch_size,
                retry: config.retry_policy(),
            },
        ),
        _ => {
            return Err(invalid_argument(
                "--input-file",
                "either --input-file or --input-topic with --input-cluster is required",
            ))
        }
    };

    let publisher = Arc::new(TaskPublisher::new(
        connections,
        router,
        config.retry_policy(),
    ));
    let replayer = DlqReplayer::new(args.filter.replay_options(config.parallelism), cancel);
    let report = replayer
        .run(source, ReplayOutput::Republish { publisher, target })
        .await?;

    write_replay_summary(&report, &mut io::stderr())?;
    replay_result(&report)
}

async fn execute_purge_topic_command(
    args: PurgeTopicArgs,
    config: &AdminConfig,
) -> Result<(), CliError> {
    let topic = topic_arg("--topic", &args.topic)?;
    let group = ConsumerGroup::new(args.group.clone()).map_err(|e| invalid_argument("--group", e))?;

    let topology = ClusterTopology::load(&args.host_file).await?;
    let connections = ClusterConnections::connect(&topology, &[args.cluster.as_str()], config)?;
    let purger = TopicPurger::new(connections.client(&args.cluster)?.clone(), config.retry_policy());

    let report = purger.purge(&topic, &group).await?;
    write_purge_summary(&report, &mut io::stderr())?;
    Ok(())
}

async fn execute_rereplicate_command(
    args: RereplicateArgs,
    config: &AdminConfig,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    let router = shard_router(args.number_of_shards, config)?;
    let target = PublishTarget::new(args.cluster.clone(), topic_arg("--topic", &args.topic)?);

    let entries = match (&args.input_file, &args.workflow_id) {
        (Some(path), _) => read_range_file(path).await?,
        (None, Some(workflow_id)) => {
            let range = WorkflowRange::new(
                args.domain_id.clone().unwrap_or_default(),
                workflow_id.clone(),
                args.run_id.clone().unwrap_or_default(),
            )
            .with_bounds(args.min_event_id, args.max_event_id);
            range.validate()?;
            vec![RangeEntry::from(range)]
        }
        (None, None) => {
            return Err(invalid_argument(
                "--input-file",
                "either --input-file or --workflow-id is required",
            ))
        }
    };

    let topology = ClusterTopology::load(&args.host_file).await?;
    let connections = Arc::new(ClusterConnections::connect(
        &topology,
        &[args.cluster.as_str()],
        config,
    )?);
    let publisher = Arc::new(TaskPublisher::new(
        connections,
        router,
        config.retry_policy(),
    ));
    let history = Arc::new(FilesystemHistoryStore::new(args.history_dir.clone()));

    let settings = OrchestratorSettings {
        parallelism: args.parallelism.unwrap_or(config.parallelism).max(1),
        store_timeout: config.store_timeout(),
        retry: config.retry_policy(),
        failure_policy: if args.stop_on_error {
            FailurePolicy::StopOnFirstError
        } else {
            FailurePolicy::ContinueOnError
        },
    };
    let orchestrator = RereplicationOrchestrator::new(history, publisher, target, settings, cancel);
    let report = orchestrator.run(entries).await?;

    write_rereplication_summary(&report, &mut io::stderr())?;
    if report.is_success() {
        Ok(())
    } else {
        Err(CliError::Failed {
            message: format!(
                "{} of {} ranges failed, {} blocked, {} not attempted",
                report.failed(),
                report.ranges.len(),
                report.blocked(),
                report.not_attempted()
            ),
        })
    }
}

fn execute_completions_command(shell: clap_complete::Shell) -> Result<(), CliError> {
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "repl-keeper", &mut io::stdout());
    Ok(())
}

// ============================================================================
// Summaries
// ============================================================================

fn replay_result(report: &ReplayReport) -> Result<(), CliError> {
    if report.is_success() {
        return Ok(());
    }

    let message = if let Some(aborted) = &report.aborted {
        format!("run aborted at {}: {}", aborted.location, aborted.reason)
    } else if report.cancelled {
        "run cancelled".to_string()
    } else {
        format!(
            "{} tasks failed to publish, {} tasks blocked behind them",
            report.publish_failures.len(),
            report.blocked.len()
        )
    };
    Err(CliError::Failed { message })
}

pub(crate) fn write_replay_summary(report: &ReplayReport, out: &mut impl Write) -> io::Result<()> {
    writeln!(
        out,
        "read {}, forwarded {}, filtered {}, skipped {}",
        report.read,
        report.forwarded,
        report.filtered,
        report.skipped.len()
    )?;
    for skipped in &report.skipped {
        writeln!(out, "  skipped {}: {}", skipped.location, skipped.reason)?;
    }
    for failure in &report.publish_failures {
        writeln!(
            out,
            "  publish failed at {} for {}/{} first event {}: {}",
            failure.location,
            failure.header.workflow_id,
            failure.header.run_id,
            failure.header.first_event_id,
            failure.error
        )?;
    }
    for blocked in &report.blocked {
        writeln!(
            out,
            "  blocked at {} for {}/{} first event {}",
            blocked.location,
            blocked.header.workflow_id,
            blocked.header.run_id,
            blocked.header.first_event_id
        )?;
    }
    if report.unattempted > 0 {
        writeln!(out, "  not attempted after cancellation: {}", report.unattempted)?;
    }
    if let Some(aborted) = &report.aborted {
        writeln!(out, "  aborted at {}: {}", aborted.location, aborted.reason)?;
    }
    Ok(())
}

pub(crate) fn write_rereplication_summary(
    report: &RereplicationReport,
    out: &mut impl Write,
) -> io::Result<()> {
    for range in &report.ranges {
        let label = range
            .range
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "<unparsed>".to_string());
        let line = range
            .line
            .map(|line| format!("line {}: ", line))
            .unwrap_or_default();
        match &range.outcome {
            RangeOutcome::Published { tasks } => {
                writeln!(out, "  {}{}: published {} tasks", line, label, tasks)?
            }
            RangeOutcome::NoOp => writeln!(out, "  {}{}: no stored events", line, label)?,
            RangeOutcome::Failed { published, error } => writeln!(
                out,
                "  {}{}: FAILED after {} tasks: {}",
                line, label, published, error
            )?,
            RangeOutcome::NotAttempted => writeln!(out, "  {}{}: not attempted", line, label)?,
            RangeOutcome::Blocked => writeln!(
                out,
                "  {}{}: blocked by an earlier failure of the same run",
                line, label
            )?,
        }
    }
    writeln!(
        out,
        "ranges {}, published tasks {}, failed {}, blocked {}, not attempted {}",
        report.ranges.len(),
        report.published_tasks(),
        report.failed(),
        report.blocked(),
        report.not_attempted()
    )
}

pub(crate) fn write_purge_summary(report: &PurgeReport, out: &mut impl Write) -> io::Result<()> {
    for partition in &report.partitions {
        let previous = partition
            .previous
            .map(|offset| offset.to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "  partition {}: {} -> {} (advanced {})",
            partition.partition, previous, partition.committed, partition.advanced
        )?;
    }
    writeln!(
        out,
        "topic {} group {}: advanced {} messages",
        report.topic,
        report.group,
        report.total_advanced()
    )
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
