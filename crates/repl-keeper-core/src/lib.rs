//! # Repl-Keeper Core
//!
//! Recovery and redistribution of cross-cluster replication tasks for a
//! sharded workflow engine.
//!
//! The crate covers the operator workflows used when replication between
//! clusters has gone wrong:
//! - Routing a workflow to its history shard ([`shard`])
//! - Encoding and decoding replication tasks ([`codec`])
//! - Publishing tasks to the shard-aligned partition of a bus topic ([`publisher`])
//! - Inspecting and re-driving dead-letter queues ([`dlq_replay`])
//! - Regenerating tasks from stored workflow history ([`rereplication`])
//! - Skipping a consumer group past its backlog ([`topic_purge`])
//!
//! ## Architecture
//!
//! Business logic depends on two seams:
//! - [`history::HistoryReader`] for the workflow history store
//! - [`bus_runtime::BusClient`] for the partitioned message bus
//!
//! Both have in-memory implementations so every workflow can be exercised
//! without external infrastructure.
//!
//! ## Usage
//!
//! ```rust
//! use repl_keeper_core::shard::ShardRouter;
//!
//! let router = ShardRouter::new(16384).unwrap();
//! let shard = router.shard_for("order-7731");
//! assert!((0..16384).contains(&shard));
//! ```

use bus_runtime::BusError;
use std::fmt;

pub mod adapters;
pub mod codec;
pub mod config;
pub mod dlq_replay;
pub mod history;
pub mod publisher;
pub mod rereplication;
pub mod retry;
pub mod shard;
pub mod sink;
pub mod task;
pub mod topic_purge;
pub mod topology;
pub mod worker_pool;

pub use codec::{SourceLocation, TaskCodec};
pub use history::{HistoryBatch, HistoryError, HistoryReader, HistoryRequest};
pub use shard::{shard_for, ShardId, ShardRouter};
pub use task::{ReplicationTask, TaskHeader, TaskType};

/// Standard result type for recovery operations
pub type AdminResult<T> = Result<T, AdminError>;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Identity of one workflow execution.
///
/// All tasks and ranges sharing a `RunKey` are processed in input order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunKey {
    pub workflow_id: String,
    pub run_id: String,
}

impl RunKey {
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Top-level error for recovery operations
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    #[error("Malformed replication task at {location}: {message}")]
    MalformedTask {
        location: SourceLocation,
        message: String,
    },

    #[error(
        "Publishing task for {run} (first event {first_event_id}) failed after {attempts} attempts: {last_error}"
    )]
    PublishExhausted {
        run: RunKey,
        first_event_id: i64,
        attempts: u32,
        last_error: String,
    },

    #[error("Topic not found: {topic}")]
    TopicNotFound { topic: String },

    #[error("Offset commit for group '{group}' on topic '{topic}' failed: {message}")]
    GroupCommit {
        group: String,
        topic: String,
        message: String,
    },

    #[error("Invalid event range: {message}")]
    InvalidRange { message: String },

    #[error("History of {run} is not contiguous: {message}")]
    HistoryGap { run: RunKey, message: String },

    #[error("History store error: {0}")]
    History(#[from] HistoryError),

    #[error("Bus error: {0}")]
    Bus(BusError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {message}")]
    WorkerFailed { message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl AdminError {
    /// Check if a later attempt of the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::History(e) => e.is_transient(),
            Self::Bus(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }
}

impl From<BusError> for AdminError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::TopicNotFound { topic } => Self::TopicNotFound { topic },
            BusError::CommitRejected {
                group,
                topic,
                message,
            } => Self::GroupCommit {
                group,
                topic,
                message,
            },
            BusError::ConnectionFailed { message } => Self::Connection {
                target: "message bus".to_string(),
                message,
            },
            BusError::ConfigurationError(e) => Self::InvalidConfiguration {
                message: e.to_string(),
            },
            BusError::ValidationError(e) => Self::InvalidConfiguration {
                message: e.to_string(),
            },
            other => Self::Bus(other),
        }
    }
}
