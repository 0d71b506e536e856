//! # Workflow History Store
//!
//! Read-only access to the persisted event history of workflow runs.
//!
//! History is stored as an ordered sequence of event batches. Each batch
//! covers the half-open event range `[first_event_id, next_event_id)` and
//! carries the failover version it was written under. Consecutive batches of
//! a healthy run tile the history without gaps or overlaps.

use crate::RunKey;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(test)]
#[path = "history_tests.rs"]
mod tests;

/// One persisted batch of history events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryBatch {
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub version: i64,
    #[serde(default, with = "crate::task::payload_encoding")]
    pub events: Bytes,
}

impl HistoryBatch {
    /// Whether any event of this batch falls inside `[min, max)`; an absent bound is open
    pub fn intersects(&self, min_event_id: Option<i64>, max_event_id: Option<i64>) -> bool {
        let above_min = min_event_id.map_or(true, |min| self.next_event_id > min);
        let below_max = max_event_id.map_or(true, |max| self.first_event_id < max);
        above_min && below_max
    }
}

/// Request for the batches of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub domain_id: String,
    pub run: RunKey,
    /// Inclusive lower bound, unbounded when absent
    pub min_event_id: Option<i64>,
    /// Exclusive upper bound, unbounded when absent
    pub max_event_id: Option<i64>,
}

/// Errors raised by history store adapters
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("History store unavailable: {message}")]
    Unavailable { message: String },

    #[error("History read timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Corrupt history data: {message}")]
    Corrupt { message: String },

    #[error("Invalid history request: {message}")]
    InvalidRequest { message: String },

    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HistoryError {
    /// Check if the read may succeed when retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

/// Interface for reading stored workflow history.
///
/// Implementations return the batches of the requested run that intersect
/// the requested bounds, ordered by `first_event_id`. A run with no stored
/// history yields an empty list rather than an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryReader: Send + Sync {
    async fn read_history(&self, request: &HistoryRequest)
        -> Result<Vec<HistoryBatch>, HistoryError>;
}

/// Order batches and drop those outside the requested bounds
pub(crate) fn select_batches(
    mut batches: Vec<HistoryBatch>,
    request: &HistoryRequest,
) -> Vec<HistoryBatch> {
    batches.retain(|b| b.intersects(request.min_event_id, request.max_event_id));
    batches.sort_by_key(|b| b.first_event_id);
    batches
}
