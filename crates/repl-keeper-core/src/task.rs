//! Replication task model.
//!
//! A replication task tells the standby cluster to apply the events
//! `[first_event_id, next_event_id)` of one workflow run. The payload is
//! opaque to this crate and is carried through byte-for-byte.

use crate::RunKey;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;

/// Kind of replication work a task carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    /// Append a batch of history events
    HistoryAppend,
    /// Synchronise the state of a pending activity
    SyncActivity,
    /// Marker carrying no events of its own
    SyncMarker,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HistoryAppend => "history-append",
            Self::SyncActivity => "sync-activity",
            Self::SyncMarker => "sync-marker",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "history-append" => Ok(Self::HistoryAppend),
            "sync-activity" => Ok(Self::SyncActivity),
            "sync-marker" => Ok(Self::SyncMarker),
            other => Err(format!("unknown task type '{}'", other)),
        }
    }
}

/// A unit of cross-cluster replication work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationTask {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub version: i64,
    pub task_type: TaskType,
    #[serde(default, with = "payload_encoding")]
    pub payload: Bytes,
}

impl ReplicationTask {
    pub fn run_key(&self) -> RunKey {
        RunKey::new(self.workflow_id.clone(), self.run_id.clone())
    }

    /// Identifying fields of this task
    pub fn header(&self) -> TaskHeader {
        TaskHeader {
            domain_id: self.domain_id.clone(),
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            first_event_id: self.first_event_id,
            next_event_id: self.next_event_id,
        }
    }

    /// Check the task invariants, returning a description of the first violation
    pub fn validate(&self) -> Result<(), String> {
        validate_identity(
            &self.domain_id,
            &self.workflow_id,
            &self.run_id,
            self.first_event_id,
            self.next_event_id,
        )
    }
}

/// Identifying fields of a task, decodable without touching the payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHeader {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub first_event_id: i64,
    pub next_event_id: i64,
}

impl TaskHeader {
    /// Column names of [`TaskHeader::to_columns`] output
    pub const COLUMNS: &'static str = "domainID,workflowID,runID,firstEventID,nextEventID";

    pub fn run_key(&self) -> RunKey {
        RunKey::new(self.workflow_id.clone(), self.run_id.clone())
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_identity(
            &self.domain_id,
            &self.workflow_id,
            &self.run_id,
            self.first_event_id,
            self.next_event_id,
        )
    }

    /// Comma separated rendering used by headers-only output
    pub fn to_columns(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.domain_id, self.workflow_id, self.run_id, self.first_event_id, self.next_event_id
        )
    }
}

fn validate_identity(
    domain_id: &str,
    workflow_id: &str,
    run_id: &str,
    first_event_id: i64,
    next_event_id: i64,
) -> Result<(), String> {
    if domain_id.is_empty() {
        return Err("domainId is empty".to_string());
    }
    if workflow_id.is_empty() {
        return Err("workflowId is empty".to_string());
    }
    if run_id.is_empty() {
        return Err("runId is empty".to_string());
    }
    if first_event_id < 0 {
        return Err(format!("firstEventId {} is negative", first_event_id));
    }
    if first_event_id >= next_event_id {
        return Err(format!(
            "firstEventId {} is not below nextEventId {}",
            first_event_id, next_event_id
        ));
    }
    Ok(())
}

/// Serde adapter carrying opaque bytes as standard base64 text
pub mod payload_encoding {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(|e| serde::de::Error::custom(format!("invalid base64 payload: {}", e)))
    }
}
