//! # Replication Task Codec
//!
//! Converts between [`ReplicationTask`] values and their wire form.
//!
//! The same encoding is used for bus message payloads and for the lines of
//! task files: one JSON object per task with the payload carried as base64.
//! Decoding validates the task invariants so a structurally valid but
//! semantically broken record is reported as malformed, together with where
//! it was read from.

use crate::task::{ReplicationTask, TaskHeader};
use crate::AdminError;
use bus_runtime::{Offset, PartitionId, ReceivedMessage};
use bytes::Bytes;
use std::fmt;

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;

/// Where a raw task record was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourceLocation {
    /// 1-based line of a task file
    Line(u64),
    /// Position within a bus topic
    Offset {
        partition: PartitionId,
        offset: Offset,
    },
    Unknown,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line(line) => write!(f, "line {}", line),
            Self::Offset { partition, offset } => {
                write!(f, "partition {} offset {}", partition, offset)
            }
            Self::Unknown => f.write_str("unknown location"),
        }
    }
}

/// Stateless encoder/decoder for replication tasks
pub struct TaskCodec;

impl TaskCodec {
    /// Serialize a task to its wire form
    pub fn encode(task: &ReplicationTask) -> Result<Bytes, AdminError> {
        serde_json::to_vec(task)
            .map(Bytes::from)
            .map_err(|e| AdminError::MalformedTask {
                location: SourceLocation::Unknown,
                message: format!("failed to encode task: {}", e),
            })
    }

    /// Serialize a task as a single text line without the trailing newline
    pub fn encode_line(task: &ReplicationTask) -> Result<String, AdminError> {
        serde_json::to_string(task).map_err(|e| AdminError::MalformedTask {
            location: SourceLocation::Unknown,
            message: format!("failed to encode task: {}", e),
        })
    }

    /// Deserialize and validate a full task
    pub fn decode(bytes: &[u8], location: SourceLocation) -> Result<ReplicationTask, AdminError> {
        let task: ReplicationTask =
            serde_json::from_slice(bytes).map_err(|e| malformed(location, e.to_string()))?;
        task.validate().map_err(|message| malformed(location, message))?;
        Ok(task)
    }

    /// Deserialize only the identifying fields, skipping payload decoding
    pub fn decode_header_only(
        bytes: &[u8],
        location: SourceLocation,
    ) -> Result<TaskHeader, AdminError> {
        let header: TaskHeader =
            serde_json::from_slice(bytes).map_err(|e| malformed(location, e.to_string()))?;
        header
            .validate()
            .map_err(|message| malformed(location, message))?;
        Ok(header)
    }

    /// Decode a message consumed from the bus
    pub fn decode_message(message: &ReceivedMessage) -> Result<ReplicationTask, AdminError> {
        Self::decode(
            &message.payload,
            SourceLocation::Offset {
                partition: message.partition,
                offset: message.offset,
            },
        )
    }
}

fn malformed(location: SourceLocation, message: String) -> AdminError {
    AdminError::MalformedTask { location, message }
}
