//! Message types for bus operations including core topic identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Partition index within a topic
pub type PartitionId = i32;

/// Position of a message within a partition
pub type Offset = i64;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated topic name following the broker's naming restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicName(String);

impl TopicName {
    /// Create new topic name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 249 {
            return Err(ValidationError::OutOfRange {
                field: "topic".to_string(),
                message: "must be 1-249 characters".to_string(),
            });
        }

        if name == "." || name == ".." {
            return Err(ValidationError::InvalidFormat {
                field: "topic".to_string(),
                message: "'.' and '..' are reserved".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "topic".to_string(),
                message: "only ASCII alphanumeric, '.', '-' and '_' allowed".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get topic name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TopicName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Consumer group whose committed offsets are managed by the tool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerGroup(String);

impl ConsumerGroup {
    /// Create new consumer group identifier with validation
    pub fn new(group: String) -> Result<Self, ValidationError> {
        if group.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "consumer_group".to_string(),
            });
        }

        if group.len() > 255 {
            return Err(ValidationError::OutOfRange {
                field: "consumer_group".to_string(),
                message: "maximum 255 characters".to_string(),
            });
        }

        Ok(Self(group))
    }

    /// Get group as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConsumerGroup {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Low and high watermarks of a partition.
///
/// `high` is the offset the next produced message will receive, so a
/// partition holds messages in `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    pub low: Offset,
    pub high: Offset,
}

impl Watermarks {
    /// Number of messages currently retained in the partition
    pub fn retained(&self) -> i64 {
        (self.high - self.low).max(0)
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be produced to a topic partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

impl BusMessage {
    /// Create message with payload only
    pub fn new(payload: Bytes) -> Self {
        Self {
            key: None,
            payload,
            headers: HashMap::new(),
        }
    }

    /// Set the partitioning key
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Total size used for broker size limits
    pub fn size(&self) -> usize {
        self.payload.len()
            + self.key.as_ref().map(|k| k.len()).unwrap_or(0)
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// A message read back from a topic partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
