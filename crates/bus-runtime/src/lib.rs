//! # Bus Runtime
//!
//! Partitioned message bus runtime used by the Repl-Keeper recovery tools,
//! with a Kafka provider and an in-memory implementation.
//!
//! This library provides:
//! - Topic, partition, offset and consumer group types
//! - Provider-agnostic produce, fetch, watermark and offset commit operations
//! - A pooled client with per-call timeouts
//! - Fault injection on the in-memory provider for tests
//!
//! ## Module Organization
//!
//! - [error] - Error types for all bus operations
//! - [message] - Messages, topics and offset cursors
//! - [provider] - Provider types and configuration
//! - [client] - Provider trait and pooled client

// Module declarations
pub mod client;
pub mod error;
pub mod message;
pub mod provider;
pub mod providers;

// Re-export commonly used types at crate root for convenience
pub use client::{BusClient, BusClientFactory, BusProvider};
pub use error::{BusError, ConfigurationError, ValidationError};
pub use message::{
    BusMessage, ConsumerGroup, Offset, PartitionId, ReceivedMessage, TopicName, Watermarks,
};
pub use provider::{BusConfig, InMemoryConfig, KafkaConfig, ProviderConfig, ProviderType};
pub use providers::{InMemoryProvider, InjectedFault};
