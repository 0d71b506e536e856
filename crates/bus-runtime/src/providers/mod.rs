//! Bus provider implementations.
//!
//! This module contains concrete implementations of the `BusProvider` trait
//! for different broker backends.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::KafkaProvider;
pub use memory::{InjectedFault, InMemoryProvider};
