//! # History Store Adapters
//!
//! Concrete [`HistoryReader`](crate::history::HistoryReader) implementations.

pub mod filesystem_history;
pub mod memory_history;

pub use filesystem_history::FilesystemHistoryStore;
pub use memory_history::InMemoryHistoryStore;
