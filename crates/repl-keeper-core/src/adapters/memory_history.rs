//! # In-Memory History Store
//!
//! [`HistoryReader`] over batches held in process memory, for tests and dry runs.

use crate::history::{select_batches, HistoryBatch, HistoryError, HistoryReader, HistoryRequest};
use crate::RunKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[cfg(test)]
#[path = "memory_history_tests.rs"]
mod tests;

/// History store keeping each run's batches in a map
#[derive(Default)]
pub struct InMemoryHistoryStore {
    runs: RwLock<HashMap<(String, RunKey), Vec<HistoryBatch>>>,
    unavailable_reads: RwLock<u32>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append batches to a run's history
    pub fn insert_batches(
        &self,
        domain_id: &str,
        run: &RunKey,
        batches: impl IntoIterator<Item = HistoryBatch>,
    ) -> Result<(), HistoryError> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        runs.entry((domain_id.to_string(), run.clone()))
            .or_default()
            .extend(batches);
        Ok(())
    }

    /// Fail the next `count` reads as if the store were unreachable
    pub fn fail_next_reads(&self, count: u32) -> Result<(), HistoryError> {
        *self.unavailable_reads.write().map_err(|_| poisoned())? = count;
        Ok(())
    }
}

fn poisoned() -> HistoryError {
    HistoryError::Unavailable {
        message: "history store lock poisoned".to_string(),
    }
}

#[async_trait]
impl HistoryReader for InMemoryHistoryStore {
    async fn read_history(
        &self,
        request: &HistoryRequest,
    ) -> Result<Vec<HistoryBatch>, HistoryError> {
        {
            let mut failures = self.unavailable_reads.write().map_err(|_| poisoned())?;
            if *failures > 0 {
                *failures -= 1;
                return Err(HistoryError::Unavailable {
                    message: "injected store outage".to_string(),
                });
            }
        }

        let runs = self.runs.read().map_err(|_| poisoned())?;
        let batches = runs
            .get(&(request.domain_id.clone(), request.run.clone()))
            .cloned()
            .unwrap_or_default();
        Ok(select_batches(batches, request))
    }
}
