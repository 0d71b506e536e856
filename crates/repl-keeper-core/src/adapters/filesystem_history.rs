//! # Filesystem History Store
//!
//! [`HistoryReader`] over history exported to a local directory tree.
//!
//! Each run lives in `<base>/<domainID>/<workflowID>/<runID>.jsonl`, one
//! [`HistoryBatch`] JSON object per line.

use crate::history::{select_batches, HistoryBatch, HistoryError, HistoryReader, HistoryRequest};
use crate::RunKey;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[cfg(test)]
#[path = "filesystem_history_tests.rs"]
mod tests;

/// Filesystem-based history store
///
/// # Examples
///
/// ```no_run
/// use repl_keeper_core::adapters::FilesystemHistoryStore;
/// use std::path::PathBuf;
///
/// let store = FilesystemHistoryStore::new(PathBuf::from("./history-export"));
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemHistoryStore {
    base_path: PathBuf,
}

impl FilesystemHistoryStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path of the file holding one run's history
    fn run_path(&self, domain_id: &str, run: &RunKey) -> Result<PathBuf, HistoryError> {
        for segment in [domain_id, run.workflow_id.as_str(), run.run_id.as_str()] {
            validate_segment(segment)?;
        }

        Ok(self
            .base_path
            .join(domain_id)
            .join(&run.workflow_id)
            .join(format!("{}.jsonl", run.run_id)))
    }

    /// Write a run's history, replacing any existing export
    pub async fn write_run(
        &self,
        domain_id: &str,
        run: &RunKey,
        batches: &[HistoryBatch],
    ) -> Result<(), HistoryError> {
        let path = self.run_path(domain_id, run)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut contents = String::new();
        for batch in batches {
            let line = serde_json::to_string(batch).map_err(|e| HistoryError::Corrupt {
                message: format!("failed to serialize batch: {}", e),
            })?;
            contents.push_str(&line);
            contents.push('\n');
        }

        let temp_path = path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}

fn validate_segment(segment: &str) -> Result<(), HistoryError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0'])
    {
        return Err(HistoryError::InvalidRequest {
            message: format!("'{}' cannot be used as a path segment", segment),
        });
    }
    Ok(())
}

#[async_trait]
impl HistoryReader for FilesystemHistoryStore {
    async fn read_history(
        &self,
        request: &HistoryRequest,
    ) -> Result<Vec<HistoryBatch>, HistoryError> {
        let path = self.run_path(&request.domain_id, &request.run)?;

        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No exported history for run");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut batches = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let batch: HistoryBatch =
                serde_json::from_str(line).map_err(|e| HistoryError::Corrupt {
                    message: format!("{} line {}: {}", path.display(), index + 1, e),
                })?;
            batches.push(batch);
        }

        Ok(select_batches(batches, request))
    }
}
