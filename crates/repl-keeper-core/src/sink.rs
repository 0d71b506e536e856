//! # Task Output Sink
//!
//! Passive destination for tasks read by the DLQ replayer.
//!
//! Output only becomes visible when the run succeeds. File output is written
//! to a sibling `.partial` file that is renamed over the destination on
//! commit; stdout output is buffered in memory and flushed on commit. An
//! aborted run leaves no output behind.

use crate::codec::TaskCodec;
use crate::task::{ReplicationTask, TaskHeader};
use crate::AdminError;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "sink_tests.rs"]
mod tests;

/// Shape of each output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// The full task as a JSON line
    #[default]
    Full,
    /// Only the identifying columns
    HeadersOnly,
}

/// Shared in-memory buffer receiving committed output
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Where committed output goes
#[derive(Debug, Clone)]
pub enum OutputDestination {
    Stdout,
    File(PathBuf),
    Buffer(SharedBuffer),
}

enum PendingOutput {
    Memory(Vec<u8>),
    Partial {
        writer: BufWriter<fs::File>,
        partial_path: PathBuf,
        final_path: PathBuf,
    },
}

/// Writer that publishes its output atomically on [`TaskWriter::commit`]
pub struct TaskWriter {
    format: OutputFormat,
    destination: OutputDestination,
    pending: PendingOutput,
    lines: u64,
}

impl TaskWriter {
    pub async fn create(
        destination: OutputDestination,
        format: OutputFormat,
    ) -> Result<Self, AdminError> {
        let pending = match &destination {
            OutputDestination::File(path) => {
                let partial_path = partial_path(path);
                let file = fs::File::create(&partial_path).await?;
                PendingOutput::Partial {
                    writer: BufWriter::new(file),
                    partial_path,
                    final_path: path.clone(),
                }
            }
            OutputDestination::Stdout | OutputDestination::Buffer(_) => {
                PendingOutput::Memory(Vec::new())
            }
        };

        let mut writer = Self {
            format,
            destination,
            pending,
            lines: 0,
        };
        if format == OutputFormat::HeadersOnly {
            writer.write_line(TaskHeader::COLUMNS).await?;
            writer.lines = 0;
        }
        Ok(writer)
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Number of task lines written so far
    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub async fn write_task(&mut self, task: &ReplicationTask) -> Result<(), AdminError> {
        match self.format {
            OutputFormat::Full => {
                let line = TaskCodec::encode_line(task)?;
                self.write_line(&line).await
            }
            OutputFormat::HeadersOnly => self.write_header(&task.header()).await,
        }
    }

    pub async fn write_header(&mut self, header: &TaskHeader) -> Result<(), AdminError> {
        let line = header.to_columns();
        self.write_line(&line).await
    }

    async fn write_line(&mut self, line: &str) -> Result<(), AdminError> {
        match &mut self.pending {
            PendingOutput::Memory(buffer) => {
                buffer.extend_from_slice(line.as_bytes());
                buffer.push(b'\n');
            }
            PendingOutput::Partial { writer, .. } => {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
        }
        self.lines += 1;
        Ok(())
    }

    /// Make the output visible at its destination
    pub async fn commit(self) -> Result<(), AdminError> {
        match self.pending {
            PendingOutput::Memory(buffer) => match self.destination {
                OutputDestination::Buffer(shared) => {
                    let mut target = shared
                        .lock()
                        .map_err(|_| std::io::Error::other("output buffer lock poisoned"))?;
                    target.extend_from_slice(&buffer);
                }
                _ => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&buffer).await?;
                    stdout.flush().await?;
                }
            },
            PendingOutput::Partial {
                mut writer,
                partial_path,
                final_path,
            } => {
                writer.flush().await?;
                writer.get_ref().sync_all().await?;
                drop(writer);
                fs::rename(&partial_path, &final_path).await?;
                debug!(path = %final_path.display(), lines = self.lines, "Output committed");
            }
        }
        Ok(())
    }

    /// Discard everything written so far
    pub async fn abort(self) -> Result<(), AdminError> {
        if let PendingOutput::Partial {
            writer,
            partial_path,
            ..
        } = self.pending
        {
            drop(writer);
            if let Err(e) = fs::remove_file(&partial_path).await {
                warn!(path = %partial_path.display(), error = %e, "Failed to remove partial output");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

fn partial_path(path: &std::path::Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
