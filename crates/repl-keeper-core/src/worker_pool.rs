//! # Run-Partitioned Worker Pool
//!
//! Executes jobs concurrently while keeping every workflow run serial.
//!
//! Each worker owns a bounded channel. A job is routed by hashing its
//! [`RunKey`], so all jobs of one run land on the same worker and execute in
//! submission order, while different runs proceed in parallel.

use crate::{AdminError, RunKey};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[cfg(test)]
#[path = "worker_pool_tests.rs"]
mod tests;

/// Per-worker state processing jobs one at a time
#[async_trait]
pub trait RunWorker: Send + 'static {
    type Job: Send + 'static;
    type Output: Send + 'static;

    async fn handle(&mut self, job: Self::Job);

    /// Consume the worker once its queue is drained
    fn finish(self) -> Self::Output;
}

/// Fixed set of workers fed through per-worker channels
pub struct RunPartitionedPool<W: RunWorker> {
    senders: Vec<mpsc::Sender<W::Job>>,
    handles: Vec<JoinHandle<W::Output>>,
}

impl<W: RunWorker> RunPartitionedPool<W> {
    /// Spawn `workers` workers (at least one), each with a queue of `capacity` jobs
    pub fn spawn(workers: usize, capacity: usize, mut factory: impl FnMut(usize) -> W) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (sender, mut receiver) = mpsc::channel::<W::Job>(capacity.max(1));
            let mut worker = factory(index);
            handles.push(tokio::spawn(async move {
                while let Some(job) = receiver.recv().await {
                    worker.handle(job).await;
                }
                debug!(worker = index, "Worker drained");
                worker.finish()
            }));
            senders.push(sender);
        }

        Self { senders, handles }
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Index of the worker that owns `run`
    pub fn worker_for(&self, run: &RunKey) -> usize {
        let mut hasher = DefaultHasher::new();
        run.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queue a job behind earlier jobs of the same run, waiting for queue space
    pub async fn submit(&self, run: &RunKey, job: W::Job) -> Result<(), AdminError> {
        let worker = self.worker_for(run);
        self.senders[worker]
            .send(job)
            .await
            .map_err(|_| AdminError::Cancelled)
    }

    /// Close the queues and wait for every worker to drain.
    ///
    /// Outputs are returned in worker index order.
    pub async fn join(self) -> Result<Vec<W::Output>, AdminError> {
        drop(self.senders);

        let mut outputs = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            let output = handle.await.map_err(|e| AdminError::WorkerFailed {
                message: e.to_string(),
            })?;
            outputs.push(output);
        }
        Ok(outputs)
    }
}
