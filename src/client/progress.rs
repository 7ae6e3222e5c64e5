//! Batch progress reporting.
//!
//! Conversions finish concurrently, so they never touch shared counters.
//! Each finished job sends one [`Completion`] over a channel to a single
//! aggregator task, which owns the counts and forwards snapshots to a
//! [`ProgressSink`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Counts as seen after one more job finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub done: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// File name of the job that just finished.
    pub current: String,
}

/// Receives batch progress. All methods default to no-ops.
pub trait ProgressSink: Send + Sync {
    /// Called once before any job starts.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called each time a job finishes, in completion order.
    fn on_job_complete(&self, snapshot: &ProgressSnapshot) {
        let _ = snapshot;
    }

    /// Called once after every job has finished.
    fn on_batch_complete(&self, snapshot: &ProgressSnapshot) {
        let _ = snapshot;
    }
}

/// Sink for callers that don't want progress.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}

/// One finished job.
#[derive(Debug, Clone)]
pub struct Completion {
    pub file: String,
    pub success: bool,
}

/// Owns the batch counters.
pub struct ProgressAggregator {
    total: usize,
    tx: mpsc::UnboundedSender<Completion>,
    handle: JoinHandle<ProgressSnapshot>,
}

impl ProgressAggregator {
    /// Start the aggregator task for a batch of `total` jobs.
    pub fn start(total: usize, sink: Arc<dyn ProgressSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        sink.on_batch_start(total);

        let handle = tokio::spawn(async move {
            let mut snapshot = ProgressSnapshot {
                total,
                done: 0,
                succeeded: 0,
                failed: 0,
                current: String::new(),
            };
            while let Some(completion) = rx.recv().await {
                snapshot.done += 1;
                if completion.success {
                    snapshot.succeeded += 1;
                } else {
                    snapshot.failed += 1;
                }
                snapshot.current = completion.file;
                sink.on_job_complete(&snapshot);
            }
            sink.on_batch_complete(&snapshot);
            snapshot
        });

        Self { total, tx, handle }
    }

    /// Sender handed to each job.
    pub fn sender(&self) -> mpsc::UnboundedSender<Completion> {
        self.tx.clone()
    }

    /// Close the channel and wait for the final counts.
    pub async fn finish(self) -> ProgressSnapshot {
        drop(self.tx);
        match self.handle.await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("Progress aggregator failed: {}", e);
                ProgressSnapshot {
                    total: self.total,
                    done: 0,
                    succeeded: 0,
                    failed: 0,
                    current: String::new(),
                }
            }
        }
    }
}
