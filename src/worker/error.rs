//! Error types for worker lifecycle and execution.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur while provisioning, using or tearing down a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Docker daemon is not available or not running.
    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    /// Failed to create container.
    #[error("Container creation failed: {reason}")]
    ContainerCreationFailed { reason: String },

    /// Failed to start container.
    #[error("Container start failed: {reason}")]
    ContainerStartFailed { reason: String },

    /// The worker did not become ready within the bounded wait.
    #[error("Worker {worker} not ready after {waited:?}")]
    ReadinessTimeout { worker: String, waited: Duration },

    /// A worker is already leased for this job.
    #[error("Job {job_id} already holds a worker")]
    AlreadyLeased { job_id: String },

    /// The conversion engine exited non-zero.
    #[error("conversion engine exited with code {exit_code}: {stderr}")]
    EngineFailed { exit_code: i32, stderr: String },

    /// The engine exited cleanly but no PDF was written.
    #[error("converted PDF not found at {}", path.display())]
    OutputMissing { path: PathBuf },

    /// A container worker answered the conversion call with an error.
    #[error("worker rejected conversion ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The conversion call to a container worker failed in transit.
    #[error("worker request failed: {reason}")]
    Transport { reason: String },

    /// A bounded operation timed out.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// Docker API error.
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
