//! Error types for the conversion service.
//!
//! [`ConvertError`] is the job-level taxonomy: every failed job carries exactly
//! one of these, and the ingress API maps it straight onto an HTTP status.
//! Component errors ([`crate::worker::WorkerError`],
//! [`crate::storage::StorageError`], ...) convert into it at the orchestrator
//! boundary.

use std::time::Duration;

use axum::http::StatusCode;

use crate::storage::StorageError;
use crate::worker::WorkerError;

/// Why a job failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConvertError {
    /// The request can never succeed as submitted (bad extension, already a
    /// PDF, missing file).
    #[error("{0}")]
    Validation(String),

    /// Local filesystem failure while staging or reading files.
    #[error("I/O error: {reason}")]
    Io { reason: String },

    /// The source URL could not be fetched.
    #[error("Failed to download file: {reason}")]
    Download { reason: String },

    /// The worker never became ready.
    #[error("Worker provisioning failed: {reason}")]
    Provision { reason: String },

    /// The conversion engine ran but did not produce a PDF.
    #[error("Failed to convert file: {reason}")]
    Conversion { reason: String },

    /// The artifact store rejected the upload.
    #[error("Failed to upload file to storage: {reason}")]
    Storage { reason: String },

    /// A bounded wait was exceeded.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },
}

impl ConvertError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// HTTP status for the public API. 4xx for client-caused, 5xx for
    /// environment-caused failures.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Io { .. } | Self::Conversion { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Download { .. } | Self::Storage { .. } => StatusCode::BAD_GATEWAY,
            Self::Provision { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Validation failures are deterministic; everything else may pass on a
    /// later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }

    /// Short machine-readable name of the error kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Io { .. } => "io",
            Self::Download { .. } => "download",
            Self::Provision { .. } => "provision",
            Self::Conversion { .. } => "conversion",
            Self::Storage { .. } => "storage",
            Self::Timeout { .. } => "timeout",
        }
    }
}

impl From<std::io::Error> for ConvertError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            reason: e.to_string(),
        }
    }
}

impl From<WorkerError> for ConvertError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::ReadinessTimeout { .. }
            | WorkerError::DockerNotAvailable { .. }
            | WorkerError::ContainerCreationFailed { .. }
            | WorkerError::ContainerStartFailed { .. }
            | WorkerError::AlreadyLeased { .. }
            | WorkerError::Docker(_) => Self::Provision {
                reason: e.to_string(),
            },
            WorkerError::Timeout { operation, elapsed } => Self::Timeout { operation, elapsed },
            WorkerError::EngineFailed { .. }
            | WorkerError::OutputMissing { .. }
            | WorkerError::Rejected { .. }
            | WorkerError::Transport { .. } => Self::Conversion {
                reason: e.to_string(),
            },
            WorkerError::Io(io) => Self::Io {
                reason: io.to_string(),
            },
        }
    }
}

impl From<StorageError> for ConvertError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(io) => Self::Io {
                reason: io.to_string(),
            },
            other => Self::Storage {
                reason: other.to_string(),
            },
        }
    }
}

/// Errors raised while building [`crate::config::Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting: {key}")]
    Missing { key: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Result type for job-level operations.
pub type Result<T> = std::result::Result<T, ConvertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_maps_to_bad_request_and_is_final() {
        let e = ConvertError::validation("file is already pdf");
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
        assert!(!e.is_retryable());
        assert_eq!(e.to_string(), "file is already pdf");
    }

    #[test]
    fn test_environment_errors_are_5xx_and_retryable() {
        let errors = [
            ConvertError::Io {
                reason: "disk full".into(),
            },
            ConvertError::Download {
                reason: "HTTP 404".into(),
            },
            ConvertError::Provision {
                reason: "no docker".into(),
            },
            ConvertError::Conversion {
                reason: "exit 1".into(),
            },
            ConvertError::Storage {
                reason: "denied".into(),
            },
            ConvertError::Timeout {
                operation: "download",
                elapsed: Duration::from_secs(1),
            },
        ];
        for e in errors {
            assert!(e.status_code().is_server_error(), "{} should be 5xx", e.kind());
            assert!(e.is_retryable());
        }
    }

    #[test]
    fn test_readiness_timeout_is_a_provision_failure() {
        let e: ConvertError = WorkerError::ReadinessTimeout {
            worker: "pdf_converter_x".into(),
            waited: Duration::from_secs(60),
        }
        .into();
        assert!(matches!(e, ConvertError::Provision { .. }));
    }

    #[test]
    fn test_engine_failure_is_a_conversion_failure() {
        let e: ConvertError = WorkerError::EngineFailed {
            exit_code: 1,
            stderr: "boom".into(),
        }
        .into();
        assert!(matches!(e, ConvertError::Conversion { .. }));
        assert!(e.to_string().contains("boom"));
    }
}
