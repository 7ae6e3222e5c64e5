//! Configuration for conversion workers.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the worker lifecycle manager.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Where conversions run.
    pub backend: WorkerBackend,
    /// Docker image for container workers.
    pub image: String,
    /// Port the worker image serves `/convert` on inside the container.
    pub container_port: u16,
    /// How long a container may take to become ready.
    pub ready_timeout: Duration,
    /// Sleep between readiness checks.
    pub poll_interval: Duration,
    /// Grace period given to `docker stop` before the container is killed.
    pub stop_grace: Duration,
    /// Timeout for the conversion call against a container worker.
    pub convert_timeout: Duration,
    /// Conversion engine executable for subprocess workers.
    pub engine_path: PathBuf,
    /// Timeout for a single engine run.
    pub engine_timeout: Duration,
    /// Whether to pull the worker image at startup if it is missing.
    pub auto_pull_image: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend: WorkerBackend::Subprocess,
            image: "swr.cn-north-4.myhuaweicloud.com/wyyy/convert2pdf_server:0.4.0".to_string(),
            container_port: 7758,
            ready_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            stop_grace: Duration::from_secs(10),
            convert_timeout: Duration::from_secs(600),
            engine_path: PathBuf::from("soffice"),
            engine_timeout: Duration::from_secs(300),
            auto_pull_image: true,
        }
    }
}

/// Isolation backend for workers.
///
/// ```text
/// ┌─────────────┬──────────────────────────┬──────────────────────────────┐
/// │ Backend     │ Worker                   │ Input access                 │
/// ├─────────────┼──────────────────────────┼──────────────────────────────┤
/// │ Subprocess  │ engine process per job   │ staged path on local disk    │
/// │ Container   │ fresh container per job  │ URL through the file bridge  │
/// └─────────────┴──────────────────────────┴──────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerBackend {
    #[default]
    Subprocess,
    Container,
}

impl WorkerBackend {
    /// Returns true if the worker cannot see the host filesystem and has to
    /// fetch its input through the bridge.
    pub fn needs_bridge(&self) -> bool {
        matches!(self, WorkerBackend::Container)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerBackend::Subprocess => "subprocess",
            WorkerBackend::Container => "container",
        }
    }
}

impl std::fmt::Display for WorkerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "subprocess" | "process" | "local" => Ok(WorkerBackend::Subprocess),
            "container" | "docker" => Ok(WorkerBackend::Container),
            _ => Err(format!(
                "invalid worker backend '{}', expected 'subprocess' or 'container'",
                s
            )),
        }
    }
}
