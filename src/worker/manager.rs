//! Worker lifecycle manager.
//!
//! The `WorkerLifecycleManager` is the only way to obtain a worker. Every
//! worker is created for exactly one job and destroyed after it; workers are
//! never pooled or shared.
//!
//! # Lifecycle
//!
//! ```text
//! ┌──────────────┐   ┌───────┐   ┌────────┐   ┌──────────┐   ┌────────────┐
//! │ Provisioning │──▶│ Ready │──▶│ Leased │──▶│ Draining │──▶│ Terminated │
//! └──────────────┘   └───────┘   └────────┘   └──────────┘   └────────────┘
//!        │                                          ▲
//!        └──────────── readiness timeout ───────────┘
//! ```
//!
//! `acquire` returns a [`WorkerLease`] that owns the worker. `release`
//! consumes the lease; if a lease is dropped without being released (the job
//! future was cancelled) its `Drop` schedules the same teardown.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use secrecy::ExposeSecret;

use crate::config::StorageConfig;
use crate::job::JobId;
use crate::worker::api::{ConvertResponse, ErrorResponse};
use crate::worker::config::{WorkerBackend, WorkerConfig};
use crate::worker::container::{ContainerRunner, ContainerRuntime, connect_docker, container_name};
use crate::worker::error::{Result, WorkerError};
use crate::worker::subprocess::EngineRunner;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Provisioning,
    Ready,
    Leased,
    Draining,
    Terminated,
}

/// How to reach a worker once it is ready.
#[derive(Debug, Clone)]
pub enum WorkerEndpoint {
    /// Run the engine as a child process.
    Engine(EngineRunner),
    /// A container serving `/convert`.
    Http {
        base_url: String,
        container_id: String,
    },
}

/// One isolated execution unit, owned by a single job.
#[derive(Debug)]
pub struct Worker {
    pub id: String,
    pub job_id: JobId,
    pub backend: WorkerBackend,
    pub endpoint: WorkerEndpoint,
    state: WorkerState,
}

impl Worker {
    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn set_state(&mut self, next: WorkerState) {
        tracing::debug!(worker = %self.id, from = ?self.state, to = ?next, "Worker state");
        self.state = next;
    }
}

/// What a worker needs to convert one staged file.
#[derive(Debug, Clone, Copy)]
pub struct ConversionRequest<'a> {
    /// Staged input on the host.
    pub input: &'a Path,
    /// Directory the engine writes into.
    pub out_dir: &'a Path,
    /// Bridge URL for workers that cannot see the host filesystem.
    pub input_url: Option<&'a str>,
}

/// What a worker produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionOutput {
    /// A PDF on the host that still has to be uploaded.
    LocalPdf(PathBuf),
    /// The worker already uploaded the PDF itself.
    Uploaded { converted_url: String },
}

type LeaseSet = Arc<Mutex<HashSet<JobId>>>;

/// Provisions and tears down per-job workers.
pub struct WorkerLifecycleManager {
    config: WorkerConfig,
    container_env: HashMap<String, String>,
    runner: Option<Arc<dyn ContainerRuntime>>,
    leases: LeaseSet,
    http: reqwest::Client,
}

impl WorkerLifecycleManager {
    /// Manager for the subprocess backend. Never touches Docker.
    pub fn subprocess(config: WorkerConfig) -> Self {
        Self {
            config: WorkerConfig {
                backend: WorkerBackend::Subprocess,
                ..config
            },
            container_env: HashMap::new(),
            runner: None,
            leases: Arc::new(Mutex::new(HashSet::new())),
            http: reqwest::Client::new(),
        }
    }

    /// Build a manager for the configured backend.
    ///
    /// For containers this connects to Docker, pulls the image if allowed,
    /// and removes worker containers orphaned by a previous run.
    pub async fn initialize(
        config: WorkerConfig,
        container_env: HashMap<String, String>,
    ) -> Result<Self> {
        if config.backend == WorkerBackend::Subprocess {
            return Ok(Self::subprocess(config));
        }

        let docker = connect_docker().await?;
        let runner = ContainerRunner::new(
            docker,
            config.image.clone(),
            config.container_port,
            config.poll_interval,
            config.stop_grace,
        );
        if !runner.is_available().await {
            return Err(WorkerError::DockerNotAvailable {
                reason: "Docker daemon did not answer ping".to_string(),
            });
        }

        if !runner.image_exists().await {
            if config.auto_pull_image {
                runner.pull_image().await?;
            } else {
                return Err(WorkerError::ContainerCreationFailed {
                    reason: format!(
                        "image {} not found and auto_pull is disabled",
                        config.image
                    ),
                });
            }
        }

        match runner.reap_orphans().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Removed {} orphaned worker containers", n),
            Err(e) => tracing::warn!("Could not list orphaned worker containers: {}", e),
        }

        tracing::info!(image = %config.image, "Container workers initialized");
        Ok(Self::with_runtime(config, container_env, Arc::new(runner)))
    }

    /// Manager for the container backend on top of `runtime`.
    pub fn with_runtime(
        config: WorkerConfig,
        container_env: HashMap<String, String>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            config: WorkerConfig {
                backend: WorkerBackend::Container,
                ..config
            },
            container_env,
            runner: Some(runtime),
            leases: Arc::new(Mutex::new(HashSet::new())),
            http: reqwest::Client::new(),
        }
    }

    pub fn backend(&self) -> WorkerBackend {
        self.config.backend
    }

    /// Number of workers currently leased.
    pub fn leased_count(&self) -> usize {
        self.leases.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Provision a fresh worker for `job_id` and lease it.
    ///
    /// Fails with [`WorkerError::AlreadyLeased`] if the job already holds one.
    pub async fn acquire(&self, job_id: JobId) -> Result<WorkerLease> {
        {
            let mut leases = self.leases.lock().unwrap_or_else(|p| p.into_inner());
            if !leases.insert(job_id) {
                return Err(WorkerError::AlreadyLeased {
                    job_id: job_id.to_string(),
                });
            }
        }

        // From here on the lease slot is owned by the guard, so any early
        // return frees it.
        let mut lease = WorkerLease {
            worker: None,
            runner: self.runner.clone(),
            leases: Arc::clone(&self.leases),
            http: self.http.clone(),
            convert_timeout: self.config.convert_timeout,
            job_id,
            produced: None,
            released: false,
        };

        let provisioned = match self.config.backend {
            WorkerBackend::Subprocess => {
                self.provision_engine(job_id, &mut lease);
                Ok(())
            }
            WorkerBackend::Container => self.provision_container(job_id, &mut lease).await,
        };

        if let Err(e) = provisioned {
            tracing::warn!(job_id = %job_id, "Worker provisioning failed: {}", e);
            lease.teardown().await;
            return Err(e);
        }

        if let Some(worker) = lease.worker.as_mut() {
            worker.set_state(WorkerState::Leased);
        }
        Ok(lease)
    }

    /// Tear down a worker. Never fails; problems are logged.
    pub async fn release(&self, lease: WorkerLease) {
        lease.release().await;
    }

    fn provision_engine(&self, job_id: JobId, lease: &mut WorkerLease) {
        let mut worker = Worker {
            id: format!("engine_{}", job_id),
            job_id,
            backend: WorkerBackend::Subprocess,
            endpoint: WorkerEndpoint::Engine(EngineRunner::new(
                self.config.engine_path.clone(),
                self.config.engine_timeout,
            )),
            state: WorkerState::Provisioning,
        };
        worker.set_state(WorkerState::Ready);
        lease.worker = Some(worker);
    }

    async fn provision_container(&self, job_id: JobId, lease: &mut WorkerLease) -> Result<()> {
        let runner = self
            .runner
            .as_ref()
            .ok_or_else(|| WorkerError::DockerNotAvailable {
                reason: "container backend not initialized".to_string(),
            })?;

        let name = container_name(&job_id.to_string());
        let start = Instant::now();
        tracing::info!(container = %name, "Provisioning worker container");

        let container_id = runner.start(&name, self.container_env.clone()).await?;

        // Attached to the lease before the readiness wait so a timeout or a
        // cancelled job still tears the container down.
        lease.worker = Some(Worker {
            id: name.clone(),
            job_id,
            backend: WorkerBackend::Container,
            endpoint: WorkerEndpoint::Http {
                base_url: String::new(),
                container_id: container_id.clone(),
            },
            state: WorkerState::Provisioning,
        });

        let base_url = runner
            .wait_until_ready(&container_id, &name, self.config.ready_timeout)
            .await?;

        tracing::info!(
            container = %name,
            endpoint = %base_url,
            elapsed = ?start.elapsed(),
            "Worker container ready"
        );

        if let Some(worker) = lease.worker.as_mut() {
            worker.endpoint = WorkerEndpoint::Http {
                base_url,
                container_id,
            };
            worker.set_state(WorkerState::Ready);
        }
        Ok(())
    }
}

/// Exclusive handle on a provisioned worker.
pub struct WorkerLease {
    worker: Option<Worker>,
    runner: Option<Arc<dyn ContainerRuntime>>,
    leases: LeaseSet,
    http: reqwest::Client,
    convert_timeout: Duration,
    job_id: JobId,
    produced: Option<PathBuf>,
    released: bool,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("job_id", &self.job_id)
            .field("worker", &self.worker)
            .field("released", &self.released)
            .finish()
    }
}

impl WorkerLease {
    pub fn worker(&self) -> Option<&Worker> {
        self.worker.as_ref()
    }

    /// Run one conversion on the leased worker.
    pub async fn convert(&mut self, request: ConversionRequest<'_>) -> Result<ConversionOutput> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| WorkerError::Transport {
                reason: "lease has no worker".to_string(),
            })?;

        match &worker.endpoint {
            WorkerEndpoint::Engine(engine) => {
                let pdf = engine.convert(request.input, request.out_dir).await?;
                self.produced = Some(pdf.clone());
                Ok(ConversionOutput::LocalPdf(pdf))
            }
            WorkerEndpoint::Http { base_url, .. } => {
                let input_url = request.input_url.ok_or_else(|| WorkerError::Transport {
                    reason: "container worker needs a bridge URL".to_string(),
                })?;
                convert_remote(&self.http, base_url, input_url, self.convert_timeout).await
            }
        }
    }

    /// Drain and terminate the worker. Idempotent.
    pub async fn release(mut self) {
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(worker) = self.worker.as_mut() {
            worker.set_state(WorkerState::Draining);
        }

        if let Some(pdf) = self.produced.take()
            && let Err(e) = tokio::fs::remove_file(&pdf).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %pdf.display(), "Failed to delete converted PDF: {}", e);
        }

        if let (Some(runner), Some(container_id)) = (self.runner.as_ref(), self.container_id()) {
            runner.stop_and_remove(&container_id).await;
        }

        if let Some(worker) = self.worker.as_mut() {
            worker.set_state(WorkerState::Terminated);
        }
        self.free_slot();
    }

    fn container_id(&self) -> Option<String> {
        match self.worker.as_ref().map(|w| &w.endpoint) {
            Some(WorkerEndpoint::Http { container_id, .. }) => Some(container_id.clone()),
            _ => None,
        }
    }

    fn free_slot(&self) {
        let mut leases = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        leases.remove(&self.job_id);
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.free_slot();

        if let Some(pdf) = self.produced.take() {
            let _ = std::fs::remove_file(pdf);
        }

        if let (Some(runner), Some(container_id)) = (self.runner.clone(), self.container_id()) {
            tracing::warn!(container = %container_id, "Worker lease dropped without release, tearing down");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        runner.stop_and_remove(&container_id).await;
                    });
                }
                Err(_) => {
                    tracing::error!(container = %container_id, "No runtime to tear down worker container")
                }
            }
        }
    }
}

/// POST the bridge URL to a container worker's `/convert`.
async fn convert_remote(
    http: &reqwest::Client,
    base_url: &str,
    input_url: &str,
    timeout: Duration,
) -> Result<ConversionOutput> {
    let url = format!("{}/convert", base_url);
    tracing::info!(worker = base_url, "Forwarding conversion to worker");

    let response = http
        .post(&url)
        .timeout(timeout)
        .form(&[("file_url", input_url)])
        .send()
        .await
        .map_err(|e| transport_error(e, timeout))?;

    let status = response.status();
    if status.is_success() {
        let body: ConvertResponse = response
            .json()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        return Ok(ConversionOutput::Uploaded {
            converted_url: body.converted_url,
        });
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|e| e.error)
        .unwrap_or(text);
    Err(WorkerError::Rejected {
        status: status.as_u16(),
        message,
    })
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> WorkerError {
    if e.is_timeout() {
        WorkerError::Timeout {
            operation: "worker conversion",
            elapsed: timeout,
        }
    } else {
        WorkerError::Transport {
            reason: e.to_string(),
        }
    }
}

/// Environment injected into every worker container.
pub fn container_env(storage: &StorageConfig) -> HashMap<String, String> {
    HashMap::from([
        ("S3_BUCKET_NAME".to_string(), storage.bucket.clone()),
        ("S3_ACCESS_KEY_ID".to_string(), storage.access_key_id.clone()),
        (
            "S3_SECRET_ACCESS_KEY".to_string(),
            storage.secret_access_key.expose_secret().to_string(),
        ),
        ("S3_REGION".to_string(), storage.region.clone()),
        ("S3_ENDPOINT_URL".to_string(), storage.endpoint_url.clone()),
        (
            "PDF_EXPIRE_TIME".to_string(),
            storage.pdf_expire_time.as_secs().to_string(),
        ),
        (
            "DOWNLOAD_URL_PREFIX".to_string(),
            storage.download_url_prefix.clone().unwrap_or_default(),
        ),
        ("WORKER_BACKEND".to_string(), "subprocess".to_string()),
    ])
}


#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use secrecy::SecretString;
    use serde_json::json;

    use super::testing::FakeRuntime;
    use super::*;
    use crate::orchestrator::HttpServer;
    use crate::worker::api::ConvertForm;

    fn engine_config() -> WorkerConfig {
        WorkerConfig {
            engine_path: PathBuf::from("true"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_one_lease_per_job() {
        let manager = WorkerLifecycleManager::subprocess(engine_config());
        let job = JobId::new();

        let lease = manager.acquire(job).await.unwrap();
        assert_eq!(lease.worker().unwrap().state(), WorkerState::Leased);
        assert_eq!(manager.leased_count(), 1);

        let err = manager.acquire(job).await.unwrap_err();
        assert!(matches!(err, WorkerError::AlreadyLeased { .. }));

        manager.release(lease).await;
        assert_eq!(manager.leased_count(), 0);

        // A released job id can lease again; workers themselves are not reused.
        let again = manager.acquire(job).await.unwrap();
        again.release().await;
    }

    #[tokio::test]
    async fn test_distinct_jobs_get_distinct_workers() {
        let manager = WorkerLifecycleManager::subprocess(engine_config());
        let a = manager.acquire(JobId::new()).await.unwrap();
        let b = manager.acquire(JobId::new()).await.unwrap();
        assert_ne!(a.worker().unwrap().id, b.worker().unwrap().id);
        assert_eq!(manager.leased_count(), 2);
        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_slot() {
        let manager = WorkerLifecycleManager::subprocess(engine_config());
        let job = JobId::new();
        {
            let _lease = manager.acquire(job).await.unwrap();
            assert_eq!(manager.leased_count(), 1);
        }
        assert_eq!(manager.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_release_deletes_produced_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("out.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();

        let manager = WorkerLifecycleManager::subprocess(engine_config());
        let mut lease = manager.acquire(JobId::new()).await.unwrap();
        lease.produced = Some(pdf.clone());
        lease.release().await;

        assert!(!pdf.exists());
    }

    #[tokio::test]
    async fn test_container_without_docker_is_provision_error() {
        let manager = WorkerLifecycleManager {
            config: WorkerConfig {
                backend: WorkerBackend::Container,
                ready_timeout: Duration::from_millis(10),
                ..Default::default()
            },
            container_env: HashMap::new(),
            runner: None,
            leases: Arc::new(Mutex::new(HashSet::new())),
            http: reqwest::Client::new(),
        };
        let err = manager.acquire(JobId::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::DockerNotAvailable { .. }));
        assert_eq!(manager.leased_count(), 0);
    }

    /// Stand-in for a worker container's `/convert`. The bridge URL's file
    /// name picks the behaviour.
    async fn mock_worker() -> (HttpServer, String) {
        let app = Router::new().route(
            "/convert",
            post(|Form(form): Form<ConvertForm>| async move {
                let url = form.file_url.unwrap_or_default();
                if url.contains("stall") {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                if url.contains("bad") {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({ "error": "file type not supported, given file type is: .bad" })),
                    );
                }
                (
                    StatusCode::OK,
                    Json(json!({
                        "status": "success",
                        "original_source": url,
                        "converted_url": "https://store/pdfs/convert_file2pdf_server/1.000000_report.pdf",
                    })),
                )
            }),
        );
        let mut server = HttpServer::new(
            "Mock worker",
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            app,
        );
        let addr = server.start().await.unwrap();
        (server, format!("http://{}", addr))
    }

    fn http_lease(base_url: &str, convert_timeout: Duration) -> WorkerLease {
        let job_id = JobId::new();
        WorkerLease {
            worker: Some(Worker {
                id: container_name(&job_id.to_string()),
                job_id,
                backend: WorkerBackend::Container,
                endpoint: WorkerEndpoint::Http {
                    base_url: base_url.to_string(),
                    container_id: "c1".to_string(),
                },
                state: WorkerState::Leased,
            }),
            runner: None,
            leases: Arc::new(Mutex::new(HashSet::from([job_id]))),
            http: reqwest::Client::new(),
            convert_timeout,
            job_id,
            produced: None,
            released: false,
        }
    }

    fn remote_request(input_url: Option<&str>) -> ConversionRequest<'_> {
        ConversionRequest {
            input: Path::new("/staging/report.docx"),
            out_dir: Path::new("/staging"),
            input_url,
        }
    }

    #[tokio::test]
    async fn test_remote_conversion_outcomes() {
        let (mut server, base_url) = mock_worker().await;
        let mut lease = http_lease(&base_url, Duration::from_millis(300));

        let uploaded = lease
            .convert(remote_request(Some("http://bridge/temp/j/report.docx?token=t")))
            .await
            .unwrap();
        assert_eq!(
            uploaded,
            ConversionOutput::Uploaded {
                converted_url: "https://store/pdfs/convert_file2pdf_server/1.000000_report.pdf"
                    .to_string()
            }
        );

        let rejected = lease
            .convert(remote_request(Some("http://bridge/temp/j/report.bad?token=t")))
            .await
            .unwrap_err();
        match rejected {
            WorkerError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "file type not supported, given file type is: .bad");
            }
            other => panic!("expected Rejected, got {:?}", other),
        }

        let stalled = lease
            .convert(remote_request(Some("http://bridge/temp/j/stall.docx?token=t")))
            .await
            .unwrap_err();
        assert!(
            matches!(stalled, WorkerError::Timeout { operation: "worker conversion", .. }),
            "{:?}",
            stalled
        );

        let no_bridge = lease.convert(remote_request(None)).await.unwrap_err();
        assert!(matches!(no_bridge, WorkerError::Transport { .. }));

        lease.release().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_container_lease_is_removed_on_release() {
        let runtime = Arc::new(FakeRuntime::ready_at("http://127.0.0.1:1"));
        let manager = WorkerLifecycleManager::with_runtime(
            WorkerConfig::default(),
            HashMap::new(),
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        );
        assert_eq!(manager.backend(), WorkerBackend::Container);

        let job = JobId::new();
        let lease = manager.acquire(job).await.unwrap();
        let worker = lease.worker().unwrap();
        assert_eq!(worker.id, container_name(&job.to_string()));
        assert_eq!(worker.state(), WorkerState::Leased);

        manager.release(lease).await;
        assert_eq!(runtime.removed(), vec![format!("id-pdf_converter_{}", job)]);
        assert_eq!(manager.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_readiness_timeout_removes_container() {
        let runtime = Arc::new(FakeRuntime::never_ready());
        let manager = WorkerLifecycleManager::with_runtime(
            WorkerConfig {
                ready_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            HashMap::new(),
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        );

        let err = manager.acquire(JobId::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::ReadinessTimeout { .. }));
        assert!(matches!(
            crate::error::ConvertError::from(err),
            crate::error::ConvertError::Provision { .. }
        ));
        assert_eq!(runtime.removed().len(), 1);
        assert_eq!(manager.leased_count(), 0);
    }

    #[test]
    fn test_container_env_carries_storage_settings() {
        let storage = StorageConfig {
            bucket: "pdfs".into(),
            access_key_id: "ak".into(),
            secret_access_key: SecretString::from("sk"),
            region: "us-east-1".into(),
            endpoint_url: "http://minio:9000".into(),
            download_url_prefix: None,
            pdf_expire_time: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
        };
        let env = container_env(&storage);
        assert_eq!(env["S3_SECRET_ACCESS_KEY"], "sk");
        assert_eq!(env["PDF_EXPIRE_TIME"], "60");
        assert_eq!(env["DOWNLOAD_URL_PREFIX"], "");
        assert_eq!(env["WORKER_BACKEND"], "subprocess");
    }
}
