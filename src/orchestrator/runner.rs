//! Drives one job from intake to a terminal state.
//!
//! ```text
//! validate ─▶ stage ─▶ acquire worker ─▶ convert ─▶ upload
//!                │            │              │         │
//!                └────────────┴──── cleanup (always) ──┘
//! ```
//!
//! The steps inside a job are strictly sequential. Jobs share nothing but
//! read-only configuration, the artifact store and the bridge registry.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::Instrument;

use crate::config::Config;
use crate::error::ConvertError;
use crate::formats::SupportedFormats;
use crate::job::{Downloader, Job, JobId, JobState, Source, StagingDir};
use crate::orchestrator::bridge::{BridgeTicket, TempFileBridge};
use crate::storage::{ArtifactStore, PDF_CONTENT_TYPE, expiry_metadata, object_key};
use crate::worker::{ConversionOutput, ConversionRequest, WorkerLease, WorkerLifecycleManager};

/// Terminal record of one submitted job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: JobId,
    /// The URL or `uploaded_file: <name>`.
    pub original_source: String,
    pub state: JobState,
    pub attempts: u32,
    pub elapsed: Duration,
    /// Artifact URL on success.
    pub outcome: Result<String, ConvertError>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Runs conversion jobs. Cheap to share behind an `Arc`.
pub struct JobOrchestrator {
    config: Arc<Config>,
    formats: Arc<SupportedFormats>,
    workers: Arc<WorkerLifecycleManager>,
    store: Arc<dyn ArtifactStore>,
    bridge: TempFileBridge,
    downloader: Downloader,
}

impl JobOrchestrator {
    pub fn new(
        config: Arc<Config>,
        formats: Arc<SupportedFormats>,
        workers: Arc<WorkerLifecycleManager>,
        store: Arc<dyn ArtifactStore>,
        bridge: TempFileBridge,
    ) -> Result<Self, ConvertError> {
        let downloader = Downloader::new(&config.download)?;
        Ok(Self {
            config,
            formats,
            workers,
            store,
            bridge,
            downloader,
        })
    }

    pub fn formats(&self) -> &SupportedFormats {
        &self.formats
    }

    pub fn workers(&self) -> &WorkerLifecycleManager {
        &self.workers
    }

    /// Run one job to completion.
    ///
    /// Never returns early: every outcome, including validation failures, is
    /// reported through [`JobReport::outcome`]. If the returned future is
    /// dropped mid-flight, the staging directory, worker and bridge ticket
    /// are torn down by their owning handles.
    pub async fn submit(&self, source: Source) -> JobReport {
        let mut job = Job::new(source);
        let span = tracing::info_span!("job", job_id = %job.id);

        async move {
            let start = Instant::now();
            tracing::info!(source = %job.source.describe(), "Job received");

            self.run(&mut job).await;

            let elapsed = start.elapsed();
            let report = JobReport {
                job_id: job.id,
                original_source: job.source.describe(),
                state: job.state(),
                attempts: job.attempts(),
                elapsed,
                outcome: job.into_outcome().unwrap_or_else(|| {
                    Err(ConvertError::Conversion {
                        reason: "job ended without an outcome".to_string(),
                    })
                }),
            };
            match &report.outcome {
                Ok(url) => tracing::info!(converted_url = %url, elapsed = ?elapsed, "Job completed"),
                Err(e) => tracing::info!(error = %e, elapsed = ?elapsed, "Job failed"),
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn run(&self, job: &mut Job) {
        let file_name = match job.source.validate(&self.formats) {
            Ok(name) => name,
            Err(e) => {
                job.fail(e);
                return;
            }
        };

        let staging = match StagingDir::create(&self.config.server.staging_dir, job.id).await {
            Ok(dir) => dir,
            Err(e) => {
                job.fail(e);
                return;
            }
        };

        let outcome = self.execute(job, &staging, &file_name).await;
        match outcome {
            Ok(url) => job.complete(url),
            Err(e) => job.fail(e),
        }

        // Terminal state is set before cleanup; a cleanup failure never
        // changes the outcome.
        if let Err(e) = staging.remove().await {
            tracing::warn!(job_id = %job.id, "Failed to remove staging directory: {}", e);
        }
    }

    async fn execute(
        &self,
        job: &mut Job,
        staging: &StagingDir,
        file_name: &str,
    ) -> Result<String, ConvertError> {
        let input = self.stage(job, staging, file_name).await?;
        job.advance(JobState::Staged);

        let ticket = self
            .workers
            .backend()
            .needs_bridge()
            .then(|| self.bridge.register(job.id, staging.path()));

        let mut lease = self.workers.acquire(job.id).await?;
        job.advance(JobState::WorkerAcquired);

        let result = self
            .convert_and_upload(job, &mut lease, &input, staging, file_name, ticket.as_ref())
            .await;

        self.workers.release(lease).await;
        drop(ticket);
        result
    }

    async fn stage(
        &self,
        job: &Job,
        staging: &StagingDir,
        file_name: &str,
    ) -> Result<std::path::PathBuf, ConvertError> {
        match &job.source {
            Source::Url(source) => {
                let dest = staging.file_path(file_name);
                self.downloader.download(&source.url, &dest).await?;
                Ok(dest)
            }
            Source::Upload(upload) => staging.write(file_name, &upload.bytes).await,
        }
    }

    async fn convert_and_upload(
        &self,
        job: &mut Job,
        lease: &mut WorkerLease,
        input: &Path,
        staging: &StagingDir,
        file_name: &str,
        ticket: Option<&BridgeTicket>,
    ) -> Result<String, ConvertError> {
        job.advance(JobState::Converting);
        job.record_attempt();

        let input_url = ticket.map(|t| t.url_for(file_name));
        let output = lease
            .convert(ConversionRequest {
                input,
                out_dir: staging.path(),
                input_url: input_url.as_deref(),
            })
            .await?;

        job.advance(JobState::Uploading);
        match output {
            ConversionOutput::LocalPdf(pdf) => self.upload(&pdf).await,
            ConversionOutput::Uploaded { converted_url } => {
                tracing::debug!("Worker uploaded the artifact itself");
                Ok(converted_url)
            }
        }
    }

    async fn upload(&self, pdf: &Path) -> Result<String, ConvertError> {
        let now = Utc::now();
        let stem = pdf
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let key = object_key(&stem, now);
        let metadata = expiry_metadata(self.config.storage.pdf_expire_time, now);

        let start = Instant::now();
        let url = self
            .store
            .put(pdf, &key, PDF_CONTENT_TYPE, &metadata)
            .await?;
        tracing::info!(
            store = self.store.name(),
            key = %key,
            elapsed = ?start.elapsed(),
            "Uploaded artifact"
        );
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::path::PathBuf;
    use std::sync::Mutex;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use bytes::Bytes;
    use secrecy::SecretString;
    use serde_json::{Value, json};

    use super::*;
    use crate::config::{DownloadConfig, ServerConfig, StorageConfig};
    use crate::orchestrator::HttpServer;
    use crate::storage::MemoryStore;
    use crate::worker::WorkerConfig;
    use crate::worker::api::ConvertForm;
    use crate::worker::container::ContainerRuntime;
    use crate::worker::manager::testing::FakeRuntime;

    fn config(staging: &Path, engine: &str) -> Config {
        Config {
            server: ServerConfig {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                staging_dir: staging.to_path_buf(),
                ..Default::default()
            },
            worker: WorkerConfig {
                engine_path: PathBuf::from(engine),
                ..Default::default()
            },
            storage: StorageConfig {
                bucket: "pdfs".into(),
                access_key_id: "ak".into(),
                secret_access_key: SecretString::from("sk"),
                region: "us-east-1".into(),
                endpoint_url: "http://store".into(),
                download_url_prefix: None,
                pdf_expire_time: Duration::from_secs(60),
                request_timeout: Duration::from_secs(5),
            },
            download: DownloadConfig::default(),
        }
    }

    fn orchestrator(config: Config, store: Arc<dyn ArtifactStore>) -> JobOrchestrator {
        let workers = WorkerLifecycleManager::subprocess(config.worker.clone());
        JobOrchestrator::new(
            Arc::new(config),
            Arc::new(SupportedFormats::standard()),
            Arc::new(workers),
            store,
            TempFileBridge::new("http://bridge"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_already_pdf_fails_without_worker() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            config(root.path(), "/nonexistent/engine"),
            Arc::new(MemoryStore::new("https://store")),
        );

        let report = orch.submit(Source::url("http://x/already.pdf")).await;

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.attempts, 0);
        let err = report.outcome.unwrap_err();
        assert_eq!(err.to_string(), "file is already pdf");
        assert_eq!(orch.workers().leased_count(), 0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_failure_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let store = MemoryStore::new("https://store");
        let orch = orchestrator(config(root.path(), "false"), Arc::new(store.clone()));

        let report = orch
            .submit(Source::upload("report.docx", Bytes::from_static(b"doc")))
            .await;

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.attempts, 1);
        assert!(matches!(report.outcome, Err(ConvertError::Conversion { .. })));
        assert!(!root.path().join(report.job_id.to_string()).exists());
        assert_eq!(orch.workers().leased_count(), 0);
        assert!(store.is_empty());
    }

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    /// Worker stand-in: fetches its input through the bridge the way the
    /// container image does and answers with the body as the artifact name.
    struct MockWorker {
        bridge_addr: SocketAddr,
        seen_url: Mutex<Option<String>>,
    }

    async fn worker_convert(
        State(worker): State<Arc<MockWorker>>,
        Form(form): Form<ConvertForm>,
    ) -> (StatusCode, Json<Value>) {
        let url = form
            .file_url
            .unwrap_or_default()
            .replace("http://bridge.test", &format!("http://{}", worker.bridge_addr));
        *worker.seen_url.lock().unwrap() = Some(url.clone());

        let response = reqwest::get(&url).await.unwrap();
        if !response.status().is_success() {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": format!("bridge answered {}", response.status()) })),
            );
        }
        let body = response.text().await.unwrap();
        (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "converted_url": format!("https://store/pdfs/{}", body),
            })),
        )
    }

    fn container_orchestrator(
        config: Config,
        runtime: Arc<FakeRuntime>,
        bridge: TempFileBridge,
        store: Arc<dyn ArtifactStore>,
    ) -> JobOrchestrator {
        let workers = WorkerLifecycleManager::with_runtime(
            config.worker.clone(),
            HashMap::new(),
            runtime as Arc<dyn ContainerRuntime>,
        );
        JobOrchestrator::new(
            Arc::new(config),
            Arc::new(SupportedFormats::standard()),
            Arc::new(workers),
            store,
            bridge,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_container_job_reads_input_through_bridge() {
        let root = tempfile::tempdir().unwrap();
        let bridge = TempFileBridge::new("http://bridge.test");
        let mut bridge_server = HttpServer::new("Bridge", loopback(), bridge.router());
        let bridge_addr = bridge_server.start().await.unwrap();

        let worker = Arc::new(MockWorker {
            bridge_addr,
            seen_url: Mutex::new(None),
        });
        let app = Router::new()
            .route("/convert", post(worker_convert))
            .with_state(Arc::clone(&worker));
        let mut worker_server = HttpServer::new("Worker", loopback(), app);
        let worker_addr = worker_server.start().await.unwrap();

        let runtime = Arc::new(FakeRuntime::ready_at(format!("http://{}", worker_addr)));
        let store = MemoryStore::new("https://store");
        let orch = container_orchestrator(
            config(root.path(), "/nonexistent/engine"),
            Arc::clone(&runtime),
            bridge.clone(),
            Arc::new(store.clone()),
        );

        let report = orch
            .submit(Source::upload("report.docx", Bytes::from_static(b"hello")))
            .await;

        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.outcome.unwrap(), "https://store/pdfs/hello");
        // The worker uploaded the PDF itself.
        assert!(store.is_empty());

        assert_eq!(bridge.active_jobs(), 0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        assert_eq!(runtime.removed().len(), 1);
        assert_eq!(orch.workers().leased_count(), 0);

        // The URL handed to the worker stops working with the job.
        let seen = worker.seen_url.lock().unwrap().clone().unwrap();
        assert!(seen.contains(&report.job_id.to_string()));
        assert!(seen.contains("token="));
        let after = reqwest::get(&seen).await.unwrap();
        assert_eq!(after.status(), reqwest::StatusCode::NOT_FOUND);

        worker_server.shutdown().await;
        bridge_server.shutdown().await;
    }

    #[tokio::test]
    async fn test_container_never_ready_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config(root.path(), "/nonexistent/engine");
        config.worker.ready_timeout = Duration::from_millis(20);

        let runtime = Arc::new(FakeRuntime::never_ready());
        let bridge = TempFileBridge::new("http://bridge.test");
        let orch = container_orchestrator(
            config,
            Arc::clone(&runtime),
            bridge.clone(),
            Arc::new(MemoryStore::new("https://store")),
        );

        let report = orch
            .submit(Source::upload("report.docx", Bytes::from_static(b"hello")))
            .await;

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.attempts, 0);
        assert!(matches!(report.outcome, Err(ConvertError::Provision { .. })));
        assert_eq!(runtime.removed().len(), 1);
        assert_eq!(bridge.active_jobs(), 0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        assert_eq!(orch.workers().leased_count(), 0);
    }
}
