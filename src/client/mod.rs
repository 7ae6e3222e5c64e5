//! Batch client for a conversion server.
//!
//! Submits many files concurrently with a fixed concurrency limit, retries
//! each failed conversion with exponential backoff, reports progress, and
//! writes a JSON report for the run.
//!
//! ```text
//! find_files ─▶ convert_all ─┬─ [semaphore: max_workers] ─▶ convert_file ─▶ retry loop ─▶ POST /convert
//!                            └─ results, in input order ─▶ save_report
//! ```

pub mod progress;
pub mod report;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Local;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use tokio::sync::Semaphore;

use crate::formats::{is_pdf, normalize_extension};
use crate::worker::api::{ConvertResponse, ErrorResponse, HealthResponse, SupportedTypesResponse};

pub use progress::{NoopProgress, ProgressSink, ProgressSnapshot};
pub use report::{ConversionResult, ResultStatus, save_report};

use progress::{Completion, ProgressAggregator};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("server is unhealthy: {0}")]
    Unhealthy(String),

    #[error("{message}")]
    Http { status: u16, message: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
}

impl ClientError {
    /// Client errors (4xx) are deterministic, except timeouts and throttling.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http { status, .. } => {
                let status = *status;
                !(400..500).contains(&status) || status == 408 || status == 429
            }
            ClientError::NotADirectory(_) => false,
            _ => true,
        }
    }
}

/// Connection and retry settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Timeout for a single HTTP request.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay; attempt `k` waits `retry_delay * 2^k`.
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 7758,
            timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Delay before retry `attempt` (0-based): `base * 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Client for one conversion server.
pub struct ConvertClient {
    config: ClientConfig,
    base_url: String,
    http: reqwest::Client,
    supported_types: RwLock<Vec<String>>,
    progress: Arc<dyn ProgressSink>,
}

impl ConvertClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            base_url: format!("http://{}:{}", config.host, config.port),
            config,
            http,
            supported_types: RwLock::new(Vec::new()),
            progress: Arc::new(NoopProgress),
        })
    }

    /// Report batch progress to `sink`.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Health-check the server and load its supported types.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.health().await?;
        let types = self.fetch_supported_types().await?;
        tracing::info!(
            server = %self.base_url,
            types = types.len(),
            "Connected to conversion server"
        );
        *self.supported_types.write().unwrap_or_else(|p| p.into_inner()) = types;
        Ok(())
    }

    /// `GET /health` must answer `{"status": "ok"}`.
    pub async fn health(&self) -> Result<(), ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ClientError::Unhealthy(format!(
                "health check returned HTTP {}",
                response.status().as_u16()
            )));
        }
        let body: HealthResponse = response.json().await?;
        if body.status != "ok" {
            return Err(ClientError::Unhealthy(format!("status is {}", body.status)));
        }
        Ok(())
    }

    /// `GET /get_supported_file_types`
    pub async fn fetch_supported_types(&self) -> Result<Vec<String>, ClientError> {
        let response = self
            .http
            .get(format!("{}/get_supported_file_types", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(http_error(response).await);
        }
        let body: SupportedTypesResponse = response.json().await?;
        Ok(body.supported_file_types)
    }

    /// Types loaded by the last `connect()`.
    pub fn supported_types(&self) -> Vec<String> {
        self.supported_types
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Whether the server accepts `path`'s extension. False before `connect()`
    /// and always false for PDFs, which the server rejects as already
    /// converted.
    pub fn is_supported(&self, path: &Path) -> bool {
        let Some(ext) = path.extension() else {
            return false;
        };
        let ext = normalize_extension(&ext.to_string_lossy());
        if is_pdf(&ext) {
            return false;
        }
        self.supported_types
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|t| *t == ext)
    }

    /// Convert one local file, retrying failures.
    ///
    /// A missing file or unsupported extension fails at once without
    /// contacting the server.
    pub async fn convert_file(&self, path: &Path) -> ConversionResult {
        let start = Instant::now();
        let original = path.display().to_string();

        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return ConversionResult::error(original, "file not found".to_string(), elapsed(start));
        }
        if path.extension().is_some_and(|e| is_pdf(&e.to_string_lossy())) {
            return ConversionResult::error(
                original,
                "file is already pdf".to_string(),
                elapsed(start),
            );
        }
        if !self.is_supported(path) {
            let ext = path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            return ConversionResult::error(
                original,
                format!("unsupported file type: {}", ext),
                elapsed(start),
            );
        }

        self.with_retry(original, start, || self.submit_file(path))
            .await
    }

    /// Ask the server to fetch and convert `url`, retrying failures.
    pub async fn convert_url(&self, url: &str) -> ConversionResult {
        let start = Instant::now();
        self.with_retry(url.to_string(), start, || self.submit_url(url))
            .await
    }

    /// Convert `paths` with at most `max_concurrency` in flight.
    ///
    /// Results are returned in the order of `paths`.
    pub async fn convert_all(
        &self,
        paths: &[PathBuf],
        max_concurrency: usize,
    ) -> Result<Vec<ConversionResult>, ClientError> {
        if self.supported_types().is_empty() {
            self.connect().await?;
        }

        let semaphore = Semaphore::new(max_concurrency.max(1));
        let aggregator = ProgressAggregator::start(paths.len(), Arc::clone(&self.progress));

        let jobs = paths.iter().map(|path| {
            let semaphore = &semaphore;
            let tx = aggregator.sender();
            async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => self.convert_file(path).await,
                    Err(e) => ConversionResult::error(path.display().to_string(), e.to_string(), 0.0),
                };
                let _ = tx.send(Completion {
                    file: file_label(path),
                    success: result.is_success(),
                });
                result
            }
        });
        let results = futures::future::join_all(jobs).await;

        aggregator.finish().await;
        Ok(results)
    }

    /// Supported files under `dir`, sorted.
    pub fn find_files(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>, ClientError> {
        if !dir.is_dir() {
            return Err(ClientError::NotADirectory(dir.to_path_buf()));
        }

        let mut walker = walkdir::WalkDir::new(dir).min_depth(1);
        if !recursive {
            walker = walker.max_depth(1);
        }

        let mut files: Vec<PathBuf> = walker
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| self.is_supported(path))
            .collect();
        files.sort();

        tracing::info!(dir = %dir.display(), count = files.len(), "Found convertible files");
        Ok(files)
    }

    /// Find, convert and report on every supported file under `dir`.
    ///
    /// The report goes to `output_dir`, or the parent of `dir` if unset.
    pub async fn convert_directory(
        &self,
        dir: &Path,
        output_dir: Option<&Path>,
        max_workers: usize,
        recursive: bool,
        save_results: bool,
    ) -> Result<Vec<ConversionResult>, ClientError> {
        if self.supported_types().is_empty() {
            self.connect().await?;
        }

        let files = self.find_files(dir, recursive)?;
        if files.is_empty() {
            tracing::warn!(dir = %dir.display(), "No convertible files found");
            return Ok(Vec::new());
        }

        let started = Local::now();
        let start = Instant::now();
        let results = self.convert_all(&files, max_workers).await?;
        let total = start.elapsed();
        let per_file = total / results.len() as u32;

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        tracing::info!(
            total = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            elapsed = ?total,
            per_file = ?per_file,
            "Batch finished"
        );

        if save_results {
            let report_dir = match output_dir {
                Some(dir) => dir.to_path_buf(),
                None => dir
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
            };
            save_report(&results, &report_dir, started).await?;
        }

        Ok(results)
    }

    async fn with_retry<F, Fut>(&self, original: String, start: Instant, attempt_fn: F) -> ConversionResult
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<String, ClientError>>,
    {
        let mut attempt = 0u32;
        loop {
            match attempt_fn().await {
                Ok(url) => return ConversionResult::success(original, url, elapsed(start)),
                Err(e) if attempt < self.config.max_retries && e.is_retryable() => {
                    let wait = backoff_delay(self.config.retry_delay, attempt);
                    tracing::warn!(
                        file = %original,
                        attempt = attempt + 1,
                        of = self.config.max_retries + 1,
                        "Conversion failed: {}; retrying in {:?}",
                        e,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    let message = format!("conversion failed after {} attempts: {}", attempt + 1, e);
                    tracing::error!(file = %original, "{}", message);
                    return ConversionResult::error(original, message, elapsed(start));
                }
            }
        }
    }

    async fn submit_file(&self, path: &Path) -> Result<String, ClientError> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let form = Form::new().part("file", Part::bytes(bytes).file_name(name));
        let response = self
            .http
            .post(format!("{}/convert", self.base_url))
            .multipart(form)
            .send()
            .await?;
        converted_url(response).await
    }

    async fn submit_url(&self, url: &str) -> Result<String, ClientError> {
        let response = self
            .http
            .post(format!("{}/convert", self.base_url))
            .form(&[("file_url", url)])
            .send()
            .await?;
        converted_url(response).await
    }
}

async fn converted_url(response: reqwest::Response) -> Result<String, ClientError> {
    if response.status() != StatusCode::OK {
        return Err(http_error(response).await);
    }
    let body: ConvertResponse = response.json().await?;
    if body.status != "success" {
        return Err(ClientError::Http {
            status: 200,
            message: format!("unexpected status {}", body.status),
        });
    }
    Ok(body.converted_url)
}

/// Prefer the server's `{"error": ...}` message over the raw body.
async fn http_error(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(body) => body.error,
        Err(_) => format!("HTTP {}: {}", status, text),
    };
    ClientError::Http { status, message }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn elapsed(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}
