//! Internal file bridge.
//!
//! Container workers cannot see the host filesystem, so the orchestrator
//! hands them a URL back to itself instead:
//!
//! ```text
//! GET /temp/{job_id}/{filename}?token=<per-job token>
//! ```
//!
//! Only files directly inside the job's own staging directory are served,
//! and only while the job holds a [`BridgeTicket`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::job::JobId;
use crate::orchestrator::auth::{TokenStore, bridge_auth_middleware};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("job {0} is not registered with the bridge")]
    UnknownJob(JobId),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("file not found: {0}")]
    NotFound(String),
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        tracing::debug!("Bridge request rejected: {}", self);
        StatusCode::NOT_FOUND.into_response()
    }
}

type DirMap = Arc<RwLock<HashMap<JobId, PathBuf>>>;

/// Serves staged files to workers.
#[derive(Clone)]
pub struct TempFileBridge {
    base_url: String,
    tokens: TokenStore,
    dirs: DirMap,
}

impl TempFileBridge {
    /// `base_url` is how workers reach the bridge, e.g. `http://172.17.0.1:7759`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens: TokenStore::new(),
            dirs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Expose `staging_dir` for `job_id` until the returned ticket is dropped.
    pub fn register(&self, job_id: JobId, staging_dir: &Path) -> BridgeTicket {
        let token = self.tokens.create_token(job_id);
        self.dirs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(job_id, staging_dir.to_path_buf());
        tracing::debug!(job_id = %job_id, "Registered staging directory with bridge");

        BridgeTicket {
            job_id,
            token,
            base_url: self.base_url.clone(),
            tokens: self.tokens.clone(),
            dirs: Arc::clone(&self.dirs),
        }
    }

    /// Number of jobs currently exposed.
    pub fn active_jobs(&self) -> usize {
        self.tokens.active_count()
    }

    /// Map `{job_id}/{filename}` onto a file inside the job's staging
    /// directory.
    pub async fn resolve(&self, job_id: JobId, filename: &str) -> Result<PathBuf, BridgeError> {
        if filename.is_empty()
            || filename == "."
            || filename == ".."
            || filename.contains(['/', '\\', '\0'])
        {
            return Err(BridgeError::InvalidName(filename.to_string()));
        }

        let dir = self
            .dirs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&job_id)
            .cloned()
            .ok_or(BridgeError::UnknownJob(job_id))?;

        let not_found = || BridgeError::NotFound(filename.to_string());
        let root = tokio::fs::canonicalize(&dir).await.map_err(|_| not_found())?;
        let path = tokio::fs::canonicalize(dir.join(filename))
            .await
            .map_err(|_| not_found())?;

        // Symlinks may point anywhere; the resolved file must stay a direct
        // child of the staging directory.
        if path.parent() != Some(root.as_path()) {
            return Err(not_found());
        }
        let metadata = tokio::fs::metadata(&path).await.map_err(|_| not_found())?;
        if !metadata.is_file() {
            return Err(not_found());
        }
        Ok(path)
    }

    /// Router for the bridge listener. Never merge this into the ingress.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/temp/{job_id}/{filename}", get(serve_file))
            .route_layer(axum::middleware::from_fn_with_state(
                self.tokens.clone(),
                bridge_auth_middleware,
            ))
            .with_state(self.clone())
    }
}

/// A job's registration with the bridge. Dropping it revokes access.
pub struct BridgeTicket {
    job_id: JobId,
    token: String,
    base_url: String,
    tokens: TokenStore,
    dirs: DirMap,
}

impl BridgeTicket {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// URL a worker fetches `filename` from.
    pub fn url_for(&self, filename: &str) -> String {
        format!(
            "{}/temp/{}/{}?token={}",
            self.base_url,
            self.job_id,
            urlencoding::encode(filename),
            self.token
        )
    }
}

impl std::fmt::Debug for BridgeTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeTicket")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl Drop for BridgeTicket {
    fn drop(&mut self) {
        self.tokens.revoke(self.job_id);
        self.dirs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.job_id);
        tracing::debug!(job_id = %self.job_id, "Revoked bridge access");
    }
}

/// Behind `bridge_auth_middleware`, so the token is already checked.
async fn serve_file(
    State(bridge): State<TempFileBridge>,
    UrlPath((job_id, filename)): UrlPath<(Uuid, String)>,
) -> Result<Response, BridgeError> {
    let job_id = JobId::from(job_id);
    let path = bridge.resolve(job_id, &filename).await?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| BridgeError::NotFound(filename.clone()))?;
    let len = file
        .metadata()
        .await
        .map(|m| m.len())
        .map_err(|_| BridgeError::NotFound(filename.clone()))?;

    tracing::info!(job_id = %job_id, file = %filename, bytes = len, "Serving staged file to worker");

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
