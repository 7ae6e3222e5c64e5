//! Job-scoped staging directories and input download.
//!
//! Each job stages its input under `<root>/<job_id>/`. The directory is owned
//! by a [`StagingDir`] handle: `remove()` deletes it once, and dropping the
//! handle without calling `remove()` deletes it synchronously.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::config::DownloadConfig;
use crate::error::ConvertError;
use crate::job::JobId;

/// Owning handle on `<root>/<job_id>/`.
#[derive(Debug)]
pub struct StagingDir {
    job_id: JobId,
    path: PathBuf,
    removed: bool,
}

impl StagingDir {
    /// Create the job's directory. Fails if it already exists.
    pub async fn create(root: &Path, job_id: JobId) -> Result<Self, ConvertError> {
        tokio::fs::create_dir_all(root).await?;
        let path = root.join(job_id.to_string());
        tokio::fs::create_dir(&path).await?;
        tracing::debug!(job_id = %job_id, path = %path.display(), "Created staging directory");
        Ok(Self {
            job_id,
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of `name` inside this directory.
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Persist uploaded bytes as `name`.
    pub async fn write(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, ConvertError> {
        let dest = self.file_path(name);
        tokio::fs::write(&dest, bytes).await?;
        tracing::debug!(job_id = %self.job_id, path = %dest.display(), size = bytes.len(), "Staged upload");
        Ok(dest)
    }

    /// Delete the directory and everything in it.
    pub async fn remove(mut self) -> io::Result<()> {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                tracing::debug!(job_id = %self.job_id, "Removed staging directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(
                job_id = %self.job_id,
                path = %self.path.display(),
                "Failed to remove abandoned staging directory: {}",
                e
            );
        }
    }
}

/// Remove everything under the staging root left by a previous process.
///
/// Returns the number of entries removed. A missing root is not an error.
pub async fn purge_staging_root(root: &Path) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), "Could not purge stale staging entry: {}", e),
        }
    }
    Ok(removed)
}

/// HTTP client for `file_url` sources.
#[derive(Debug, Clone)]
pub struct Downloader {
    http: reqwest::Client,
    timeout: Duration,
}

impl Downloader {
    pub fn new(config: &DownloadConfig) -> Result<Self, ConvertError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.ssl_verify)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConvertError::Download {
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            http,
            timeout: config.timeout,
        })
    }

    /// Stream `url` into `dest`. Returns the number of bytes written.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64, ConvertError> {
        let start = Instant::now();
        tracing::info!(url = %url, "Downloading source file");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConvertError::Download {
                reason: format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                )
                .trim_end()
                .to_string(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.request_error(e))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        tracing::info!(
            url = %url,
            bytes = written,
            elapsed = ?start.elapsed(),
            "Downloaded source file"
        );
        Ok(written)
    }

    fn request_error(&self, e: reqwest::Error) -> ConvertError {
        if e.is_timeout() {
            ConvertError::Timeout {
                operation: "download",
                elapsed: self.timeout,
            }
        } else {
            ConvertError::Download {
                reason: e.to_string(),
            }
        }
    }
}
