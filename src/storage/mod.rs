//! Artifact storage.
//!
//! The orchestrator only sees the [`ArtifactStore`] trait: upload a local file
//! under a key and get back the URL clients download it from. Uploads are
//! never retried here.

pub mod memory;
pub mod s3;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use s3::S3Store;

/// Prefix every converted object is stored under.
pub const KEY_PREFIX: &str = "convert_file2pdf_server";

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// User metadata attached to an object. Sorted so signing is stable.
pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage request failed: {reason}")]
    Request { reason: String },

    #[error("storage returned HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("bucket {bucket} unavailable: {reason}")]
    Bucket { bucket: String, reason: String },

    #[error("storage request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Object storage capability used to publish converted PDFs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload `local_path` as `key` and return its public URL.
    async fn put(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<String>;

    /// Connectivity check run once at startup.
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// `convert_file2pdf_server/<unix-ts>_<stem>.pdf`
///
/// The timestamp carries microseconds so uploads of the same name in the
/// same second do not collide.
pub fn object_key(stem: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}/{}.{:06}_{}.pdf",
        KEY_PREFIX,
        now.timestamp(),
        now.timestamp_subsec_micros(),
        stem
    )
}

/// Expiry metadata for a PDF kept for `ttl`. Empty when `ttl` is zero.
pub fn expiry_metadata(ttl: Duration, now: DateTime<Utc>) -> Metadata {
    let mut metadata = Metadata::new();
    if ttl.is_zero() {
        return metadata;
    }
    let uploaded_at = now.timestamp();
    metadata.insert(
        "expire_time".to_string(),
        (uploaded_at + ttl.as_secs() as i64).to_string(),
    );
    metadata.insert("uploaded_at".to_string(), uploaded_at.to_string());
    metadata
}

/// Percent-encode each segment of an object key, keeping the slashes.
pub fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
