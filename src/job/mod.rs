//! Conversion jobs.
//!
//! A [`Job`] is created at intake and driven through its state machine by the
//! orchestrator only:
//!
//! ```text
//! Received ─▶ Staged ─▶ WorkerAcquired ─▶ Converting ─▶ Uploading ─▶ Completed
//!     │          │             │               │             │
//!     └──────────┴─────────────┴───────────────┴─────────────┴──────▶ Failed
//! ```
//!
//! A terminal job holds exactly one of an artifact URL or an error.

pub mod staging;

use std::fmt;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConvertError;
use crate::formats::{SupportedFormats, is_pdf, normalize_extension};

pub use staging::{Downloader, StagingDir, purge_staging_root};

/// Unique job identifier. Also the isolation namespace for the staging
/// directory, worker name and bridge path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Where the input document comes from, resolved once at intake.
#[derive(Debug, Clone)]
pub enum Source {
    Url(UrlSource),
    Upload(UploadSource),
}

#[derive(Debug, Clone)]
pub struct UrlSource {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct UploadSource {
    pub filename: String,
    pub bytes: Bytes,
}

/// Characters clients tend to leave around pasted URLs.
const URL_TRIM: &[char] = &['"', '\'', '\\', '[', ']'];

impl Source {
    /// A remote document. Stray quotes and brackets around the URL are
    /// stripped.
    pub fn url(raw: &str) -> Self {
        Source::Url(UrlSource {
            url: raw.trim().trim_matches(URL_TRIM).to_string(),
        })
    }

    /// An uploaded document.
    pub fn upload(filename: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Source::Upload(UploadSource {
            filename: filename.into(),
            bytes: bytes.into(),
        })
    }

    /// Human-readable origin, echoed back to clients.
    pub fn describe(&self) -> String {
        match self {
            Source::Url(u) => u.url.clone(),
            Source::Upload(u) => format!("uploaded_file: {}", u.filename),
        }
    }

    /// File name to stage the input under: a single path component.
    pub fn file_name(&self) -> Result<String, ConvertError> {
        match self {
            Source::Url(u) => {
                let parsed = reqwest::Url::parse(&u.url)
                    .map_err(|e| ConvertError::validation(format!("invalid file_url: {}", e)))?;
                let last = parsed
                    .path_segments()
                    .and_then(|mut segments| segments.next_back())
                    .unwrap_or_default();
                let decoded = urlencoding::decode(last)
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| last.to_string());
                sanitize_file_name(&decoded).ok_or_else(|| {
                    ConvertError::validation(format!("file_url has no file name: {}", u.url))
                })
            }
            Source::Upload(u) => sanitize_file_name(&u.filename)
                .ok_or_else(|| ConvertError::validation("Uploaded file must have a filename")),
        }
    }

    /// Check the source against the allow-list and return the staged file
    /// name. No worker is ever provisioned for a source that fails here.
    pub fn validate(&self, formats: &SupportedFormats) -> Result<String, ConvertError> {
        let name = self.file_name()?;
        let ext = Path::new(&name)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();

        if is_pdf(&ext) {
            return Err(ConvertError::validation("file is already pdf"));
        }
        if ext.is_empty() || !formats.is_supported(&normalize_extension(&ext)) {
            return Err(ConvertError::validation(format!(
                "file type not supported, given file type is: {}",
                ext
            )));
        }
        Ok(name)
    }
}

/// Reduce a client-supplied name to its final path component.
fn sanitize_file_name(raw: &str) -> Option<String> {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    match last {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Received,
    Staged,
    WorkerAcquired,
    Converting,
    Uploading,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Forward-only transitions; any live state may fail.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Received, Staged)
            | (Staged, WorkerAcquired)
            | (WorkerAcquired, Converting)
            | (Converting, Uploading)
            | (Uploading, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Received => "received",
            JobState::Staged => "staged",
            JobState::WorkerAcquired => "worker_acquired",
            JobState::Converting => "converting",
            JobState::Uploading => "uploading",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One conversion request and its progress.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub source: Source,
    state: JobState,
    attempts: u32,
    outcome: Option<Result<String, ConvertError>>,
}

impl Job {
    pub fn new(source: Source) -> Self {
        Self {
            id: JobId::new(),
            source,
            state: JobState::Received,
            attempts: 0,
            outcome: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Move to the next non-terminal state.
    pub fn advance(&mut self, next: JobState) {
        debug_assert!(
            !next.is_terminal(),
            "terminal states are set by complete/fail"
        );
        self.transition(next);
    }

    /// Count one conversion attempt against this job.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn complete(&mut self, artifact_url: String) {
        self.transition(JobState::Completed);
        self.outcome = Some(Ok(artifact_url));
    }

    pub fn fail(&mut self, error: ConvertError) {
        tracing::warn!(
            job_id = %self.id,
            state = %self.state,
            kind = error.kind(),
            retryable = error.is_retryable(),
            "Job failed: {}",
            error
        );
        self.transition(JobState::Failed);
        self.outcome = Some(Err(error));
    }

    pub fn artifact_url(&self) -> Option<&str> {
        match &self.outcome {
            Some(Ok(url)) => Some(url),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ConvertError> {
        match &self.outcome {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    /// The terminal outcome, or `None` while the job is still running.
    pub fn into_outcome(self) -> Option<Result<String, ConvertError>> {
        self.outcome
    }

    fn transition(&mut self, next: JobState) {
        if !self.state.can_transition_to(next) {
            tracing::error!(job_id = %self.id, from = %self.state, to = %next, "Illegal job transition");
            debug_assert!(false, "illegal job transition {} -> {}", self.state, next);
            return;
        }
        tracing::debug!(job_id = %self.id, from = %self.state, to = %next, "Job state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_is_trimmed_and_named() {
        let source = Source::url("\"http://x/docs/report%20v2.docx\"");
        assert_eq!(source.describe(), "http://x/docs/report%20v2.docx");
        assert_eq!(source.file_name().unwrap(), "report v2.docx");
    }

    #[test]
    fn test_upload_name_is_reduced_to_last_component() {
        let source = Source::upload("../../etc/passwd.docx", Bytes::from_static(b"x"));
        assert_eq!(source.file_name().unwrap(), "passwd.docx");

        let source = Source::upload("C:\\Users\\me\\a.xlsx", Bytes::from_static(b"x"));
        assert_eq!(source.file_name().unwrap(), "a.xlsx");

        let source = Source::upload("", Bytes::new());
        let err = source.file_name().unwrap_err();
        assert_eq!(err.to_string(), "Uploaded file must have a filename");
    }

    #[test]
    fn test_validate_rejects_pdf_and_unknown_types() {
        let formats = SupportedFormats::standard();

        let err = Source::url("http://x/already.PDF")
            .validate(&formats)
            .unwrap_err();
        assert_eq!(err.to_string(), "file is already pdf");

        let err = Source::url("http://x/weird.xyz")
            .validate(&formats)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "file type not supported, given file type is: xyz"
        );

        let err = Source::upload("noext", Bytes::new())
            .validate(&formats)
            .unwrap_err();
        assert!(err.to_string().starts_with("file type not supported"));

        assert_eq!(
            Source::url("http://x/report.docx")
                .validate(&formats)
                .unwrap(),
            "report.docx"
        );
    }

    #[test]
    fn test_state_machine_is_forward_only() {
        use JobState::*;
        assert!(Received.can_transition_to(Staged));
        assert!(Uploading.can_transition_to(Completed));
        assert!(Converting.can_transition_to(Failed));
        assert!(!Received.can_transition_to(Completed));
        assert!(!Staged.can_transition_to(Received));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_terminal_job_holds_exactly_one_outcome() {
        let mut ok = Job::new(Source::url("http://x/a.docx"));
        for s in [
            JobState::Staged,
            JobState::WorkerAcquired,
            JobState::Converting,
            JobState::Uploading,
        ] {
            ok.advance(s);
        }
        ok.complete("https://store/a.pdf".into());
        assert_eq!(ok.artifact_url(), Some("https://store/a.pdf"));
        assert!(ok.error().is_none());

        let mut failed = Job::new(Source::url("http://x/a.docx"));
        failed.advance(JobState::Staged);
        failed.fail(ConvertError::Conversion {
            reason: "exit 1".into(),
        });
        assert_eq!(failed.state(), JobState::Failed);
        assert!(failed.artifact_url().is_none());
        assert!(failed.error().is_some());
    }
}
