//! Conversion engine invoked as a child process.
//!
//! There is no long-lived worker: each job spawns the engine once with a
//! fixed argument shape and waits for it to exit.
//!
//! ```text
//! <engine> --headless --convert-to pdf <input> --outdir <dir>
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::worker::error::{Result, WorkerError};

/// Maximum stderr kept in an [`WorkerError::EngineFailed`].
const MAX_STDERR_BYTES: usize = 8 * 1024;

/// Runs the conversion engine against a staged file.
#[derive(Debug, Clone)]
pub struct EngineRunner {
    engine: PathBuf,
    timeout: Duration,
}

impl EngineRunner {
    pub fn new(engine: PathBuf, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Convert `input` into `<out_dir>/<stem>.pdf` and return that path.
    pub async fn convert(&self, input: &Path, out_dir: &Path) -> Result<PathBuf> {
        let input = std::path::absolute(input)?;
        let out_dir = std::path::absolute(out_dir)?;
        let start = Instant::now();

        tracing::info!(
            input = %input.display(),
            out_dir = %out_dir.display(),
            "Running conversion engine"
        );

        let mut cmd = Command::new(&self.engine);
        cmd.arg("--headless")
            .arg("--convert-to")
            .arg("pdf")
            .arg(&input)
            .arg("--outdir")
            .arg(&out_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A dropped job future must not leave the engine running.
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| WorkerError::Timeout {
                operation: "conversion engine",
                elapsed: self.timeout,
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = truncate(&String::from_utf8_lossy(&output.stderr), MAX_STDERR_BYTES);
            tracing::error!(
                exit_code = ?output.status.code(),
                stdout = %stdout,
                stderr = %stderr,
                "Conversion engine failed"
            );
            return Err(WorkerError::EngineFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let pdf = pdf_path_for(&input, &out_dir);
        if !tokio::fs::try_exists(&pdf).await.unwrap_or(false) {
            tracing::error!(expected = %pdf.display(), stdout = %stdout, "Engine produced no PDF");
            return Err(WorkerError::OutputMissing { path: pdf });
        }

        tracing::debug!(elapsed = ?start.elapsed(), "Conversion engine finished");
        Ok(pdf)
    }
}

/// `<out_dir>/<input stem>.pdf`
pub fn pdf_path_for(input: &Path, out_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "output".into());
    let mut name = stem;
    name.push(".pdf");
    out_dir.join(name)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.trim_end().to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
