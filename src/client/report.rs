//! Per-run JSON report.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Outcome of one file in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

/// One record in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub original_file: String,
    pub status: ResultStatus,
    pub converted_url: Option<String>,
    pub error: Option<String>,
    /// Seconds, including retries and backoff waits.
    pub elapsed_time: f64,
}

impl ConversionResult {
    pub fn success(original_file: String, converted_url: String, elapsed_time: f64) -> Self {
        Self {
            original_file,
            status: ResultStatus::Success,
            converted_url: Some(converted_url),
            error: None,
            elapsed_time,
        }
    }

    pub fn error(original_file: String, error: String, elapsed_time: f64) -> Self {
        Self {
            original_file,
            status: ResultStatus::Error,
            converted_url: None,
            error: Some(error),
            elapsed_time,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// `convert_results_<YYYYmmdd_HHMMSS>.json`, keyed by the run's start time.
pub fn report_file_name(started: DateTime<Local>) -> String {
    format!("convert_results_{}.json", started.format("%Y%m%d_%H%M%S"))
}

/// Write `results` as pretty JSON into `dir`. Returns the file path.
pub async fn save_report(
    results: &[ConversionResult],
    dir: &Path,
    started: DateTime<Local>,
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(report_file_name(started));
    let json = serde_json::to_string_pretty(results).map_err(std::io::Error::other)?;
    tokio::fs::write(&path, json).await?;
    tracing::info!(path = %path.display(), "Saved conversion report");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_report_file_name() {
        let started = Local.with_ymd_and_hms(2025, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(report_file_name(started), "convert_results_20250309_140507.json");
    }

    #[tokio::test]
    async fn test_save_report_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let results = vec![
            ConversionResult::success("a.docx".into(), "https://store/a.pdf".into(), 1.5),
            ConversionResult::error("b.xyz".into(), "unsupported file type: .xyz".into(), 0.0),
        ];
        let started = Local.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();

        let path = save_report(&results, dir.path(), started).await.unwrap();
        assert!(path.ends_with("convert_results_20250102_030405.json"));

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value[0]["status"], "success");
        assert_eq!(value[1]["converted_url"], serde_json::Value::Null);
        assert_eq!(value[1]["error"], "unsupported file type: .xyz");

        let parsed: Vec<ConversionResult> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, results);
    }
}
