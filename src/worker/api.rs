//! Wire types shared by the ingress API and container workers.
//!
//! A container worker runs this same service in subprocess mode, so the
//! orchestrator speaks the public `/convert` contract to it.

use serde::{Deserialize, Serialize};

/// Form body for `POST /convert` when the source is a URL.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConvertForm {
    pub file_url: Option<String>,
}

/// Successful `POST /convert` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConvertResponse {
    pub status: String,
    #[serde(default)]
    pub original_source: Option<String>,
    pub converted_url: String,
}

/// Error body returned with any 4xx/5xx.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SupportedTypesResponse {
    pub supported_file_types: Vec<String>,
}
