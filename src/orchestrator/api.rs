//! Public ingress API.
//!
//! ```text
//! GET  /health                    -> {"status": "ok"}
//! GET  /get_supported_file_types  -> {"supported_file_types": [".ext", ...]}
//! POST /convert                   -> {"status": "success", "original_source", "converted_url"}
//! ```
//!
//! `/convert` takes either a urlencoded form or a multipart body with a
//! `file_url` field or a `file` upload. Every failure is `{"error": "..."}`
//! with the status from [`ConvertError::status_code`].
//!
//! The file bridge is served on its own listener and is not reachable here.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use bytes::Bytes;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ConvertError;
use crate::job::Source;
use crate::orchestrator::runner::JobOrchestrator;
use crate::worker::api::{
    ConvertForm, ConvertResponse, ErrorResponse, HealthResponse, SupportedTypesResponse,
};

/// Shared state for the ingress handlers.
#[derive(Clone)]
pub struct IngressState {
    pub orchestrator: Arc<JobOrchestrator>,
}

/// The public HTTP surface.
pub struct IngressApi;

impl IngressApi {
    pub fn router(orchestrator: Arc<JobOrchestrator>, max_upload_bytes: usize) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/get_supported_file_types", get(supported_file_types))
            .route("/convert", post(convert))
            .layer(DefaultBodyLimit::max(max_upload_bytes))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::very_permissive())
            .with_state(IngressState { orchestrator })
    }
}

/// An error rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ConvertError> for ApiError {
    fn from(e: ConvertError) -> Self {
        Self {
            status: e.status_code(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

// -- Handlers --

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn supported_file_types(State(state): State<IngressState>) -> Json<SupportedTypesResponse> {
    Json(SupportedTypesResponse {
        supported_file_types: state
            .orchestrator
            .formats()
            .extensions()
            .iter()
            .map(|e| e.to_string())
            .collect(),
    })
}

async fn convert(
    State(state): State<IngressState>,
    request: Request,
) -> Result<Json<ConvertResponse>, ApiError> {
    let source = read_source(request).await?;
    let report = state.orchestrator.submit(source).await;

    let converted_url = report.outcome?;
    Ok(Json(ConvertResponse {
        status: "success".to_string(),
        original_source: Some(report.original_source),
        converted_url,
    }))
}

/// Pull `file_url` / `file` out of a form or multipart body.
async fn read_source(request: Request) -> Result<Source, ApiError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let mut file_url = None;
    let mut upload: Option<(String, Bytes)> = None;

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            match field.name() {
                Some("file_url") => file_url = Some(field.text().await.map_err(multipart_error)?),
                Some("file") => {
                    let name = field.file_name().unwrap_or_default().to_string();
                    let bytes = field.bytes().await.map_err(multipart_error)?;
                    upload = Some((name, bytes));
                }
                _ => {}
            }
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(form) = Form::<ConvertForm>::from_request(request, &())
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        file_url = form.file_url;
    }

    let file_url = file_url.filter(|u| !u.trim().is_empty());
    match (file_url, upload) {
        (Some(url), upload) => {
            if upload.is_some() {
                tracing::info!("Both file_url and file given, using file_url");
            }
            Ok(Source::url(&url))
        }
        (None, Some((name, bytes))) => Ok(Source::upload(name, bytes)),
        (None, None) => Err(ApiError::bad_request(
            "Either file_url or file upload is required",
        )),
    }
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError {
        status: e.status(),
        message: e.body_text(),
    }
}
