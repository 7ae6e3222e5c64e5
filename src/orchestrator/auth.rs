//! Access tokens for `/temp/{job_id}/{file}`.
//!
//! A worker container gets one URL with `?token=` appended. The token is 32
//! random bytes in hex, lives only in this process, and opens exactly one
//! job's staging directory. It is revoked as soon as the job leaves the
//! bridge, so a leaked URL stops working when the job finishes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use rand::Rng;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::job::JobId;

/// In-memory store for per-job bridge tokens.
///
/// Uses a blocking lock so tokens can be revoked from `Drop`.
#[derive(Clone, Default)]
pub struct TokenStore {
    /// Maps job id -> token. Never logged.
    tokens: Arc<RwLock<HashMap<JobId, String>>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and store a new token for a job, replacing any previous one.
    pub fn create_token(&self, job_id: JobId) -> String {
        let token = generate_token();
        self.tokens
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(job_id, token.clone());
        token
    }

    /// Whether the job currently has a token.
    pub fn contains(&self, job_id: JobId) -> bool {
        self.tokens
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&job_id)
    }

    /// Constant-time token check.
    pub fn validate(&self, job_id: JobId, token: &str) -> bool {
        self.tokens
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&job_id)
            .map(|stored| stored.as_bytes().ct_eq(token.as_bytes()).into())
            .unwrap_or(false)
    }

    pub fn revoke(&self, job_id: JobId) {
        self.tokens
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&job_id);
    }

    pub fn active_count(&self) -> usize {
        self.tokens.read().map(|t| t.len()).unwrap_or(0)
    }
}

/// 32 random bytes, hex-encoded (64 chars).
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Axum middleware guarding `/temp/{job_id}/...`.
///
/// Unknown or malformed job ids get 404 so job ids cannot be guessed; a known
/// job with a missing or wrong `?token=` gets 401.
///
/// Wire up with `axum::middleware::from_fn_with_state(tokens, bridge_auth_middleware)`.
pub async fn bridge_auth_middleware(
    State(tokens): State<TokenStore>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let job_id = extract_job_id_from_path(request.uri().path()).ok_or(StatusCode::NOT_FOUND)?;
    if !tokens.contains(job_id) {
        return Err(StatusCode::NOT_FOUND);
    }

    let token = request
        .uri()
        .query()
        .and_then(token_from_query)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !tokens.validate(job_id, token) {
        tracing::warn!(job_id = %job_id, "Rejected bridge request with invalid token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

/// Extract the job id from a path like `/temp/{uuid}/...`
fn extract_job_id_from_path(path: &str) -> Option<JobId> {
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    if parts.len() >= 2 && parts[0] == "temp" {
        Uuid::parse_str(parts[1]).ok().map(JobId::from)
    } else {
        None
    }
}

fn token_from_query(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
}
