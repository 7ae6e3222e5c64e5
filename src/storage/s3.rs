//! S3-compatible artifact store (AWS S3, MinIO).
//!
//! Requests are path-style (`<endpoint>/<bucket>/<key>`) and signed with AWS
//! Signature Version 4. The whole object is hashed up front, so uploads are
//! buffered in memory; converted PDFs are small enough for that.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};

use crate::config::StorageConfig;
use crate::storage::{ArtifactStore, Metadata, Result, StorageError, encode_key};

type HmacSha256 = Hmac<Sha256>;

const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Uploads to one bucket of an S3-compatible service.
pub struct S3Store {
    config: StorageConfig,
    http: reqwest::Client,
    bucket_ready: AtomicBool,
}

impl S3Store {
    pub fn new(config: StorageConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| StorageError::Request {
                reason: e.to_string(),
            })?;
        Ok(Self {
            config,
            http,
            bucket_ready: AtomicBool::new(false),
        })
    }

    fn bucket_url(&self) -> String {
        format!("{}/{}", self.config.endpoint_url, self.config.bucket)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.bucket_url(), encode_key(key))
    }

    /// URL handed back to clients for a stored key.
    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.public_base(),
            self.config.bucket,
            encode_key(key)
        )
    }

    async fn bucket_exists(&self) -> Result<bool> {
        let response = self
            .send(Method::HEAD, &self.bucket_url(), Vec::new(), BTreeMap::new())
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StorageError::Bucket {
                bucket: self.config.bucket.clone(),
                reason: format!("HEAD returned HTTP {}", s.as_u16()),
            }),
        }
    }

    /// Create the bucket on first use if it does not exist.
    async fn ensure_bucket(&self) -> Result<()> {
        if self.bucket_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        if !self.bucket_exists().await? {
            tracing::warn!(bucket = %self.config.bucket, "Bucket does not exist, creating it");
            let response = self
                .send(Method::PUT, &self.bucket_url(), Vec::new(), BTreeMap::new())
                .await?;
            let status = response.status();
            // Another job may have created it in the meantime.
            if !status.is_success() && status != StatusCode::CONFLICT {
                let body = response.text().await.unwrap_or_default();
                return Err(StorageError::Bucket {
                    bucket: self.config.bucket.clone(),
                    reason: format!("create returned HTTP {}: {}", status.as_u16(), body),
                });
            }
            tracing::info!(bucket = %self.config.bucket, "Created bucket");
        }

        self.bucket_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Vec<u8>,
        extra_headers: BTreeMap<String, String>,
    ) -> Result<reqwest::Response> {
        let parsed = reqwest::Url::parse(url).map_err(|e| StorageError::Request {
            reason: format!("invalid storage URL {}: {}", url, e),
        })?;
        let payload_hash = if body.is_empty() {
            EMPTY_PAYLOAD_SHA256.to_string()
        } else {
            hex::encode(Sha256::digest(&body))
        };

        let signed = sign_request(SigningInput {
            method: method.as_str(),
            url: &parsed,
            headers: extra_headers,
            payload_hash: &payload_hash,
            access_key_id: &self.config.access_key_id,
            secret_access_key: self.config.secret_access_key.expose_secret(),
            region: &self.config.region,
            now: Utc::now(),
        });

        let mut request = self.http.request(method, parsed);
        for (name, value) in &signed.headers {
            if name != "host" {
                request = request.header(name, value);
            }
        }
        request = request.header("authorization", signed.authorization);
        if !body.is_empty() {
            request = request.body(body);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                StorageError::Timeout {
                    elapsed: self.config.request_timeout,
                }
            } else {
                StorageError::Request {
                    reason: e.to_string(),
                }
            }
        })
    }
}

#[async_trait]
impl ArtifactStore for S3Store {
    async fn put(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<String> {
        self.ensure_bucket().await?;

        let body = tokio::fs::read(local_path).await?;
        let size = body.len();

        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        for (name, value) in metadata {
            headers.insert(format!("x-amz-meta-{}", name.to_lowercase()), value.clone());
        }

        tracing::info!(
            bucket = %self.config.bucket,
            key = %key,
            size,
            "Uploading artifact"
        );

        let response = self
            .send(Method::PUT, &self.object_url(key), body, headers)
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(self.public_url(key))
    }

    async fn ensure_ready(&self) -> Result<()> {
        if self.bucket_exists().await? {
            tracing::info!(bucket = %self.config.bucket, endpoint = %self.config.endpoint_url, "Storage reachable");
            self.bucket_ready.store(true, Ordering::Release);
        } else {
            tracing::warn!(
                bucket = %self.config.bucket,
                "Bucket does not exist, it will be created on first upload"
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

struct SigningInput<'a> {
    method: &'a str,
    url: &'a reqwest::Url,
    headers: BTreeMap<String, String>,
    payload_hash: &'a str,
    access_key_id: &'a str,
    secret_access_key: &'a str,
    region: &'a str,
    now: DateTime<Utc>,
}

struct SignedRequest {
    /// Every signed header, lowercase names.
    headers: BTreeMap<String, String>,
    authorization: String,
}

/// AWS Signature Version 4 for the `s3` service.
fn sign_request(input: SigningInput<'_>) -> SignedRequest {
    let amz_date = input.now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = input.now.format("%Y%m%d").to_string();

    let mut headers: BTreeMap<String, String> = input
        .headers
        .into_iter()
        .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
        .collect();
    headers.insert("host".to_string(), host_header(input.url));
    headers.insert("x-amz-date".to_string(), amz_date.clone());
    headers.insert(
        "x-amz-content-sha256".to_string(),
        input.payload_hash.to_string(),
    );

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        input.method,
        canonical_uri(input.url),
        canonical_query(input.url),
        canonical_headers,
        signed_headers,
        input.payload_hash
    );

    let scope = format!("{}/{}/s3/aws4_request", date, input.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(input.secret_access_key, &date, input.region);
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        input.access_key_id, scope, signed_headers, signature
    );

    SignedRequest {
        headers,
        authorization,
    }
}

fn signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, b"s3");
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn host_header(url: &reqwest::Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// The URL path is already percent-encoded by [`encode_key`]; S3 signs it
/// as sent.
fn canonical_uri(url: &reqwest::Url) -> String {
    match url.path() {
        "" => "/".to_string(),
        path => path.to_string(),
    }
}

fn canonical_query(url: &reqwest::Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            (
                urlencoding::encode(&k).into_owned(),
                urlencoding::encode(&v).into_owned(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}
