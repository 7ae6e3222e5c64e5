//! Batch client behaviour against a scripted mock server.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use convert2pdf::client::{ClientConfig, ConvertClient, ProgressSink, ProgressSnapshot};
use convert2pdf::orchestrator::HttpServer;

#[derive(Default)]
struct Script {
    /// Requests seen per file name.
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Script {
    fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

/// `flaky.docx` fails twice with 500, `bad.docx` always gets a 400,
/// everything else succeeds after a short delay.
async fn convert(
    State(script): State<Arc<Script>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    let mut name = String::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() == Some("file") {
            name = field.file_name().unwrap_or_default().to_string();
            let _ = field.bytes().await.unwrap();
        }
    }

    let call = {
        let mut calls = script.calls.lock().unwrap();
        let n = calls.entry(name.clone()).or_default();
        *n += 1;
        *n
    };

    let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    script.max_in_flight.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(40)).await;
    script.in_flight.fetch_sub(1, Ordering::SeqCst);

    match name.as_str() {
        "flaky.docx" if call <= 2 => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Failed to convert file: engine busy" })),
        ),
        "bad.docx" => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "file type not supported, given file type is: .docx" })),
        ),
        _ => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "original_source": format!("uploaded_file: {}", name),
                "converted_url": format!("https://objects.test/{}.pdf", name),
            })),
        ),
    }
}

async fn mock_server(script: Arc<Script>) -> (HttpServer, SocketAddr) {
    let app = Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .route(
            "/get_supported_file_types",
            get(|| async { Json(json!({ "supported_file_types": [".docx", ".xlsx"] })) }),
        )
        .route("/convert", post(convert))
        .with_state(script);

    let mut server = HttpServer::new(
        "Mock server",
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        app,
    );
    let addr = server.start().await.unwrap();
    (server, addr)
}

fn client(addr: SocketAddr, max_retries: u32, retry_delay: Duration) -> ConvertClient {
    ConvertClient::new(ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        timeout: Duration::from_secs(10),
        max_retries,
        retry_delay,
    })
    .unwrap()
}

#[derive(Default)]
struct RecordingProgress {
    started: Mutex<Option<usize>>,
    seen: Mutex<Vec<usize>>,
    finished: Mutex<Option<ProgressSnapshot>>,
}

impl ProgressSink for RecordingProgress {
    fn on_batch_start(&self, total: usize) {
        *self.started.lock().unwrap() = Some(total);
    }

    fn on_job_complete(&self, snapshot: &ProgressSnapshot) {
        self.seen.lock().unwrap().push(snapshot.done);
    }

    fn on_batch_complete(&self, snapshot: &ProgressSnapshot) {
        *self.finished.lock().unwrap() = Some(snapshot.clone());
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried_with_backoff() {
    let script = Arc::new(Script::default());
    let (mut server, addr) = mock_server(Arc::clone(&script)).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flaky.docx");
    std::fs::write(&path, "x").unwrap();

    let client = client(addr, 3, Duration::from_millis(50));
    client.connect().await.unwrap();
    let result = client.convert_file(&path).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(
        result.converted_url.as_deref(),
        Some("https://objects.test/flaky.docx.pdf")
    );
    assert_eq!(script.calls("flaky.docx"), 3);
    // Two waits: 50ms then 100ms.
    assert!(result.elapsed_time >= 0.15, "{}", result.elapsed_time);

    server.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_report_last_error() {
    let script = Arc::new(Script::default());
    let (mut server, addr) = mock_server(Arc::clone(&script)).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flaky.docx");
    std::fs::write(&path, "x").unwrap();

    let client = client(addr, 1, Duration::from_millis(5));
    client.connect().await.unwrap();
    let result = client.convert_file(&path).await;

    assert!(!result.is_success());
    assert_eq!(
        result.error.as_deref(),
        Some("conversion failed after 2 attempts: Failed to convert file: engine busy")
    );
    assert_eq!(script.calls("flaky.docx"), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let script = Arc::new(Script::default());
    let (mut server, addr) = mock_server(Arc::clone(&script)).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.docx");
    std::fs::write(&path, "x").unwrap();

    let client = client(addr, 3, Duration::from_millis(5));
    client.connect().await.unwrap();
    let result = client.convert_file(&path).await;

    assert!(!result.is_success());
    assert_eq!(script.calls("bad.docx"), 1);
    assert!(result.error.unwrap().ends_with("given file type is: .docx"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_preflight_failures_never_reach_the_server() {
    let script = Arc::new(Script::default());
    let (mut server, addr) = mock_server(Arc::clone(&script)).await;

    let dir = tempfile::tempdir().unwrap();
    let unsupported = dir.path().join("slides.key");
    std::fs::write(&unsupported, "x").unwrap();

    let client = client(addr, 3, Duration::from_millis(5));
    client.connect().await.unwrap();

    let missing = client.convert_file(&dir.path().join("missing.docx")).await;
    assert_eq!(missing.error.as_deref(), Some("file not found"));

    let result = client.convert_file(&unsupported).await;
    assert_eq!(result.error.as_deref(), Some("unsupported file type: .key"));

    assert!(script.calls.lock().unwrap().is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrency_is_bounded_and_order_preserved() {
    let script = Arc::new(Script::default());
    let (mut server, addr) = mock_server(Arc::clone(&script)).await;

    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<_> = (0..8)
        .map(|i| {
            let path = dir.path().join(format!("doc{}.docx", i));
            std::fs::write(&path, "x").unwrap();
            path
        })
        .collect();

    let progress = Arc::new(RecordingProgress::default());
    let client = client(addr, 0, Duration::from_millis(5))
        .with_progress(Arc::clone(&progress) as Arc<dyn ProgressSink>);
    let results = client.convert_all(&paths, 3).await.unwrap();

    assert_eq!(results.len(), 8);
    for (i, result) in results.iter().enumerate() {
        assert!(result.is_success());
        assert_eq!(
            result.converted_url.as_deref(),
            Some(format!("https://objects.test/doc{}.docx.pdf", i).as_str())
        );
    }

    let max = script.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 3, "saw {max} concurrent requests");
    assert!(max >= 2, "requests never overlapped");

    assert_eq!(*progress.started.lock().unwrap(), Some(8));
    assert_eq!(*progress.seen.lock().unwrap(), (1..=8).collect::<Vec<_>>());
    let finished = progress.finished.lock().unwrap().clone().unwrap();
    assert_eq!((finished.succeeded, finished.failed), (8, 0));

    server.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_server_fails_connect() {
    // Bind and drop to get a port nothing listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client(addr, 0, Duration::from_millis(5));
    let err = client.connect().await.unwrap_err();
    assert!(err.to_string().contains("/health"), "{err}");
}
