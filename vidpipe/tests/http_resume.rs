//! Range resume against a local axum server.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use vidpipe::downloader::{FetchOptions, FetchStrategy, HttpStrategy, SourceRef, TransferReporter};
use vidpipe::utils::http_client::build_http_client;

#[derive(Clone)]
struct Served {
    body: Arc<Vec<u8>>,
    honor_range: bool,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
}

async fn serve_clip(State(served): State<Served>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    served.ranges.lock().push(range.clone());

    let start = range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|n| n.parse::<usize>().ok());
    let total = served.body.len();
    match start {
        Some(start) if served.honor_range && start < total => (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_TYPE, "video/mp4".to_string()),
                (
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, total - 1, total),
                ),
            ],
            served.body[start..].to_vec(),
        )
            .into_response(),
        _ => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "video/mp4".to_string())],
            served.body.to_vec(),
        )
            .into_response(),
    }
}

async fn start_server(served: Served) -> String {
    let app = Router::new()
        .route("/clip.mp4", get(serve_clip))
        .with_state(served);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server");
    });
    format!("http://{}/clip.mp4", addr)
}

fn body() -> Vec<u8> {
    (0..64 * 1024).map(|i| (i % 251) as u8).collect()
}

async fn fetch_with_partial(honor_range: bool, partial: usize) -> (Vec<u8>, Vec<Option<String>>) {
    let served = Served {
        body: Arc::new(body()),
        honor_range,
        ranges: Arc::new(Mutex::new(Vec::new())),
    };
    let url = start_server(served.clone()).await;

    let dir = TempDir::new().expect("temp dir");
    let dest = dir.path().join("clip.mp4");
    tokio::fs::write(&dest, &served.body[..partial])
        .await
        .expect("write partial");

    let strategy = HttpStrategy::new(build_http_client(Duration::from_secs(10)).expect("client"));
    let descriptor = strategy
        .fetch(
            &SourceRef::new(url, 1),
            &dest,
            &FetchOptions::default(),
            &TransferReporter::detached("resume-test"),
            &CancellationToken::new(),
        )
        .await
        .expect("fetch");

    assert_eq!(descriptor.size_bytes, Some(served.body.len() as u64));
    assert_eq!(descriptor.container.as_deref(), Some("mp4"));
    let written = tokio::fs::read(&dest).await.expect("read back");
    let ranges = served.ranges.lock().clone();
    (written, ranges)
}

#[tokio::test]
async fn test_partial_file_is_resumed() {
    let (written, ranges) = fetch_with_partial(true, 10_000).await;
    assert_eq!(written, body());
    assert_eq!(ranges, vec![Some("bytes=10000-".to_string())]);
}

#[tokio::test]
async fn test_ignored_range_restarts_file() {
    let (written, ranges) = fetch_with_partial(false, 10_000).await;
    assert_eq!(written, body());
    assert_eq!(ranges.len(), 1);
}
