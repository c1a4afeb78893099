use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use render_job_engine::engine::error::PipelineError;
use render_job_engine::engine::fetcher::{AssetFetcher, FetchRequest};
use render_job_engine::source::http_source::HttpSource;
use render_job_engine::source::traits::AssetSource;

const MODEL_SIZE: usize = 256 * 1024;

fn model_bytes() -> Vec<u8> {
    (0..MODEL_SIZE).map(|i| (i % 251) as u8).collect()
}

async fn serve_model() -> impl IntoResponse {
    (StatusCode::OK, model_bytes())
}

async fn serve_script() -> impl IntoResponse {
    (StatusCode::OK, "import bpy\nprint('ok')\n")
}

async fn serve_binary_script() -> impl IntoResponse {
    (StatusCode::OK, vec![0xffu8, 0xfe, 0x00, 0x80])
}

async fn serve_slow() -> impl IntoResponse {
    tokio::time::sleep(Duration::from_secs(30)).await;
    (StatusCode::OK, "late")
}

async fn echo_token(req: Request) -> impl IntoResponse {
    let token = req
        .headers()
        .get("x-asset-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    (StatusCode::OK, token)
}

async fn start_upstream() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/models/sofa.blend", get(serve_model))
        .route("/tools/scene.py", get(serve_script))
        .route("/tools/broken.py", get(serve_binary_script))
        .route("/slow.blend", get(serve_slow))
        .route("/token", get(echo_token));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

#[tokio::test]
async fn test_http_source_fetch() {
    let (addr, _handle) = start_upstream().await;
    let source = HttpSource::default();

    let body = source
        .fetch(&format!("http://{}/models/sofa.blend", addr))
        .await
        .unwrap();
    assert_eq!(body.len(), MODEL_SIZE);
    assert_eq!(&body[..], &model_bytes()[..]);
}

#[tokio::test]
async fn test_http_source_not_found() {
    let (addr, _handle) = start_upstream().await;
    let source = HttpSource::default();

    let err = source
        .fetch(&format!("http://{}/models/missing.blend", addr))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn test_http_source_sends_headers() {
    let (addr, _handle) = start_upstream().await;
    let mut headers = HashMap::new();
    headers.insert("x-asset-token".to_string(), "s3cret".to_string());
    let source = HttpSource::new(headers);

    let body = source.fetch(&format!("http://{}/token", addr)).await.unwrap();
    assert_eq!(&body[..], b"s3cret");
}

#[tokio::test]
async fn test_fetch_all_writes_every_destination() {
    let (addr, _handle) = start_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let fetcher = AssetFetcher::new(Arc::new(HttpSource::default()), 2);

    let model = dir.path().join("models").join("000_Sofa.blend");
    let script = dir.path().join("scene").join("ApplyDesignSceneScript.py");
    fetcher
        .fetch_all(vec![
            FetchRequest::binary(format!("http://{}/models/sofa.blend", addr), &model),
            FetchRequest::text(format!("http://{}/tools/scene.py", addr), &script),
        ])
        .await
        .unwrap();

    assert_eq!(std::fs::read(&model).unwrap(), model_bytes());
    assert_eq!(
        std::fs::read_to_string(&script).unwrap(),
        "import bpy\nprint('ok')\n"
    );
}

#[tokio::test]
async fn test_text_fetch_rejects_invalid_utf8() {
    let (addr, _handle) = start_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let fetcher = AssetFetcher::new(Arc::new(HttpSource::default()), 4);
    let dest = dir.path().join("broken.py");

    let err = fetcher
        .fetch_one(&FetchRequest::text(
            format!("http://{}/tools/broken.py", addr),
            &dest,
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Fetch { ref reason, .. } if reason.contains("UTF-8")));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_fetch_all_fails_fast_without_partial_files() {
    let (addr, _handle) = start_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let fetcher = AssetFetcher::new(Arc::new(HttpSource::default()), 4);

    let slow = dir.path().join("slow.blend");
    let missing_url = format!("http://{}/models/missing.blend", addr);
    let t0 = std::time::Instant::now();
    let err = fetcher
        .fetch_all(vec![
            FetchRequest::binary(format!("http://{}/slow.blend", addr), &slow),
            FetchRequest::binary(&missing_url, dir.path().join("missing.blend")),
        ])
        .await
        .unwrap_err();

    assert!(t0.elapsed() < Duration::from_secs(10));
    match err {
        PipelineError::Fetch { url, .. } => assert_eq!(url, missing_url),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!slow.exists());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty());
}
