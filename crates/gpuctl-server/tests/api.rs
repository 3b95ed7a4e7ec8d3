use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use gpuctl_core::config::Config;
use gpuctl_core::Controller;
use gpuctl_server::state::AppState;
use http_body_util::BodyExt;
use tower::ServiceExt;

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        inference_port: 58_001,
        upstream_base_url: "http://127.0.0.1:58001".to_string(),
        upstream_token: None,
        log_dir: dir.path().join("logs"),
        recipe_dir: dir.path().join("recipes"),
        lifetime_db_path: dir.path().join("lifetime.db"),
        metrics_tick: Duration::from_secs(1),
        log_prefix: "backend".to_string(),
    }
}

fn router(dir: &tempfile::TempDir) -> axum::Router {
    let (controller, _metrics) = Controller::build(test_config(dir)).expect("building controller");
    let gpu_source: std::sync::Arc<dyn gpuctl_core::metrics::gpu::GpuSource> =
        std::sync::Arc::from(gpuctl_core::metrics::gpu::detect_source());
    let state = AppState {
        controller,
        gpu_source,
    };
    gpuctl_server::router(state)
}

#[tokio::test]
async fn health_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir);
    let resp = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_reports_idle_when_nothing_running() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir);
    let resp = app
        .oneshot(Request::get("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["running"], false);
    assert_eq!(value["inference_port"], 58001);
}

#[tokio::test]
async fn launch_of_unknown_recipe_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir);
    let resp = app
        .oneshot(
            Request::post("/launch/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn evict_with_nothing_running_reports_no_pid() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir);
    let resp = app
        .oneshot(Request::post("/evict").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(value["evicted_pid"].is_null());
}

#[tokio::test]
async fn lifetime_metrics_reports_zeroed_counters_on_a_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir);
    let resp = app
        .oneshot(
            Request::get("/lifetime-metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["tokens_total"], 0.0);
    assert_eq!(value["kwh_per_million_tokens"], serde_json::Value::Null);
    assert!(value["first_started_at"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn gpus_endpoint_returns_an_array() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir);
    let resp = app
        .oneshot(Request::get("/gpus").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(value.is_array());
}
