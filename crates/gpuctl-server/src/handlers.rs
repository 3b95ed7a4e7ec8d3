//! One handler per route on the HTTP API surface.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json};
use axum::http::StatusCode;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use gpuctl_core::event_bus::{log_channel, DEFAULT_CHANNEL};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.supervisor.status().await)
}

pub async fn gpus(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gpu_source.read())
}

/// Cumulative counters across controller restarts, derived from
/// `LifetimeStore` the same way `MetricsCollector` derives them for its
/// per-tick `metrics` event (energy in kWh, uptime in hours,
/// kWh-per-million-tokens). A dedicated pull endpoint for this data, rather
/// than requiring a subscriber to sit on `/events` for it, ports
/// `original_source/controller/routes/monitoring.py`'s `/lifetime-metrics`.
pub async fn lifetime_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let lifetime = &state.controller.lifetime;
    let get = |key: &str| lifetime.get(key).ok().flatten().unwrap_or(0.0);

    let tokens_total = get("tokens_total");
    let energy_wh = get("energy_wh");
    let energy_kwh = energy_wh / 1000.0;
    let kwh_per_million_tokens = if tokens_total > 0.0 {
        Some(energy_kwh / (tokens_total / 1_000_000.0))
    } else {
        None
    };

    Json(json!({
        "tokens_total": tokens_total,
        "prompt_tokens_total": get("prompt_tokens_total"),
        "completion_tokens_total": get("completion_tokens_total"),
        "requests_total": get("requests_total"),
        "energy_wh": energy_wh,
        "energy_kwh": energy_kwh,
        "uptime_seconds": get("uptime_seconds"),
        "uptime_hours": get("uptime_seconds") / 3600.0,
        "kwh_per_million_tokens": kwh_per_million_tokens,
        "first_started_at": get("first_started_at"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn launch(
    State(state): State<AppState>,
    Path(recipe_id): Path<String>,
    Query(query): Query<ForceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .controller
        .supervisor
        .launch(&recipe_id, query.force)
        .await?;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(result)))
}

pub async fn evict(
    State(state): State<AppState>,
    Query(query): Query<ForceQuery>,
) -> impl IntoResponse {
    let pid = state.controller.supervisor.evict(query.force).await;
    Json(json!({ "evicted_pid": pid }))
}

#[derive(Debug, Deserialize)]
pub struct WaitReadyQuery {
    #[serde(default = "default_wait_timeout")]
    pub timeout: u64,
}

fn default_wait_timeout() -> u64 {
    300
}

/// Blocks until the backend's own `/health` returns 200 or `timeout`
/// elapses, independent of whether a launch is in flight.
pub async fn wait_ready(
    State(state): State<AppState>,
    Query(query): Query<WaitReadyQuery>,
) -> impl IntoResponse {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(query.timeout);
    let url = format!(
        "http://127.0.0.1:{}/health",
        state.controller.config.inference_port
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("building reqwest client");

    loop {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return Json(json!({ "ready": true }));
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Json(json!({ "ready": false }));
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// `Event::to_sse` already renders the full wire format, so subscribers are
/// served as a raw `text/event-stream` body rather than via axum's `Sse`
/// response type (which expects to build each event itself).
fn sse_response(
    receiver: tokio::sync::mpsc::Receiver<gpuctl_core::event_bus::Event>,
) -> impl IntoResponse {
    let stream = ReceiverStream::new(receiver).map(|event| {
        Ok::<_, std::convert::Infallible>(Bytes::from(event.to_sse()))
    });
    (
        [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
        axum::body::Body::from_stream(stream),
    )
}

pub async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let receiver = state.controller.event_bus.subscribe(DEFAULT_CHANNEL);
    sse_response(receiver)
}

pub async fn logs_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let receiver = state
        .controller
        .event_bus
        .subscribe(&log_channel(&session_id));
    sse_response(receiver)
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    use gpuctl_core::chat_proxy::ProxyOutcome;

    match state
        .controller
        .chat_proxy
        .handle(body)
        .await
        .map_err(ApiError::from)?
    {
        ProxyOutcome::NonStreaming(value) => Ok(Json(value).into_response()),
        ProxyOutcome::Streaming(byte_stream) => {
            let body = axum::body::Body::from_stream(byte_stream);
            Ok((
                [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                body,
            )
                .into_response())
        }
    }
}
