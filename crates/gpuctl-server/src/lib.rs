pub mod error;
pub mod handlers;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/gpus", get(handlers::gpus))
        .route("/lifetime-metrics", get(handlers::lifetime_metrics))
        .route("/launch/{recipe_id}", post(handlers::launch))
        .route("/evict", post(handlers::evict))
        .route("/wait-ready", get(handlers::wait_ready))
        .route("/events", get(handlers::events))
        .route("/logs/{session_id}/stream", get(handlers::logs_stream))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
