//! Health check endpoints.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready once both store directories exist.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let pending = tokio::fs::metadata(state.store.pending_dir()).await;
    let archive = tokio::fs::metadata(state.store.archive_dir()).await;
    match (pending, archive) {
        (Ok(p), Ok(a)) if p.is_dir() && a.is_dir() => {
            (StatusCode::OK, Json(json!({ "status": "ready" })))
        }
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable" })),
        ),
    }
}
