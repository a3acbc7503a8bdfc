//! API routes.

pub mod health;
pub mod history;
pub mod jobs;
pub mod logs;
pub mod webhooks;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .nest("/webhooks", webhooks::router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/logs", logs::router())
        .merge(history::router())
}
