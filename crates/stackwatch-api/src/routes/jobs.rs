//! Pending job endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use stackwatch_core::{JobRecord, StackName};
use stackwatch_store::{TailChunk, TailTarget};

use super::logs::TailQuery;
use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{name}", get(get_job))
        .route("/{name}/tail", get(tail_job))
}

/// Requests awaiting or executing a build, most recent first.
async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobRecord>>, ApiError> {
    Ok(Json(state.store.list_pending().await?))
}

async fn get_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let name = StackName::new(name)?;
    Ok(Json(state.store.get(&name).await?))
}

/// Tail of the pending record file itself.
async fn tail_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<TailChunk>, ApiError> {
    let name = StackName::new(name)?;
    let path = state.store.resolve_tail_target(&TailTarget::Record(name))?;
    let chunk = state.tail.tail(&path, query.cursor().as_ref()).await?;
    Ok(Json(chunk))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::app;
    use axum::http::StatusCode;
    use stackwatch_core::{JobRecord, StackName};

    #[tokio::test]
    async fn test_list_and_get_pending() {
        let app = app(None).await;
        let web = StackName::new("web").unwrap();
        app.store.submit(&web).await.unwrap();

        let (status, body) = app.get("/api/v1/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["name"], "web");
        assert_eq!(body[0]["status"], "pending");

        let (status, body) = app.get("/api/v1/jobs/web").await;
        assert_eq!(status, StatusCode::OK);
        let record: JobRecord = serde_json::from_value(body).unwrap();
        assert_eq!(record, JobRecord::new(web));
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_names() {
        let app = app(None).await;

        let (status, body) = app.get("/api/v1/jobs/ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, _) = app.get("/api/v1/jobs/.hidden").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_tail_pending_record() {
        let app = app(None).await;
        app.store.submit(&StackName::new("web").unwrap()).await.unwrap();

        let (status, body) = app.get("/api/v1/jobs/web/tail").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "initial");
        assert!(body["content"].as_str().unwrap().contains("\"pending\""));

        let (status, body) = app.get("/api/v1/jobs/api/tail").await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["gone"], true);
    }
}
