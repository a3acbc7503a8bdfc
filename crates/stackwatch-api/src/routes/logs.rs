//! Log tail endpoints: pull (`/tail`) and push (`/stream`).
//!
//! The stream is a thin adapter that polls the same tail contract and
//! forwards every change as a server-sent event.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use stackwatch_store::{TailChunk, TailCursor, TailError, TailMode, TailTarget};
use std::convert::Infallible;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{stem}/tail", get(tail_log))
        .route("/{stem}/stream", get(stream_log))
}

/// Cursor fields of the previous chunk, flattened into the query string.
#[derive(Debug, Default, Deserialize)]
pub struct TailQuery {
    pub offset: Option<u64>,
    pub size: Option<u64>,
    pub modified: Option<i64>,
    pub inode: Option<u64>,
}

impl TailQuery {
    /// A cursor when the client sent one; partial cursors start over.
    pub fn cursor(&self) -> Option<TailCursor> {
        Some(TailCursor {
            offset: self.offset?,
            size: self.size?,
            modified_ms: self.modified?,
            identity: self.inode,
        })
    }
}

async fn tail_log(
    State(state): State<AppState>,
    Path(stem): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<TailChunk>, ApiError> {
    let path = state.store.resolve_tail_target(&TailTarget::Log(stem))?;
    let chunk = state.tail.tail(&path, query.cursor().as_ref()).await?;
    Ok(Json(chunk))
}

/// Events: `chunk` (a [`TailChunk`]), then `done` (the archived record) once
/// the run is finished and fully read, or `gone` if the log disappears.
async fn stream_log(
    State(state): State<AppState>,
    Path(stem): Path<String>,
) -> Result<Response, ApiError> {
    let path = state.store.resolve_tail_target(&TailTarget::Log(stem.clone()))?;
    let (tx, rx) = mpsc::channel::<Event>(16);

    tokio::spawn(forward_tail(state, stem, path, tx));

    let stream = ReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Poll the log and forward changes to `tx` until the run is done, the log
/// is gone or the client disconnects.
async fn forward_tail(state: AppState, stem: String, path: PathBuf, tx: mpsc::Sender<Event>) {
    let mut cursor: Option<TailCursor> = None;
    let mut ticker = tokio::time::interval(state.poll_interval);

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(stem = %stem, "Tail stream client went away");
                break;
            }
            _ = ticker.tick() => {}
        }
        // Checked before reading: once archived, the log is complete.
        let finished = state.store.get_archived(&stem).await.ok();

        let event = match state.tail.tail(&path, cursor.as_ref()).await {
            Ok(chunk) => {
                cursor = Some(chunk.cursor);
                if chunk.mode == TailMode::Unchanged {
                    match finished {
                        Some(record) => {
                            let _ = tx.send(json_event("done", &record)).await;
                            break;
                        }
                        None => continue,
                    }
                }
                json_event("chunk", &chunk)
            }
            Err(e @ TailError::SourceGone(_)) => {
                let _ = tx
                    .send(json_event("gone", &json!({ "error": e.to_string(), "gone": true })))
                    .await;
                break;
            }
            Err(e) => {
                let _ = tx
                    .send(json_event("error", &json!({ "error": e.to_string() })))
                    .await;
                break;
            }
        };

        if tx.send(event).await.is_err() {
            debug!(stem = %stem, "Tail stream client went away");
            break;
        }
    }
}

fn json_event(name: &'static str, payload: &impl serde::Serialize) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "null".to_string());
    Event::default().event(name).data(data)
}
