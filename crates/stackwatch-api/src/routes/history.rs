//! Archived run endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use stackwatch_core::{JobRecord, StackName};
use std::collections::HashMap;

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/history", get(list_history))
        .route("/history/{stem}", get(get_run))
        .route("/stacks", get(list_stacks))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub stack: Option<String>,
    pub limit: Option<usize>,
}

/// One stack's archived runs.
#[derive(Debug, Serialize)]
pub struct StackHistory {
    pub name: StackName,
    /// Newest first.
    pub runs: Vec<JobRecord>,
}

/// Archived runs, newest first.
async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    let stack = query.stack.map(StackName::new).transpose()?;
    let records = state
        .store
        .list_archive()
        .await?
        .into_iter()
        .filter(|r| stack.as_ref().is_none_or(|s| r.name == *s))
        .take(query.limit.unwrap_or(DEFAULT_LIMIT))
        .collect();
    Ok(Json(records))
}

async fn get_run(
    State(state): State<AppState>,
    Path(stem): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.store.get_archived(&stem).await?))
}

/// Archived runs grouped by stack; the stack with the latest run comes first.
async fn list_stacks(State(state): State<AppState>) -> Result<Json<Vec<StackHistory>>, ApiError> {
    Ok(Json(group_by_stack(state.store.list_archive().await?)))
}

fn group_by_stack(records: Vec<JobRecord>) -> Vec<StackHistory> {
    let mut groups: Vec<StackHistory> = Vec::new();
    let mut index: HashMap<StackName, usize> = HashMap::new();

    for record in records {
        match index.get(&record.name) {
            Some(&i) => groups[i].runs.push(record),
            None => {
                index.insert(record.name.clone(), groups.len());
                groups.push(StackHistory {
                    name: record.name.clone(),
                    runs: vec![record],
                });
            }
        }
    }
    groups
}
