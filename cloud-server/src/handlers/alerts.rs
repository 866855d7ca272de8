//! Alert query handlers

use axum::{extract::{Path, Query, State}, Json};

use crate::{AppError, AppResult, AppState};
use crate::models::{AlertFilter, StoredAlert};

/// List stored alerts, newest first
pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<AlertFilter>,
) -> Json<Vec<StoredAlert>> {
    Json(state.store.list(&filter).await)
}

/// Get single alert
pub async fn get(
    State(state): State<AppState>,
    Path((agent_id, id)): Path<(String, u64)>,
) -> AppResult<Json<StoredAlert>> {
    let alert = state
        .store
        .get(&agent_id, id)
        .await
        .ok_or_else(|| AppError::NotFound("Alert not found".to_string()))?;

    Ok(Json(alert))
}
