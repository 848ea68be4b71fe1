//! HTTP handlers for the project ledger. Every route dispatches through
//! `LedgerService`, so callers never need to know which ledger a project
//! runs on.

use crate::{
    errors::AppError,
    models::ledger::{GrantRequest, Page, RevokeRequest, SourceKind},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

/// Grant body; the project comes from the path.
#[derive(Debug, Deserialize)]
pub struct GrantReq {
    pub user_id: i64,
    pub percentage: f64,
    pub source: SourceKind,
    #[serde(default)]
    pub source_id: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub changed_by: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeReq {
    pub user_id: i64,
    pub percentage: f64,
    pub reason: String,
    #[serde(default)]
    pub changed_by: Option<i64>,
}

/// POST `/projects/{project_id}/ledger/initialize`
pub async fn initialize_ledger(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let creator = state.ledger.initialize_project_ledger(project_id).await?;
    Ok(Json(creator))
}

/// GET `/projects/{project_id}/ledger/cap-table`
pub async fn cap_table(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.ledger.get_cap_table(project_id).await?))
}

/// GET `/projects/{project_id}/ledger/history?limit=&offset=`, newest first.
pub async fn ledger_history(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    Query(page): Query<Page>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(
        state.ledger.list_ledger_history(project_id, page).await?,
    ))
}

/// GET `/projects/{project_id}/ledger/capacity`
pub async fn capacity(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.ledger.capacity(project_id).await?))
}

/// GET `/projects/{project_id}/ledger/holders/{user_id}`
pub async fn holder(
    State(state): State<AppState>,
    Path((project_id, user_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, AppError> {
    match state.ledger.user_total(project_id, user_id).await? {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(AppError::not_found(format!(
            "user {} holds nothing in project {}",
            user_id, project_id
        ))),
    }
}

/// POST `/projects/{project_id}/ledger/grants`
pub async fn grant(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    Json(req): Json<GrantReq>,
) -> Result<impl IntoResponse, AppError> {
    let request = GrantRequest {
        project_id,
        user_id: req.user_id,
        percentage: req.percentage,
        source: req.source,
        source_id: req.source_id,
        reason: req.reason,
        changed_by: req.changed_by,
    };
    let holder = state.ledger.grant(&request).await?;
    Ok((StatusCode::CREATED, Json(holder)))
}

/// POST `/projects/{project_id}/ledger/revocations`
pub async fn revoke(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    Json(req): Json<RevokeReq>,
) -> Result<impl IntoResponse, AppError> {
    let request = RevokeRequest {
        project_id,
        user_id: req.user_id,
        percentage: req.percentage,
        reason: req.reason,
        changed_by: req.changed_by,
    };
    Ok(Json(state.ledger.revoke(&request).await?))
}

/// GET `/projects/{project_id}/ledger/validate` (read-only sweep)
pub async fn validate(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.ledger.validate(project_id).await?))
}

/// POST `/projects/{project_id}/ledger/migrate-shares` (one way)
pub async fn migrate_shares(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.ledger.migrate_to_shares(project_id).await?))
}
