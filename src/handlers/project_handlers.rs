//! HTTP handlers for projects and the contribution records that feed the
//! ledger: tasks, solutions and free proposals.

use crate::{
    errors::AppError,
    models::{
        contribution::{FreeProposal, ReviewStatus, TaskSolution},
        ledger::HolderSnapshot,
        project::NewProject,
    },
    services::project_service::ProjectError,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CreateTaskReq {
    pub title: String,
    #[serde(default)]
    pub equity_reward: f64,
}

#[derive(Debug, Deserialize)]
pub struct SubmitSolutionReq {
    pub submitted_by: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateProposalReq {
    pub proposed_by: i64,
    pub title: String,
    pub equity_requested: f64,
}

/// Body of the approve/accept endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ReviewReq {
    #[serde(default)]
    pub changed_by: Option<i64>,
}

#[derive(Serialize)]
pub struct ApprovedSolution {
    pub solution: TaskSolution,
    /// `None` when the task carries no reward.
    pub holder: Option<HolderSnapshot>,
}

#[derive(Serialize)]
pub struct AcceptedProposal {
    pub proposal: FreeProposal,
    pub holder: HolderSnapshot,
}

/// POST `/projects`
pub async fn create_project(
    State(state): State<AppState>,
    Json(input): Json<NewProject>,
) -> Result<impl IntoResponse, AppError> {
    let project = state.projects.create_project(input).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET `/projects/{project_id}`
pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.projects.get_project(project_id).await?))
}

/// DELETE `/projects/{project_id}` drops ledger rows and the upload tree.
pub async fn delete_project(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    state.projects.delete_project(project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/projects/{project_id}/tasks`
pub async fn create_task(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateTaskReq>,
) -> Result<impl IntoResponse, AppError> {
    let task = state
        .projects
        .create_task(project_id, &req.title, req.equity_reward)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// POST `/tasks/{task_id}/solutions`
pub async fn submit_solution(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    Json(req): Json<SubmitSolutionReq>,
) -> Result<impl IntoResponse, AppError> {
    let solution = state
        .projects
        .submit_solution(task_id, req.submitted_by)
        .await?;
    Ok((StatusCode::CREATED, Json(solution)))
}

/// POST `/solutions/{solution_id}/approve`
///
/// Approves the solution and credits its author. Calling it again on an
/// approved solution retries only the grant, which the ledger refuses if
/// it already happened.
pub async fn approve_solution(
    State(state): State<AppState>,
    Path(solution_id): Path<i64>,
    body: Option<Json<ReviewReq>>,
) -> Result<impl IntoResponse, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let solution = match state.projects.approve_solution(solution_id).await {
        Ok(solution) => solution,
        Err(ProjectError::AlreadyReviewed {
            status: ReviewStatus::Approved,
            ..
        }) => state.projects.get_solution(solution_id).await?,
        Err(err) => return Err(err.into()),
    };
    let holder = state
        .ledger
        .grant_for_task(solution_id, req.changed_by)
        .await?;
    Ok(Json(ApprovedSolution { solution, holder }))
}

/// POST `/projects/{project_id}/proposals`
pub async fn create_proposal(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateProposalReq>,
) -> Result<impl IntoResponse, AppError> {
    let proposal = state
        .projects
        .create_free_proposal(project_id, req.proposed_by, &req.title, req.equity_requested)
        .await?;
    Ok((StatusCode::CREATED, Json(proposal)))
}

/// POST `/proposals/{proposal_id}/accept`
pub async fn accept_proposal(
    State(state): State<AppState>,
    Path(proposal_id): Path<i64>,
    body: Option<Json<ReviewReq>>,
) -> Result<impl IntoResponse, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let proposal = match state.projects.accept_free_proposal(proposal_id).await {
        Ok(proposal) => proposal,
        Err(ProjectError::AlreadyReviewed {
            status: ReviewStatus::Approved,
            ..
        }) => state.projects.get_free_proposal(proposal_id).await?,
        Err(err) => return Err(err.into()),
    };
    let holder = state
        .ledger
        .grant_for_free_proposal(proposal_id, req.changed_by)
        .await?;
    Ok(Json(AcceptedProposal { proposal, holder }))
}
