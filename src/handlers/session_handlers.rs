//! HTTP handlers for upload sessions and workspace sync.
//! File bodies are streamed back from disk; archives arrive as multipart.

use crate::{
    errors::AppError,
    models::session::{SessionKind, SessionStatus},
    state::AppState,
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Multipart, Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

#[derive(Debug, Deserialize)]
pub struct CreateSessionReq {
    pub initiated_by: i64,
    #[serde(default = "default_kind", rename = "type")]
    pub kind: SessionKind,
}

fn default_kind() -> SessionKind {
    SessionKind::Zip
}

#[derive(Serialize)]
pub struct CreatedSession {
    pub session_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub initiator: Option<i64>,
}

/// POST `/projects/{project_id}/sessions`
pub async fn create_session(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateSessionReq>,
) -> Result<impl IntoResponse, AppError> {
    state.projects.get_project(project_id).await?;
    let session_id = state
        .store
        .create_session(project_id, req.initiated_by, req.kind)
        .await?;
    Ok((StatusCode::CREATED, Json(CreatedSession { session_id })))
}

/// GET `/projects/{project_id}/sessions`, newest first.
pub async fn list_sessions(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.store.list_sessions(project_id).await?))
}

/// GET `/projects/{project_id}/sessions/{session_id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path((project_id, session_id)): Path<(i64, String)>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.store.read_session(project_id, &session_id).await?))
}

/// DELETE `/projects/{project_id}/sessions/{session_id}`
pub async fn cancel_session(
    State(state): State<AppState>,
    Path((project_id, session_id)): Path<(i64, String)>,
) -> Result<impl IntoResponse, AppError> {
    state.store.cancel(project_id, &session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/projects/{project_id}/sessions/{session_id}/archive`
///
/// Multipart body with the ZIP in a field named `file`.
pub async fn upload_archive(
    State(state): State<AppState>,
    Path((project_id, session_id)): Path<(i64, String)>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut archive = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {}", err)))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|err| AppError::bad_request(format!("reading upload: {}", err)))?;
            archive = Some(bytes);
            break;
        }
    }
    let archive = archive.ok_or_else(|| AppError::bad_request("missing `file` field"))?;

    let summary = state
        .store
        .stage_zip(project_id, &session_id, archive)
        .await?;
    Ok(Json(summary))
}

/// PUT `/projects/{project_id}/sessions/{session_id}/files/{*path}`
pub async fn put_file(
    State(state): State<AppState>,
    Path((project_id, session_id, path)): Path<(i64, String, String)>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let descriptor = state
        .store
        .stage_file(project_id, &session_id, &path, body)
        .await?;
    Ok((StatusCode::CREATED, Json(descriptor)))
}

/// GET `/projects/{project_id}/sessions/{session_id}/files`
pub async fn list_files(
    State(state): State<AppState>,
    Path((project_id, session_id)): Path<(i64, String)>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.store.list_files(project_id, &session_id).await?))
}

/// GET `/projects/{project_id}/sessions/{session_id}/files/{*path}`
pub async fn download_file(
    State(state): State<AppState>,
    Path((project_id, session_id, path)): Path<(i64, String, String)>,
) -> Result<Response, AppError> {
    let (descriptor, file) = state.store.open_file(project_id, &session_id, &path).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&descriptor.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(descriptor.size));
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", descriptor.checksum)) {
        headers.insert(header::ETAG, etag);
    }
    Ok(response)
}

/// POST `/projects/{project_id}/sessions/{session_id}/finalize`
pub async fn finalize_session(
    State(state): State<AppState>,
    Path((project_id, session_id)): Path<(i64, String)>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.store.finalize(project_id, &session_id).await?))
}

/// POST `/projects/{project_id}/sessions/{session_id}/sync?background=&initiator=`
///
/// Foreground calls answer with the terminal metadata. Background calls
/// answer `202` with the `syncing` snapshot; poll the session for the
/// outcome.
pub async fn sync_session(
    State(state): State<AppState>,
    Path((project_id, session_id)): Path<(i64, String)>,
    Query(q): Query<SyncQuery>,
) -> Result<impl IntoResponse, AppError> {
    if q.background {
        let meta = state
            .sync
            .spawn_sync(project_id, &session_id, q.initiator)
            .await?;
        let status = if meta.status == SessionStatus::Syncing {
            StatusCode::ACCEPTED
        } else {
            StatusCode::OK
        };
        return Ok((status, Json(meta)));
    }

    let meta = state
        .sync
        .sync_session(project_id, &session_id, q.initiator)
        .await?;
    Ok((StatusCode::OK, Json(meta)))
}

/// GET `/projects/{project_id}/history`
pub async fn sync_history(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.store.list_history(project_id).await?))
}
