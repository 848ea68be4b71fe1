use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use std::fmt;

use crate::services::{
    ledger::LedgerError, path_guard::GuardError, project_service::ProjectError,
    session_store::SessionError, sync_engine::SyncError,
};

/// Stable identities for every failure the core can surface.
///
/// The string form is what appears in logs and in the `kind` field of
/// error bodies; it must not change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InsufficientEquity,
    InvalidPath,
    SessionConflict,
    RemoteUnavailable,
    RemoteDenied,
    Timeout,
    Corruption,
    Configuration,
    NotFound,
    Conflict,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InsufficientEquity => "InsufficientEquity",
            ErrorKind::InvalidPath => "InvalidPath",
            ErrorKind::SessionConflict => "SessionConflict",
            ErrorKind::RemoteUnavailable => "RemoteUnavailable",
            ErrorKind::RemoteDenied => "RemoteDenied",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Corruption => "Corruption",
            ErrorKind::Configuration => "Configuration",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Transient kinds may succeed when retried without operator action.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::RemoteUnavailable | ErrorKind::Timeout)
    }

    /// HTTP status a caller would normally pick for this kind.
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InsufficientEquity => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::InvalidPath | ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::SessionConflict | ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RemoteUnavailable | ErrorKind::RemoteDenied => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Configuration => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Corruption | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    /// Create a new AppError from a kind, using that kind's default status.
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            status: kind.status(),
            kind,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(kind = %self.kind, "{}", self.message);
        }
        let body = Json(json!({
            "error": self.message,
            "kind": self.kind.as_str(),
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<GuardError> for AppError {
    fn from(err: GuardError) -> Self {
        AppError::new(ErrorKind::InvalidPath, err.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        AppError::new(err.kind(), err.to_string())
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError::new(err.kind(), err.to_string())
    }
}

impl From<ProjectError> for AppError {
    fn from(err: ProjectError) -> Self {
        AppError::new(err.kind(), err.to_string())
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        AppError::new(err.kind(), err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::not_found("record not found"),
            other => AppError::internal(other.to_string()),
        }
    }
}
