//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness, no I/O
//! - GET /readyz   -> SQLite round trip plus a probe file in the workspace root

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// 200 when every check passes, 503 otherwise. Each check is reported in
/// the body so an operator can see which dependency is down.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    let workspace = probe_workspace(&state.store.root).await;

    let ready = sqlite.ok && workspace.ok;
    let mut checks = BTreeMap::new();
    checks.insert("sqlite", sqlite);
    checks.insert("workspace", workspace);

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" },
        checks,
    };
    (status, Json(body))
}

/// Write, read back and delete a probe file under `root`.
async fn probe_workspace(root: &Path) -> CheckStatus {
    let probe = root.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&probe, b"readyz").await {
        return CheckStatus::failed(format!("could not write probe file: {}", e));
    }

    let check = match fs::read(&probe).await {
        Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
        Ok(_) => CheckStatus::failed("probe file content mismatch".to_string()),
        Err(e) => CheckStatus::failed(format!("could not read probe file: {}", e)),
    };
    match fs::remove_file(&probe).await {
        Err(e) if check.ok => CheckStatus {
            ok: true,
            error: Some(format!("could not remove probe file: {}", e)),
        },
        _ => check,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn workspace_probe_cleans_up() {
        let dir = TempDir::new().unwrap();
        let check = probe_workspace(dir.path()).await;
        assert!(check.ok);
        assert!(check.error.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_workspace_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let check = probe_workspace(&dir.path().join("absent")).await;
        assert!(!check.ok);
    }
}
