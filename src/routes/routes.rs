//! Route table for the JSON surface over the core.
//!
//! ## Structure
//! - **Health**: `GET /healthz`, `GET /readyz`
//! - **Projects**
//!   - `POST   /projects` create, `GET|DELETE /projects/{project_id}`
//!   - `POST   /projects/{project_id}/tasks`, `POST /tasks/{task_id}/solutions`
//!   - `POST   /solutions/{solution_id}/approve` approve + grant
//!   - `POST   /projects/{project_id}/proposals`, `POST /proposals/{proposal_id}/accept`
//! - **Ledger** under `/projects/{project_id}/ledger`
//!   - `POST initialize`, `GET cap-table`, `GET history`, `GET capacity`
//!   - `GET holders/{user_id}`, `POST grants`, `POST revocations`
//!   - `GET validate`, `POST migrate-shares`
//! - **Sessions** under `/projects/{project_id}/sessions`
//!   - `POST` create, `GET` list, `GET|DELETE /{session_id}`
//!   - `POST /{session_id}/archive` multipart ZIP
//!   - `GET /{session_id}/files`, `PUT|GET /{session_id}/files/{*path}`
//!   - `POST /{session_id}/finalize`, `POST /{session_id}/sync`
//! - **Sync history**: `GET /projects/{project_id}/history`
//!
//! The wildcard `*path` allows nested paths like `src/app/main.py`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        ledger_handlers, project_handlers, session_handlers,
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `max_upload_bytes` bounds request bodies on the
/// upload routes; every other route keeps axum's default limit.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    let uploads = Router::new()
        .route(
            "/projects/{project_id}/sessions/{session_id}/archive",
            post(session_handlers::upload_archive),
        )
        .route(
            "/projects/{project_id}/sessions/{session_id}/files/{*path}",
            get(session_handlers::download_file).put(session_handlers::put_file),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // projects and contributions
        .route("/projects", post(project_handlers::create_project))
        .route(
            "/projects/{project_id}",
            get(project_handlers::get_project).delete(project_handlers::delete_project),
        )
        .route(
            "/projects/{project_id}/tasks",
            post(project_handlers::create_task),
        )
        .route(
            "/tasks/{task_id}/solutions",
            post(project_handlers::submit_solution),
        )
        .route(
            "/solutions/{solution_id}/approve",
            post(project_handlers::approve_solution),
        )
        .route(
            "/projects/{project_id}/proposals",
            post(project_handlers::create_proposal),
        )
        .route(
            "/proposals/{proposal_id}/accept",
            post(project_handlers::accept_proposal),
        )
        // ledger
        .route(
            "/projects/{project_id}/ledger/initialize",
            post(ledger_handlers::initialize_ledger),
        )
        .route(
            "/projects/{project_id}/ledger/cap-table",
            get(ledger_handlers::cap_table),
        )
        .route(
            "/projects/{project_id}/ledger/history",
            get(ledger_handlers::ledger_history),
        )
        .route(
            "/projects/{project_id}/ledger/capacity",
            get(ledger_handlers::capacity),
        )
        .route(
            "/projects/{project_id}/ledger/holders/{user_id}",
            get(ledger_handlers::holder),
        )
        .route(
            "/projects/{project_id}/ledger/grants",
            post(ledger_handlers::grant),
        )
        .route(
            "/projects/{project_id}/ledger/revocations",
            post(ledger_handlers::revoke),
        )
        .route(
            "/projects/{project_id}/ledger/validate",
            get(ledger_handlers::validate),
        )
        .route(
            "/projects/{project_id}/ledger/migrate-shares",
            post(ledger_handlers::migrate_shares),
        )
        // upload sessions and sync
        .route(
            "/projects/{project_id}/sessions",
            post(session_handlers::create_session).get(session_handlers::list_sessions),
        )
        .route(
            "/projects/{project_id}/sessions/{session_id}",
            get(session_handlers::get_session).delete(session_handlers::cancel_session),
        )
        .route(
            "/projects/{project_id}/sessions/{session_id}/files",
            get(session_handlers::list_files),
        )
        .route(
            "/projects/{project_id}/sessions/{session_id}/finalize",
            post(session_handlers::finalize_session),
        )
        .route(
            "/projects/{project_id}/sessions/{session_id}/sync",
            post(session_handlers::sync_session),
        )
        .route(
            "/projects/{project_id}/history",
            get(session_handlers::sync_history),
        )
        .merge(uploads)
}
