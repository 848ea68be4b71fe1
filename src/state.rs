//! Shared state handed to every handler.

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::{
    config::AppConfig,
    services::{
        ledger::LedgerService, project_service::ProjectService, session_store::SessionStore,
        sync_engine::SyncEngine,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub store: SessionStore,
    pub projects: ProjectService,
    pub ledger: LedgerService,
    pub sync: SyncEngine,
}

impl AppState {
    pub fn new(db: Arc<SqlitePool>, cfg: &AppConfig) -> Self {
        let store = SessionStore::new(cfg.workspace_root.clone(), cfg.limits.clone());
        Self {
            projects: ProjectService::new(db.clone(), store.clone(), cfg.ledger.clone()),
            ledger: LedgerService::new(db.clone(), cfg.ledger.clone()),
            sync: SyncEngine::new(db.clone(), store.clone(), cfg.remote.clone()),
            store,
            db,
        }
    }
}
