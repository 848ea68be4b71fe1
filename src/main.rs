use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod test_support;

use config::{AppConfig, RunMode};
use services::ledger::LedgerService;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting kickthis-core with config: {:?}", cfg);

    // --- Ensure workspace root exists ---
    if !cfg.workspace_root.exists() {
        fs::create_dir_all(&cfg.workspace_root).with_context(|| {
            format!("creating workspace root {}", cfg.workspace_root.display())
        })?;
        tracing::info!("Created workspace root at {}", cfg.workspace_root.display());
    }

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url).await?;
    db::run_migrations(&db).await?;

    match mode {
        RunMode::Migrate => {
            tracing::info!("Database migration complete.");
            return Ok(());
        }
        RunMode::MigrateShares => {
            let ledger = LedgerService::new(db.clone(), cfg.ledger.clone());
            let reports = ledger.migrate_all().await?;
            let migrated = reports.iter().filter(|r| r.migrated).count();
            tracing::info!(
                projects = reports.len(),
                migrated,
                "Shares migration complete."
            );
            return Ok(());
        }
        RunMode::Serve => {}
    }

    // --- Build router ---
    let max_upload = usize::try_from(cfg.limits.max_zip_bytes.max(cfg.limits.max_file_bytes))
        .unwrap_or(usize::MAX);
    let app: Router = routes::routes::routes(max_upload).with_state(AppState::new(db, &cfg));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
