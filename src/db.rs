//! SQLite pool setup and embedded migrations.

use anyhow::{Context, Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, sync::Arc, time::Duration};

/// Open the pool, creating the database file (and its directory) if needed.
pub async fn connect(database_url: &str) -> Result<Arc<SqlitePool>> {
    tracing::debug!("Connecting using raw URL => {}", database_url);

    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {:?}", parent))?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing DATABASE_URL `{}`", database_url))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {}", database_url))?;
    Ok(Arc::new(pool))
}

/// Apply `migrations/*.sql`, embedded at compile time.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(db)
        .await
        .context("running migrations")?;
    Ok(())
}
