//! src/services/binding_store.rs
//!
//! Persistence for per-project repository bindings.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::models::project::{RepoStatus, RepositoryBinding};

const BINDING_COLUMNS: &str =
    "project_id, provider, repo_name, default_branch, status, last_sync_at, last_error, created_at";

#[derive(Clone)]
pub struct BindingStore {
    db: Arc<SqlitePool>,
}

impl BindingStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn get(&self, project_id: i64) -> Result<Option<RepositoryBinding>, sqlx::Error> {
        sqlx::query_as::<_, RepositoryBinding>(&format!(
            "SELECT {} FROM repository_bindings WHERE project_id = ?",
            BINDING_COLUMNS
        ))
        .bind(project_id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Return the existing binding, or insert one with the given fields.
    pub async fn get_or_create(
        &self,
        project_id: i64,
        provider: &str,
        repo_name: &str,
        default_branch: &str,
        status: RepoStatus,
    ) -> Result<RepositoryBinding, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO repository_bindings (project_id, provider, repo_name, default_branch, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (project_id) DO NOTHING
            "#,
        )
        .bind(project_id)
        .bind(provider)
        .bind(repo_name)
        .bind(default_branch)
        .bind(status)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        sqlx::query_as::<_, RepositoryBinding>(&format!(
            "SELECT {} FROM repository_bindings WHERE project_id = ?",
            BINDING_COLUMNS
        ))
        .bind(project_id)
        .fetch_one(&*self.db)
        .await
    }

    pub async fn set_status(
        &self,
        project_id: i64,
        status: RepoStatus,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE repository_bindings SET status = ?, last_error = ? WHERE project_id = ?")
            .bind(status)
            .bind(error)
            .bind(project_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Stamp the outcome of a sync run.
    pub async fn record_sync(
        &self,
        project_id: i64,
        status: RepoStatus,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE repository_bindings SET status = ?, last_sync_at = ?, last_error = ? WHERE project_id = ?",
        )
        .bind(status)
        .bind(at)
        .bind(error)
        .bind(project_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::services::project_service::ProjectService;
    use crate::test_support::{TestDb, new_project};

    #[tokio::test]
    async fn get_or_create_keeps_the_first_binding() {
        let db = TestDb::new().await;
        let projects = ProjectService::new(db.pool.clone(), db.store(), LedgerConfig::default());
        let project = projects.create_project(new_project(1, 10.0)).await.unwrap();
        let bindings = BindingStore::new(db.pool.clone());

        assert!(bindings.get(project.id).await.unwrap().is_none());
        let first = bindings
            .get_or_create(project.id, "github", "acme/one", "main", RepoStatus::Pending)
            .await
            .unwrap();
        let second = bindings
            .get_or_create(project.id, "github", "acme/two", "master", RepoStatus::Ready)
            .await
            .unwrap();
        assert_eq!(first.repo_name, "acme/one");
        assert_eq!(second.repo_name, "acme/one");
        assert_eq!(second.status, RepoStatus::Pending);

        let now = Utc::now();
        bindings
            .record_sync(project.id, RepoStatus::Ready, now, None)
            .await
            .unwrap();
        let stored = bindings.get(project.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RepoStatus::Ready);
        assert!(stored.last_sync_at.is_some());
    }
}
