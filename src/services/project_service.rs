//! src/services/project_service.rs
//!
//! Project lifecycle plus the contribution records (tasks, solutions, free
//! proposals) the ledgers read when resolving a grant.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::LedgerConfig,
    errors::ErrorKind,
    models::{
        contribution::{FreeProposal, ReviewStatus, Task, TaskSolution},
        project::{NewProject, Project},
    },
    services::session_store::{SessionError, SessionStore},
};

const PROJECT_COLUMNS: &str =
    "id, name, creator_id, initial_creator_percentage, platform_fee, total_shares, created_at";
const SOLUTION_COLUMNS: &str =
    "id, task_id, project_id, submitted_by, status, created_at, reviewed_at";
const PROPOSAL_COLUMNS: &str =
    "id, project_id, proposed_by, title, equity_requested, status, created_at, reviewed_at";

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project {0} not found")]
    NotFound(i64),
    #[error("{entity} {id} not found")]
    EntityNotFound { entity: &'static str, id: i64 },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{entity} {id} is already {status:?}")]
    AlreadyReviewed {
        entity: &'static str,
        id: i64,
        status: ReviewStatus,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl ProjectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProjectError::NotFound(_) | ProjectError::EntityNotFound { .. } => ErrorKind::NotFound,
            ProjectError::InvalidInput(_) => ErrorKind::InvalidInput,
            ProjectError::AlreadyReviewed { .. } => ErrorKind::Conflict,
            ProjectError::Session(err) => err.kind(),
            ProjectError::Sqlx(_) => ErrorKind::Internal,
        }
    }
}

pub type ProjectResult<T> = Result<T, ProjectError>;

#[derive(Clone)]
pub struct ProjectService {
    db: Arc<SqlitePool>,
    store: SessionStore,
    config: LedgerConfig,
}

impl ProjectService {
    pub fn new(db: Arc<SqlitePool>, store: SessionStore, config: LedgerConfig) -> Self {
        Self { db, store, config }
    }

    /// Insert a project. With `uses_shares` the project starts on the
    /// shares ledger with the configured default share count.
    pub async fn create_project(&self, input: NewProject) -> ProjectResult<Project> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(ProjectError::InvalidInput("project name is required".into()));
        }
        if let Some(pct) = input.initial_creator_percentage {
            if !(0.0..=100.0).contains(&pct) {
                return Err(ProjectError::InvalidInput(format!(
                    "creator percentage {} is outside 0-100",
                    pct
                )));
            }
        }
        let platform_fee = input.platform_fee.unwrap_or(self.config.platform_fee);
        if !(0.0..100.0).contains(&platform_fee) {
            return Err(ProjectError::InvalidInput(format!(
                "platform fee {} is outside [0, 100)",
                platform_fee
            )));
        }
        let total_shares = input.uses_shares.then_some(self.config.default_total_shares);

        let project = sqlx::query_as::<_, Project>(&format!(
            r#"
            INSERT INTO projects (name, creator_id, initial_creator_percentage, platform_fee, total_shares, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            PROJECT_COLUMNS
        ))
        .bind(name)
        .bind(input.creator_id)
        .bind(input.initial_creator_percentage)
        .bind(platform_fee)
        .bind(total_shares)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        info!(
            project_id = project.id,
            creator_id = project.creator_id,
            shares = project.uses_shares_system(),
            "created project"
        );
        Ok(project)
    }

    pub async fn get_project(&self, project_id: i64) -> ProjectResult<Project> {
        sqlx::query_as::<_, Project>(&format!(
            "SELECT {} FROM projects WHERE id = ?",
            PROJECT_COLUMNS
        ))
        .bind(project_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(ProjectError::NotFound(project_id))
    }

    /// Delete the project row (the database cascades to every ledger,
    /// contribution and binding row) and then its workspace directory.
    pub async fn delete_project(&self, project_id: i64) -> ProjectResult<()> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project_id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ProjectError::NotFound(project_id));
        }

        if let Err(err) = self.store.remove_project(project_id).await {
            warn!(project_id, error = %err, "project row deleted but workspace removal failed");
            return Err(err.into());
        }
        info!(project_id, "deleted project");
        Ok(())
    }

    pub async fn create_task(
        &self,
        project_id: i64,
        title: &str,
        equity_reward: f64,
    ) -> ProjectResult<Task> {
        if !equity_reward.is_finite() || !(0.0..=100.0).contains(&equity_reward) {
            return Err(ProjectError::InvalidInput(format!(
                "equity reward {} is outside 0-100",
                equity_reward
            )));
        }
        self.get_project(project_id).await?;

        let task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (project_id, title, equity_reward, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, project_id, title, equity_reward, created_at
            "#,
        )
        .bind(project_id)
        .bind(title)
        .bind(equity_reward)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;
        Ok(task)
    }

    pub async fn submit_solution(&self, task_id: i64, submitted_by: i64) -> ProjectResult<TaskSolution> {
        let project_id: i64 = sqlx::query_scalar("SELECT project_id FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(ProjectError::EntityNotFound {
                entity: "task",
                id: task_id,
            })?;

        let solution = sqlx::query_as::<_, TaskSolution>(&format!(
            r#"
            INSERT INTO task_solutions (task_id, project_id, submitted_by, status, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            SOLUTION_COLUMNS
        ))
        .bind(task_id)
        .bind(project_id)
        .bind(submitted_by)
        .bind(ReviewStatus::Pending)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;
        Ok(solution)
    }

    pub async fn get_solution(&self, solution_id: i64) -> ProjectResult<TaskSolution> {
        sqlx::query_as::<_, TaskSolution>(&format!(
            "SELECT {} FROM task_solutions WHERE id = ?",
            SOLUTION_COLUMNS
        ))
        .bind(solution_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(ProjectError::EntityNotFound {
            entity: "solution",
            id: solution_id,
        })
    }

    pub async fn approve_solution(&self, solution_id: i64) -> ProjectResult<TaskSolution> {
        let current = self.get_solution(solution_id).await?;
        if current.status != ReviewStatus::Pending {
            return Err(ProjectError::AlreadyReviewed {
                entity: "solution",
                id: solution_id,
                status: current.status,
            });
        }

        let solution = sqlx::query_as::<_, TaskSolution>(&format!(
            "UPDATE task_solutions SET status = ?, reviewed_at = ? WHERE id = ? RETURNING {}",
            SOLUTION_COLUMNS
        ))
        .bind(ReviewStatus::Approved)
        .bind(Utc::now())
        .bind(solution_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(solution)
    }

    pub async fn create_free_proposal(
        &self,
        project_id: i64,
        proposed_by: i64,
        title: &str,
        equity_requested: f64,
    ) -> ProjectResult<FreeProposal> {
        if !equity_requested.is_finite() || equity_requested <= 0.0 || equity_requested > 100.0 {
            return Err(ProjectError::InvalidInput(format!(
                "requested equity {} must be in (0, 100]",
                equity_requested
            )));
        }
        self.get_project(project_id).await?;

        let proposal = sqlx::query_as::<_, FreeProposal>(&format!(
            r#"
            INSERT INTO free_proposals (project_id, proposed_by, title, equity_requested, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            PROPOSAL_COLUMNS
        ))
        .bind(project_id)
        .bind(proposed_by)
        .bind(title)
        .bind(equity_requested)
        .bind(ReviewStatus::Pending)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;
        Ok(proposal)
    }

    pub async fn get_free_proposal(&self, proposal_id: i64) -> ProjectResult<FreeProposal> {
        sqlx::query_as::<_, FreeProposal>(&format!(
            "SELECT {} FROM free_proposals WHERE id = ?",
            PROPOSAL_COLUMNS
        ))
        .bind(proposal_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(ProjectError::EntityNotFound {
            entity: "free proposal",
            id: proposal_id,
        })
    }

    pub async fn accept_free_proposal(&self, proposal_id: i64) -> ProjectResult<FreeProposal> {
        let current = self.get_free_proposal(proposal_id).await?;
        if current.status != ReviewStatus::Pending {
            return Err(ProjectError::AlreadyReviewed {
                entity: "free proposal",
                id: proposal_id,
                status: current.status,
            });
        }

        let proposal = sqlx::query_as::<_, FreeProposal>(&format!(
            "UPDATE free_proposals SET status = ?, reviewed_at = ? WHERE id = ? RETURNING {}",
            PROPOSAL_COLUMNS
        ))
        .bind(ReviewStatus::Approved)
        .bind(Utc::now())
        .bind(proposal_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(proposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::SessionKind;
    use crate::test_support::{TestDb, new_project};

    fn service(db: &TestDb) -> ProjectService {
        ProjectService::new(db.pool.clone(), db.store(), LedgerConfig::default())
    }

    #[tokio::test]
    async fn create_applies_configured_defaults() {
        let db = TestDb::new().await;
        let projects = service(&db);

        let project = projects
            .create_project(NewProject {
                platform_fee: None,
                ..new_project(3, 10.0)
            })
            .await
            .unwrap();
        assert_eq!(project.platform_fee, 1.0);
        assert_eq!(project.total_shares, None);

        let shares = projects
            .create_project(NewProject {
                uses_shares: true,
                ..new_project(3, 10.0)
            })
            .await
            .unwrap();
        assert_eq!(shares.total_shares, Some(10_000));
    }

    #[tokio::test]
    async fn create_rejects_out_of_range_percentages() {
        let db = TestDb::new().await;
        let projects = service(&db);

        let err = projects
            .create_project(new_project(3, 120.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = projects
            .create_project(NewProject {
                platform_fee: Some(100.0),
                ..new_project(3, 10.0)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn approval_happens_once() {
        let db = TestDb::new().await;
        let projects = service(&db);
        let project = projects.create_project(new_project(3, 10.0)).await.unwrap();
        let task = projects.create_task(project.id, "Write docs", 1.0).await.unwrap();
        let solution = projects.submit_solution(task.id, 5).await.unwrap();
        assert_eq!(solution.status, ReviewStatus::Pending);
        assert_eq!(solution.project_id, project.id);

        let approved = projects.approve_solution(solution.id).await.unwrap();
        assert_eq!(approved.status, ReviewStatus::Approved);
        assert!(approved.reviewed_at.is_some());

        let err = projects.approve_solution(solution.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn delete_cascades_rows_and_workspace() {
        let db = TestDb::new().await;
        let projects = service(&db);
        let store = db.store();
        let project = projects.create_project(new_project(3, 10.0)).await.unwrap();
        projects.create_task(project.id, "Write docs", 1.0).await.unwrap();
        store
            .create_session(project.id, 3, SessionKind::Zip)
            .await
            .unwrap();
        assert!(store.project_root(project.id).exists());

        projects.delete_project(project.id).await.unwrap();

        assert!(!store.project_root(project.id).exists());
        let tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE project_id = ?")
            .bind(project.id)
            .fetch_one(&*db.pool)
            .await
            .unwrap();
        assert_eq!(tasks, 0);
        assert!(matches!(
            projects.get_project(project.id).await,
            Err(ProjectError::NotFound(_))
        ));
        assert!(matches!(
            projects.delete_project(project.id).await,
            Err(ProjectError::NotFound(_))
        ));
    }
}
