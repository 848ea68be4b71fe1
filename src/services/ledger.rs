//! src/services/ledger.rs
//!
//! Ledger façade: one capability interface over the percentage ledger
//! and the shares ledger. Callers never pick a ledger themselves; the
//! façade dispatches on `Project::uses_shares_system()`.

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    config::LedgerConfig,
    errors::ErrorKind,
    models::{
        contribution::{FreeProposal, ReviewStatus, Task, TaskSolution},
        ledger::{
            Capacity, CapTableEntry, GrantRequest, HolderSnapshot, LedgerEventView, LedgerReport,
            Page, RevokeRequest, SourceKind,
        },
        project::Project,
    },
    services::{equity_ledger::EquityLedger, share_ledger::ShareLedger},
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(
        "insufficient equity in project {project_id}: requested {requested:.4}%, available {available:.4}%"
    )]
    InsufficientEquity {
        project_id: i64,
        requested: f64,
        available: f64,
    },
    #[error("project {0} not found")]
    ProjectNotFound(i64),
    #[error("{entity} {id} not found")]
    EntityNotFound { entity: &'static str, id: i64 },
    #[error("{source_type} {source_id} was already granted in project {project_id}")]
    AlreadyGranted {
        project_id: i64,
        source_type: SourceKind,
        source_id: i64,
    },
    #[error("project {project_id} is on the {actual} ledger, not the {expected} ledger")]
    LedgerMismatch {
        project_id: i64,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("invalid amount {0}: must be a positive, finite percentage no greater than 100")]
    InvalidAmount(f64),
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("user {user_id} holds {held:.4}% in project {project_id}; cannot remove {requested:.4}%")]
    NegativeBalance {
        project_id: i64,
        user_id: i64,
        held: f64,
        requested: f64,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InsufficientEquity { .. } => ErrorKind::InsufficientEquity,
            LedgerError::ProjectNotFound(_) | LedgerError::EntityNotFound { .. } => {
                ErrorKind::NotFound
            }
            LedgerError::AlreadyGranted { .. } | LedgerError::LedgerMismatch { .. } => {
                ErrorKind::Conflict
            }
            LedgerError::InvalidAmount(_)
            | LedgerError::InvalidSource(_)
            | LedgerError::NegativeBalance { .. } => ErrorKind::InvalidInput,
            LedgerError::Sqlx(_) => ErrorKind::Internal,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Operations both ledgers support. Amounts enter as percentages; the
/// shares ledger converts them with the project's `total_shares`.
#[async_trait]
pub trait Ledger: Send + Sync {
    fn pool(&self) -> &SqlitePool;

    /// Create the creator's opening holding. Idempotent.
    async fn initialize(&self, project: &Project) -> LedgerResult<HolderSnapshot>;

    /// Credit a holder after the capacity check. Everything happens in one
    /// transaction together with the audit event.
    async fn grant(&self, request: &GrantRequest) -> LedgerResult<HolderSnapshot>;

    async fn revoke(&self, request: &RevokeRequest) -> LedgerResult<HolderSnapshot>;

    async fn capacity(&self, project_id: i64) -> LedgerResult<Capacity>;

    async fn cap_table(&self, project_id: i64) -> LedgerResult<Vec<CapTableEntry>>;

    async fn user_total(&self, project_id: i64, user_id: i64)
    -> LedgerResult<Option<HolderSnapshot>>;

    async fn history(&self, project_id: i64, page: Page) -> LedgerResult<Vec<LedgerEventView>>;

    async fn validate(&self, project_id: i64) -> LedgerResult<LedgerReport>;

    /// Grant a task's reward to the author of an approved solution.
    /// `None` when the task carries no reward.
    async fn grant_task_completion(
        &self,
        solution: &TaskSolution,
        changed_by: Option<i64>,
    ) -> LedgerResult<Option<HolderSnapshot>> {
        match task_grant_request(self.pool(), solution, changed_by).await? {
            Some(request) => self.grant(&request).await.map(Some),
            None => Ok(None),
        }
    }

    async fn grant_free_proposal(
        &self,
        proposal: &FreeProposal,
        changed_by: Option<i64>,
    ) -> LedgerResult<HolderSnapshot> {
        let request = proposal_grant_request(proposal, changed_by)?;
        self.grant(&request).await
    }
}

/// Build the grant for an approved solution, or `None` for a zero reward.
pub async fn task_grant_request(
    pool: &SqlitePool,
    solution: &TaskSolution,
    changed_by: Option<i64>,
) -> LedgerResult<Option<GrantRequest>> {
    if solution.status != ReviewStatus::Approved {
        return Err(LedgerError::InvalidSource(format!(
            "solution {} is not approved",
            solution.id
        )));
    }
    let task = sqlx::query_as::<_, Task>(
        "SELECT id, project_id, title, equity_reward, created_at FROM tasks WHERE id = ?",
    )
    .bind(solution.task_id)
    .fetch_optional(pool)
    .await?
    .ok_or(LedgerError::EntityNotFound {
        entity: "task",
        id: solution.task_id,
    })?;

    if task.project_id != solution.project_id {
        return Err(LedgerError::InvalidSource(format!(
            "solution {} does not belong to the project of task {}",
            solution.id, task.id
        )));
    }
    if task.equity_reward <= 0.0 {
        info!(task_id = task.id, solution_id = solution.id, "task carries no equity reward");
        return Ok(None);
    }

    Ok(Some(GrantRequest {
        project_id: task.project_id,
        user_id: solution.submitted_by,
        percentage: task.equity_reward,
        source: SourceKind::TaskCompletion,
        source_id: Some(task.id),
        reason: Some(format!("Task completed: {}", task.title)),
        changed_by,
    }))
}

pub fn proposal_grant_request(
    proposal: &FreeProposal,
    changed_by: Option<i64>,
) -> LedgerResult<GrantRequest> {
    if proposal.status != ReviewStatus::Approved {
        return Err(LedgerError::InvalidSource(format!(
            "free proposal {} has not been accepted",
            proposal.id
        )));
    }
    Ok(GrantRequest {
        project_id: proposal.project_id,
        user_id: proposal.proposed_by,
        percentage: proposal.equity_requested,
        source: SourceKind::FreeProposal,
        source_id: Some(proposal.id),
        reason: Some(format!("Free proposal accepted: {}", proposal.title)),
        changed_by,
    })
}

/// Reject amounts that can never be valid grants or revocations.
pub fn check_amount(percentage: f64) -> LedgerResult<()> {
    if percentage.is_finite() && percentage > 0.0 && percentage <= 100.0 {
        Ok(())
    } else {
        Err(LedgerError::InvalidAmount(percentage))
    }
}

/// Load a project inside an open transaction.
pub async fn fetch_project(conn: &mut SqliteConnection, project_id: i64) -> LedgerResult<Project> {
    sqlx::query_as::<_, Project>(
        r#"
        SELECT id, name, creator_id, initial_creator_percentage, platform_fee, total_shares, created_at
        FROM projects WHERE id = ?
        "#,
    )
    .bind(project_id)
    .fetch_optional(conn)
    .await?
    .ok_or(LedgerError::ProjectNotFound(project_id))
}

/// Check that a grant's source points at a real entity of the project and
/// has not already been credited on `history_table`.
pub async fn check_source(
    conn: &mut SqliteConnection,
    history_table: &str,
    request: &GrantRequest,
) -> LedgerResult<()> {
    if !request.source.requires_entity() {
        return Ok(());
    }
    let source_id = request.source_id.ok_or_else(|| {
        LedgerError::InvalidSource(format!("{} grants need a source id", request.source))
    })?;

    let entity_table = match request.source {
        SourceKind::TaskCompletion => "tasks",
        _ => "free_proposals",
    };
    let exists: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT id FROM {} WHERE id = ? AND project_id = ?",
        entity_table
    ))
    .bind(source_id)
    .bind(request.project_id)
    .fetch_optional(&mut *conn)
    .await?;
    if exists.is_none() {
        return Err(LedgerError::InvalidSource(format!(
            "{} {} does not exist in project {}",
            request.source, source_id, request.project_id
        )));
    }

    let already: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT id FROM {} WHERE project_id = ? AND source_type = ? AND source_id = ? AND action = 'grant' LIMIT 1",
        history_table
    ))
    .bind(request.project_id)
    .bind(request.source)
    .bind(source_id)
    .fetch_optional(&mut *conn)
    .await?;
    if already.is_some() {
        return Err(LedgerError::AlreadyGranted {
            project_id: request.project_id,
            source_type: request.source,
            source_id,
        });
    }
    Ok(())
}

/// Summary of one project's conversion to the shares ledger.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationReport {
    pub project_id: i64,
    pub total_shares: i64,
    pub holders: usize,
    pub events: usize,
    /// False when the project was already on the shares ledger.
    pub migrated: bool,
}

/// Entry point used by handlers and the CLI.
#[derive(Clone)]
pub struct LedgerService {
    db: Arc<SqlitePool>,
    equity: EquityLedger,
    shares: ShareLedger,
}

impl LedgerService {
    pub fn new(db: Arc<SqlitePool>, config: LedgerConfig) -> Self {
        let write_lock = Arc::new(Mutex::new(()));
        Self {
            equity: EquityLedger::new(db.clone(), write_lock.clone()),
            shares: ShareLedger::new(db.clone(), write_lock, config.default_total_shares),
            db,
        }
    }

    pub fn equity(&self) -> &EquityLedger {
        &self.equity
    }

    pub fn shares(&self) -> &ShareLedger {
        &self.shares
    }

    /// The ledger that owns `project`.
    pub fn for_project(&self, project: &Project) -> &dyn Ledger {
        if project.uses_shares_system() {
            &self.shares
        } else {
            &self.equity
        }
    }

    pub async fn project(&self, project_id: i64) -> LedgerResult<Project> {
        let mut conn = self.db.acquire().await?;
        fetch_project(&mut conn, project_id).await
    }

    pub async fn initialize_project_ledger(&self, project_id: i64) -> LedgerResult<HolderSnapshot> {
        let project = self.project(project_id).await?;
        self.for_project(&project).initialize(&project).await
    }

    /// Credit the author of an approved solution with the task's reward.
    pub async fn grant_for_task(
        &self,
        solution_id: i64,
        changed_by: Option<i64>,
    ) -> LedgerResult<Option<HolderSnapshot>> {
        let solution = sqlx::query_as::<_, TaskSolution>(
            r#"
            SELECT id, task_id, project_id, submitted_by, status, created_at, reviewed_at
            FROM task_solutions WHERE id = ?
            "#,
        )
        .bind(solution_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(LedgerError::EntityNotFound {
            entity: "solution",
            id: solution_id,
        })?;

        let project = self.project(solution.project_id).await?;
        self.for_project(&project)
            .grant_task_completion(&solution, changed_by)
            .await
    }

    pub async fn grant_for_free_proposal(
        &self,
        proposal_id: i64,
        changed_by: Option<i64>,
    ) -> LedgerResult<HolderSnapshot> {
        let proposal = sqlx::query_as::<_, FreeProposal>(
            r#"
            SELECT id, project_id, proposed_by, title, equity_requested, status, created_at, reviewed_at
            FROM free_proposals WHERE id = ?
            "#,
        )
        .bind(proposal_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(LedgerError::EntityNotFound {
            entity: "free proposal",
            id: proposal_id,
        })?;

        let project = self.project(proposal.project_id).await?;
        self.for_project(&project)
            .grant_free_proposal(&proposal, changed_by)
            .await
    }

    pub async fn grant(&self, request: &GrantRequest) -> LedgerResult<HolderSnapshot> {
        let project = self.project(request.project_id).await?;
        self.for_project(&project).grant(request).await
    }

    pub async fn revoke(&self, request: &RevokeRequest) -> LedgerResult<HolderSnapshot> {
        let project = self.project(request.project_id).await?;
        self.for_project(&project).revoke(request).await
    }

    pub async fn get_cap_table(&self, project_id: i64) -> LedgerResult<Vec<CapTableEntry>> {
        let project = self.project(project_id).await?;
        self.for_project(&project).cap_table(project_id).await
    }

    pub async fn list_ledger_history(
        &self,
        project_id: i64,
        page: Page,
    ) -> LedgerResult<Vec<LedgerEventView>> {
        let project = self.project(project_id).await?;
        self.for_project(&project)
            .history(project_id, page.clamped())
            .await
    }

    pub async fn capacity(&self, project_id: i64) -> LedgerResult<Capacity> {
        let project = self.project(project_id).await?;
        self.for_project(&project).capacity(project_id).await
    }

    pub async fn user_total(
        &self,
        project_id: i64,
        user_id: i64,
    ) -> LedgerResult<Option<HolderSnapshot>> {
        let project = self.project(project_id).await?;
        self.for_project(&project)
            .user_total(project_id, user_id)
            .await
    }

    pub async fn validate(&self, project_id: i64) -> LedgerResult<LedgerReport> {
        let project = self.project(project_id).await?;
        let report = self.for_project(&project).validate(project_id).await?;
        if !report.valid {
            warn!(project_id, issues = ?report.issues, "ledger validation found issues");
        }
        Ok(report)
    }

    pub async fn migrate_to_shares(&self, project_id: i64) -> LedgerResult<MigrationReport> {
        self.shares.migrate_project(project_id).await
    }

    /// Move every percentage-ledger project onto the shares ledger.
    pub async fn migrate_all(&self) -> LedgerResult<Vec<MigrationReport>> {
        self.shares.migrate_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ledger::LedgerAction, project::NewProject};
    use crate::services::project_service::ProjectService;
    use crate::test_support::{TestDb, new_project};

    #[tokio::test]
    async fn facade_dispatches_on_total_shares() {
        let db = TestDb::new().await;
        let ledger = LedgerService::new(db.pool.clone(), LedgerConfig::default());
        let projects = ProjectService::new(db.pool.clone(), db.store(), LedgerConfig::default());

        let legacy = projects.create_project(new_project(7, 10.0)).await.unwrap();
        let modern = projects
            .create_project(NewProject {
                uses_shares: true,
                ..new_project(8, 10.0)
            })
            .await
            .unwrap();

        let a = ledger.initialize_project_ledger(legacy.id).await.unwrap();
        let b = ledger.initialize_project_ledger(modern.id).await.unwrap();
        assert!(a.shares.is_none());
        assert_eq!(b.shares.unwrap().hundredths(), 100_000);
        assert!((a.percentage - b.percentage).abs() < 1e-9);

        let history = ledger
            .list_ledger_history(modern.id, Page::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, LedgerAction::Initial);
        assert!(history[0].shares_after.is_some());
    }

    #[tokio::test]
    async fn task_grant_requires_approval_and_is_not_repeated() {
        let db = TestDb::new().await;
        let ledger = LedgerService::new(db.pool.clone(), LedgerConfig::default());
        let projects = ProjectService::new(db.pool.clone(), db.store(), LedgerConfig::default());

        let project = projects.create_project(new_project(1, 10.0)).await.unwrap();
        ledger.initialize_project_ledger(project.id).await.unwrap();
        let task = projects
            .create_task(project.id, "Build landing page", 2.5)
            .await
            .unwrap();
        let solution = projects.submit_solution(task.id, 42).await.unwrap();

        let err = ledger.grant_for_task(solution.id, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSource(_)));

        projects.approve_solution(solution.id).await.unwrap();
        let holder = ledger.grant_for_task(solution.id, Some(1)).await.unwrap().unwrap();
        assert_eq!(holder.user_id, 42);
        assert!((holder.percentage - 2.5).abs() < 1e-9);

        let err = ledger.grant_for_task(solution.id, Some(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let holder = ledger.user_total(project.id, 42).await.unwrap().unwrap();
        assert!((holder.percentage - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_reward_task_grants_nothing() {
        let db = TestDb::new().await;
        let ledger = LedgerService::new(db.pool.clone(), LedgerConfig::default());
        let projects = ProjectService::new(db.pool.clone(), db.store(), LedgerConfig::default());

        let project = projects.create_project(new_project(1, 10.0)).await.unwrap();
        let task = projects.create_task(project.id, "Say hi", 0.0).await.unwrap();
        let solution = projects.submit_solution(task.id, 42).await.unwrap();
        projects.approve_solution(solution.id).await.unwrap();

        assert!(ledger.grant_for_task(solution.id, None).await.unwrap().is_none());
        assert!(ledger
            .list_ledger_history(project.id, Page::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn free_proposal_grant_on_shares_project() {
        let db = TestDb::new().await;
        let ledger = LedgerService::new(db.pool.clone(), LedgerConfig::default());
        let projects = ProjectService::new(db.pool.clone(), db.store(), LedgerConfig::default());

        let project = projects
            .create_project(NewProject {
                uses_shares: true,
                ..new_project(1, 5.0)
            })
            .await
            .unwrap();
        ledger.initialize_project_ledger(project.id).await.unwrap();
        let proposal = projects
            .create_free_proposal(project.id, 9, "Logo redesign", 1.25)
            .await
            .unwrap();
        projects.accept_free_proposal(proposal.id).await.unwrap();

        let holder = ledger
            .grant_for_free_proposal(proposal.id, Some(1))
            .await
            .unwrap();
        assert_eq!(holder.shares.unwrap().hundredths(), 12_500);
        assert!(holder
            .earned_from
            .contains(&format!("free_proposal_{}", proposal.id)));

        let capacity = ledger.capacity(project.id).await.unwrap();
        assert!((capacity.distributed - 6.25).abs() < 1e-9);
        assert!((capacity.available - 92.75).abs() < 1e-9);
    }

    #[test]
    fn amounts_must_be_positive_and_finite() {
        assert!(check_amount(0.5).is_ok());
        assert!(check_amount(100.0).is_ok());
        assert!(check_amount(0.0).is_err());
        assert!(check_amount(-1.0).is_err());
        assert!(check_amount(f64::NAN).is_err());
        assert!(check_amount(100.5).is_err());
    }
}
