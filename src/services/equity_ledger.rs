//! src/services/equity_ledger.rs
//!
//! Percentage ledger for projects that have not moved to shares.
//!
//! Every mutation goes through [`apply_change`], which upserts the holder
//! and appends the matching `equity_history` row inside the caller's
//! transaction. Writers are serialized by the ledger-wide write lock so a
//! capacity check and the grant it guards cannot interleave with another
//! grant.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    models::{
        equity::{EquityEvent, EquityHolder},
        ledger::{
            CAPACITY_EPSILON, Capacity, CapTableEntry, EarnSources, GrantRequest, HolderSnapshot,
            LedgerAction, LedgerEventView, LedgerReport, PERCENT_TOLERANCE, Page, RevokeRequest,
            SourceKind, round_display,
        },
        project::Project,
    },
    services::ledger::{
        Ledger, LedgerError, LedgerResult, check_amount, check_source, fetch_project,
    },
};

const HOLDER_COLUMNS: &str = "id, project_id, user_id, percentage, earned_from, created_at, updated_at";
const EVENT_COLUMNS: &str = "id, project_id, user_id, action, equity_change, equity_before, equity_after, reason, source_type, source_id, changed_by, created_at";

/// One balance change plus the audit fields recorded with it.
struct Change<'a> {
    project_id: i64,
    user_id: i64,
    action: LedgerAction,
    delta: f64,
    reason: &'a str,
    source: SourceKind,
    source_id: Option<i64>,
    changed_by: Option<i64>,
    /// Earn-source tag appended to the holder, if any.
    tag: Option<String>,
}

#[derive(Clone)]
pub struct EquityLedger {
    db: Arc<SqlitePool>,
    write_lock: Arc<Mutex<()>>,
}

impl EquityLedger {
    pub fn new(db: Arc<SqlitePool>, write_lock: Arc<Mutex<()>>) -> Self {
        Self { db, write_lock }
    }

    /// Create the creator's opening holding at the project's creator
    /// percentage. A second call returns the existing holder.
    pub async fn initialize_creator(&self, project: &Project) -> LedgerResult<EquityHolder> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;
        let project = fetch_project(&mut tx, project.id).await?;
        ensure_percentage_ledger(&project)?;

        let initialized: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM equity_history WHERE project_id = ? AND action = 'initial' LIMIT 1",
        )
        .bind(project.id)
        .fetch_optional(&mut *tx)
        .await?;
        if initialized.is_some() {
            if let Some(holder) = fetch_holder(&mut tx, project.id, project.creator_id).await? {
                warn!(
                    project_id = project.id,
                    user_id = project.creator_id,
                    "creator equity already initialized"
                );
                return Ok(holder);
            }
        }

        let (percentage, defaulted) = project.creator_percentage();
        let distributable = project.distributable_percentage();
        if !(0.0..=100.0).contains(&percentage) {
            return Err(LedgerError::InvalidAmount(percentage));
        }
        if percentage > distributable + CAPACITY_EPSILON {
            return Err(LedgerError::InsufficientEquity {
                project_id: project.id,
                requested: percentage,
                available: distributable,
            });
        }

        let reason = if defaulted {
            format!(
                "Initial creator equity ({}% default applied; project did not set a creator percentage)",
                percentage
            )
        } else {
            "Initial creator equity".to_string()
        };
        let holder = apply_change(
            &mut tx,
            &Change {
                project_id: project.id,
                user_id: project.creator_id,
                action: LedgerAction::Initial,
                delta: percentage,
                reason: &reason,
                source: SourceKind::Initial,
                source_id: None,
                changed_by: None,
                tag: Some(SourceKind::Initial.earn_tag(None)),
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            project_id = project.id,
            user_id = project.creator_id,
            percentage,
            defaulted,
            "initialized creator equity"
        );
        Ok(holder)
    }

    /// Credit `request.percentage` to a holder after the capacity check.
    pub async fn grant_equity(&self, request: &GrantRequest) -> LedgerResult<EquityHolder> {
        check_amount(request.percentage)?;
        if request.source == SourceKind::Initial {
            return Err(LedgerError::InvalidSource(
                "initial holdings are created by ledger initialization".into(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;
        let project = fetch_project(&mut tx, request.project_id).await?;
        ensure_percentage_ledger(&project)?;
        check_source(&mut tx, "equity_history", request).await?;

        let distributed = distributed(&mut tx, project.id).await?;
        let available = project.distributable_percentage() - distributed;
        if request.percentage > available + CAPACITY_EPSILON {
            warn!(
                project_id = project.id,
                user_id = request.user_id,
                requested = request.percentage,
                available,
                "grant refused: insufficient equity"
            );
            return Err(LedgerError::InsufficientEquity {
                project_id: project.id,
                requested: request.percentage,
                available: available.max(0.0),
            });
        }

        let reason = request
            .reason
            .clone()
            .unwrap_or_else(|| format!("Equity grant ({})", request.source));
        let holder = apply_change(
            &mut tx,
            &Change {
                project_id: project.id,
                user_id: request.user_id,
                action: LedgerAction::Grant,
                delta: request.percentage,
                reason: &reason,
                source: request.source,
                source_id: request.source_id,
                changed_by: request.changed_by,
                tag: Some(request.source.earn_tag(request.source_id)),
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            project_id = project.id,
            user_id = request.user_id,
            percentage = request.percentage,
            source = %request.source,
            source_id = ?request.source_id,
            "granted equity"
        );
        Ok(holder)
    }

    /// Remove equity from a holder. Never drives a balance below zero.
    pub async fn revoke_equity(&self, request: &RevokeRequest) -> LedgerResult<EquityHolder> {
        check_amount(request.percentage)?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;
        let project = fetch_project(&mut tx, request.project_id).await?;
        ensure_percentage_ledger(&project)?;

        let held = fetch_holder(&mut tx, project.id, request.user_id)
            .await?
            .map(|h| h.percentage)
            .unwrap_or(0.0);
        if request.percentage > held + PERCENT_TOLERANCE {
            return Err(LedgerError::NegativeBalance {
                project_id: project.id,
                user_id: request.user_id,
                held,
                requested: request.percentage,
            });
        }

        let reason = revoke_reason(&request.reason);
        let holder = apply_change(
            &mut tx,
            &Change {
                project_id: project.id,
                user_id: request.user_id,
                action: LedgerAction::Revoke,
                delta: -request.percentage.min(held),
                reason: &reason,
                source: SourceKind::Manual,
                source_id: None,
                changed_by: request.changed_by,
                tag: None,
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            project_id = project.id,
            user_id = request.user_id,
            percentage = request.percentage,
            "revoked equity"
        );
        Ok(holder)
    }

    /// Whether `delta` more percent fits under the distributable ceiling.
    pub async fn can_distribute(&self, project_id: i64, delta: f64) -> LedgerResult<bool> {
        Ok(delta <= self.available(project_id).await? + CAPACITY_EPSILON)
    }

    pub async fn available(&self, project_id: i64) -> LedgerResult<f64> {
        let mut conn = self.db.acquire().await?;
        let project = fetch_project(&mut conn, project_id).await?;
        let distributed = distributed(&mut conn, project_id).await?;
        Ok(project.distributable_percentage() - distributed)
    }

    /// Holders ordered by percentage, largest first.
    pub async fn get_cap_table(&self, project_id: i64) -> LedgerResult<Vec<EquityHolder>> {
        let holders = sqlx::query_as::<_, EquityHolder>(&format!(
            "SELECT {} FROM project_equity WHERE project_id = ? ORDER BY percentage DESC, created_at ASC, id ASC",
            HOLDER_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(holders)
    }

    pub async fn get_user_equity(
        &self,
        project_id: i64,
        user_id: i64,
    ) -> LedgerResult<Option<EquityHolder>> {
        let mut conn = self.db.acquire().await?;
        fetch_holder(&mut conn, project_id, user_id).await
    }

    /// Events newest first.
    pub async fn get_history(&self, project_id: i64, page: Page) -> LedgerResult<Vec<EquityEvent>> {
        let page = page.clamped();
        let events = sqlx::query_as::<_, EquityEvent>(&format!(
            "SELECT {} FROM equity_history WHERE project_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
            EVENT_COLUMNS
        ))
        .bind(project_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&*self.db)
        .await?;
        Ok(events)
    }

    /// Read-only sanity sweep. Reports problems; never repairs them.
    pub async fn validate_and_fix(&self, project_id: i64) -> LedgerResult<LedgerReport> {
        let mut conn = self.db.acquire().await?;
        let project = fetch_project(&mut conn, project_id).await?;
        let mut issues = Vec::new();
        if project.uses_shares_system() {
            issues.push(format!(
                "project {} has moved to the shares ledger; percentage rows are historical",
                project_id
            ));
        }

        let holders = sqlx::query_as::<_, EquityHolder>(&format!(
            "SELECT {} FROM project_equity WHERE project_id = ?",
            HOLDER_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await?;
        let events = sqlx::query_as::<_, EquityEvent>(&format!(
            "SELECT {} FROM equity_history WHERE project_id = ? ORDER BY id ASC",
            EVENT_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await?;

        let total: f64 = holders.iter().map(|h| h.percentage).sum();
        if total + project.platform_fee > 100.0 + PERCENT_TOLERANCE {
            issues.push(format!(
                "holders own {:.4}% plus a {:.2}% platform fee, exceeding 100%",
                total, project.platform_fee
            ));
        }

        for holder in holders.iter().filter(|h| h.percentage < 0.0) {
            issues.push(format!(
                "user {} has a negative balance of {:.4}%",
                holder.user_id, holder.percentage
            ));
        }

        let mut replayed: HashMap<i64, f64> = HashMap::new();
        for event in &events {
            *replayed.entry(event.user_id).or_default() += event.equity_change;
            if (event.equity_before + event.equity_change - event.equity_after).abs()
                > PERCENT_TOLERANCE
            {
                issues.push(format!(
                    "event {} does not add up: {:.4} + {:.4} != {:.4}",
                    event.id, event.equity_before, event.equity_change, event.equity_after
                ));
            }
        }
        for holder in &holders {
            let expected = replayed.remove(&holder.user_id).unwrap_or(0.0);
            if (expected - holder.percentage).abs() > PERCENT_TOLERANCE {
                issues.push(format!(
                    "user {} holds {:.4}% but history accounts for {:.4}%",
                    holder.user_id, holder.percentage, expected
                ));
            }
        }
        for (user_id, expected) in replayed {
            if expected.abs() > PERCENT_TOLERANCE {
                issues.push(format!(
                    "history credits user {} with {:.4}% but no holder exists",
                    user_id, expected
                ));
            }
        }

        for event in events.iter().filter(|e| e.source_type.requires_entity()) {
            if !source_exists(&mut conn, project_id, event.source_type, event.source_id).await? {
                issues.push(format!(
                    "event {} references missing {} {:?}",
                    event.id, event.source_type, event.source_id
                ));
            }
        }

        Ok(LedgerReport {
            valid: issues.is_empty(),
            issues,
            total,
            available: project.distributable_percentage() - total,
            total_shares: None,
        })
    }
}

#[async_trait]
impl Ledger for EquityLedger {
    fn pool(&self) -> &SqlitePool {
        self.db.as_ref()
    }

    async fn initialize(&self, project: &Project) -> LedgerResult<HolderSnapshot> {
        self.initialize_creator(project).await.map(snapshot)
    }

    async fn grant(&self, request: &GrantRequest) -> LedgerResult<HolderSnapshot> {
        self.grant_equity(request).await.map(snapshot)
    }

    async fn revoke(&self, request: &RevokeRequest) -> LedgerResult<HolderSnapshot> {
        self.revoke_equity(request).await.map(snapshot)
    }

    async fn capacity(&self, project_id: i64) -> LedgerResult<Capacity> {
        let mut conn = self.db.acquire().await?;
        let project = fetch_project(&mut conn, project_id).await?;
        let distributed = distributed(&mut conn, project_id).await?;
        Ok(Capacity {
            distributed,
            available: project.distributable_percentage() - distributed,
            reserved: project.platform_fee,
            total_shares: None,
            distributed_shares: None,
            available_shares: None,
        })
    }

    async fn cap_table(&self, project_id: i64) -> LedgerResult<Vec<CapTableEntry>> {
        Ok(self
            .get_cap_table(project_id)
            .await?
            .into_iter()
            .map(|h| CapTableEntry {
                user_id: h.user_id,
                percentage: h.percentage,
                display_percentage: round_display(h.percentage),
                shares: None,
                sources: h.sources(),
                first_seen_at: h.created_at,
            })
            .collect())
    }

    async fn user_total(
        &self,
        project_id: i64,
        user_id: i64,
    ) -> LedgerResult<Option<HolderSnapshot>> {
        Ok(self.get_user_equity(project_id, user_id).await?.map(snapshot))
    }

    async fn history(&self, project_id: i64, page: Page) -> LedgerResult<Vec<LedgerEventView>> {
        Ok(self
            .get_history(project_id, page)
            .await?
            .into_iter()
            .map(|e| LedgerEventView {
                id: e.id,
                project_id: e.project_id,
                user_id: e.user_id,
                action: e.action,
                percentage_change: e.equity_change,
                percentage_before: e.equity_before,
                percentage_after: e.equity_after,
                shares_change: None,
                shares_before: None,
                shares_after: None,
                reason: e.reason,
                source_type: e.source_type,
                source_id: e.source_id,
                changed_by: e.changed_by,
                created_at: e.created_at,
            })
            .collect())
    }

    async fn validate(&self, project_id: i64) -> LedgerResult<LedgerReport> {
        self.validate_and_fix(project_id).await
    }
}

fn snapshot(holder: EquityHolder) -> HolderSnapshot {
    HolderSnapshot {
        earned_from: holder.sources(),
        project_id: holder.project_id,
        user_id: holder.user_id,
        percentage: holder.percentage,
        shares: None,
        created_at: holder.created_at,
        updated_at: holder.updated_at,
    }
}

fn ensure_percentage_ledger(project: &Project) -> LedgerResult<()> {
    if project.uses_shares_system() {
        Err(LedgerError::LedgerMismatch {
            project_id: project.id,
            expected: "percentage",
            actual: "shares",
        })
    } else {
        Ok(())
    }
}

pub(crate) fn revoke_reason(reason: &str) -> String {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        "Manual revocation".to_string()
    } else {
        trimmed.to_string()
    }
}

async fn fetch_holder(
    conn: &mut SqliteConnection,
    project_id: i64,
    user_id: i64,
) -> LedgerResult<Option<EquityHolder>> {
    let holder = sqlx::query_as::<_, EquityHolder>(&format!(
        "SELECT {} FROM project_equity WHERE project_id = ? AND user_id = ?",
        HOLDER_COLUMNS
    ))
    .bind(project_id)
    .bind(user_id)
    .fetch_optional(conn)
    .await?;
    Ok(holder)
}

async fn distributed(conn: &mut SqliteConnection, project_id: i64) -> LedgerResult<f64> {
    let total: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(percentage), 0.0) FROM project_equity WHERE project_id = ?",
    )
    .bind(project_id)
    .fetch_one(conn)
    .await?;
    Ok(total)
}

pub(crate) async fn source_exists(
    conn: &mut SqliteConnection,
    project_id: i64,
    source: SourceKind,
    source_id: Option<i64>,
) -> LedgerResult<bool> {
    let Some(source_id) = source_id else {
        return Ok(false);
    };
    let table = match source {
        SourceKind::TaskCompletion => "tasks",
        SourceKind::FreeProposal => "free_proposals",
        _ => return Ok(true),
    };
    let found: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT id FROM {} WHERE id = ? AND project_id = ?",
        table
    ))
    .bind(source_id)
    .bind(project_id)
    .fetch_optional(conn)
    .await?;
    Ok(found.is_some())
}

/// Upsert the holder and append its audit event. Must run inside the
/// caller's transaction.
async fn apply_change(conn: &mut SqliteConnection, change: &Change<'_>) -> LedgerResult<EquityHolder> {
    let existing = fetch_holder(conn, change.project_id, change.user_id).await?;
    let before = existing.as_ref().map(|h| h.percentage).unwrap_or(0.0);
    let mut after = before + change.delta;
    if after < 0.0 {
        if after < -CAPACITY_EPSILON {
            return Err(LedgerError::NegativeBalance {
                project_id: change.project_id,
                user_id: change.user_id,
                held: before,
                requested: -change.delta,
            });
        }
        after = 0.0;
    }

    let mut sources = existing
        .as_ref()
        .map(EquityHolder::sources)
        .unwrap_or_else(EarnSources::default);
    if let Some(tag) = &change.tag {
        sources.push(tag);
    }

    let now = Utc::now();
    let holder = sqlx::query_as::<_, EquityHolder>(&format!(
        r#"
        INSERT INTO project_equity (project_id, user_id, percentage, earned_from, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (project_id, user_id) DO UPDATE SET
            percentage = excluded.percentage,
            earned_from = excluded.earned_from,
            updated_at = excluded.updated_at
        RETURNING {}
        "#,
        HOLDER_COLUMNS
    ))
    .bind(change.project_id)
    .bind(change.user_id)
    .bind(after)
    .bind(sources.to_stored())
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO equity_history
            (project_id, user_id, action, equity_change, equity_before, equity_after,
             reason, source_type, source_id, changed_by, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(change.project_id)
    .bind(change.user_id)
    .bind(change.action)
    .bind(after - before)
    .bind(before)
    .bind(after)
    .bind(change.reason)
    .bind(change.source)
    .bind(change.source_id)
    .bind(change.changed_by)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(holder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::models::project::NewProject;
    use crate::services::project_service::ProjectService;
    use crate::test_support::{TestDb, new_project};
    use crate::config::LedgerConfig;

    struct Fixture {
        db: TestDb,
        ledger: EquityLedger,
        projects: ProjectService,
    }

    async fn fixture() -> Fixture {
        let db = TestDb::new().await;
        let ledger = EquityLedger::new(db.pool.clone(), Arc::new(Mutex::new(())));
        let projects = ProjectService::new(db.pool.clone(), db.store(), LedgerConfig::default());
        Fixture {
            db,
            ledger,
            projects,
        }
    }

    fn grant(project_id: i64, user_id: i64, percentage: f64) -> GrantRequest {
        GrantRequest {
            project_id,
            user_id,
            percentage,
            source: SourceKind::Investment,
            source_id: None,
            reason: None,
            changed_by: Some(1),
        }
    }

    async fn event_count(db: &TestDb, project_id: i64) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM equity_history WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(&*db.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn creator_initialization_records_initial_event() {
        let f = fixture().await;
        let project = f.projects.create_project(new_project(7, 10.0)).await.unwrap();

        let holder = f.ledger.initialize_creator(&project).await.unwrap();
        assert_eq!(holder.user_id, 7);
        assert!((holder.percentage - 10.0).abs() < 1e-9);
        assert_eq!(holder.sources().as_slice(), ["creator".to_string()]);

        let events = f.ledger.get_history(project.id, Page::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, LedgerAction::Initial);
        assert_eq!(events[0].equity_change, 10.0);
        assert_eq!(events[0].equity_before, 0.0);
        assert_eq!(events[0].equity_after, 10.0);
        assert!((f.ledger.available(project.id).await.unwrap() - 89.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn initialization_is_idempotent() {
        let f = fixture().await;
        let project = f.projects.create_project(new_project(7, 10.0)).await.unwrap();

        f.ledger.initialize_creator(&project).await.unwrap();
        let again = f.ledger.initialize_creator(&project).await.unwrap();

        assert!((again.percentage - 10.0).abs() < 1e-9);
        assert_eq!(f.ledger.get_cap_table(project.id).await.unwrap().len(), 1);
        assert_eq!(event_count(&f.db, project.id).await, 1);
    }

    #[tokio::test]
    async fn missing_creator_percentage_defaults_and_says_so() {
        let f = fixture().await;
        let project = f
            .projects
            .create_project(NewProject {
                initial_creator_percentage: None,
                ..new_project(7, 0.0)
            })
            .await
            .unwrap();

        let holder = f.ledger.initialize_creator(&project).await.unwrap();
        assert!((holder.percentage - 5.0).abs() < 1e-9);
        let events = f.ledger.get_history(project.id, Page::default()).await.unwrap();
        assert!(events[0].reason.contains("default"));
    }

    #[tokio::test]
    async fn task_grant_adds_to_existing_holder() {
        let f = fixture().await;
        let project = f.projects.create_project(new_project(7, 10.0)).await.unwrap();
        f.ledger.initialize_creator(&project).await.unwrap();

        let task = f.projects.create_task(project.id, "Pitch deck", 2.5).await.unwrap();
        let solution = f.projects.submit_solution(task.id, 7).await.unwrap();
        let solution = f.projects.approve_solution(solution.id).await.unwrap();

        let holder = f
            .ledger
            .grant_task_completion(&solution, Some(7))
            .await
            .unwrap()
            .unwrap();
        assert!((holder.percentage - 12.5).abs() < 1e-9);
        assert!(holder.earned_from.contains("creator"));
        assert!(holder.earned_from.contains(&format!("task_{}", task.id)));

        let events = f.ledger.get_history(project.id, Page::default()).await.unwrap();
        assert_eq!(events[0].action, LedgerAction::Grant);
        assert_eq!(events[0].source_type, SourceKind::TaskCompletion);
        assert_eq!(events[0].source_id, Some(task.id));
    }

    #[tokio::test]
    async fn grant_beyond_capacity_is_refused_without_side_effects() {
        let f = fixture().await;
        let project = f.projects.create_project(new_project(7, 94.0)).await.unwrap();
        f.ledger.initialize_creator(&project).await.unwrap();
        let task = f.projects.create_task(project.id, "Big task", 7.0).await.unwrap();
        let solution = f.projects.submit_solution(task.id, 42).await.unwrap();
        let solution = f.projects.approve_solution(solution.id).await.unwrap();

        let err = f
            .ledger
            .grant_task_completion(&solution, None)
            .await
            .unwrap_err();
        match &err {
            LedgerError::InsufficientEquity {
                requested,
                available,
                ..
            } => {
                assert_eq!(*requested, 7.0);
                assert!((available - 5.0).abs() < 1e-9);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::InsufficientEquity);
        assert!(f.ledger.get_user_equity(project.id, 42).await.unwrap().is_none());
        assert_eq!(event_count(&f.db, project.id).await, 1);
    }

    #[tokio::test]
    async fn exactly_available_succeeds_and_a_hair_more_fails() {
        let f = fixture().await;
        let exact = f.projects.create_project(new_project(7, 10.0)).await.unwrap();
        f.ledger.initialize_creator(&exact).await.unwrap();
        let holder = f.ledger.grant_equity(&grant(exact.id, 2, 89.0)).await.unwrap();
        assert!((holder.percentage - 89.0).abs() < 1e-9);
        assert!(!f.ledger.can_distribute(exact.id, 0.001).await.unwrap());

        let over = f.projects.create_project(new_project(7, 10.0)).await.unwrap();
        f.ledger.initialize_creator(&over).await.unwrap();
        let err = f.ledger.grant_equity(&grant(over.id, 2, 89.001)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientEquity { .. }));
    }

    #[tokio::test]
    async fn revoke_reduces_and_refuses_overdraw() {
        let f = fixture().await;
        let project = f.projects.create_project(new_project(7, 10.0)).await.unwrap();
        f.ledger.initialize_creator(&project).await.unwrap();

        let request = RevokeRequest {
            project_id: project.id,
            user_id: 7,
            percentage: 4.0,
            reason: "vesting cliff missed".into(),
            changed_by: Some(1),
        };
        let holder = f.ledger.revoke_equity(&request).await.unwrap();
        assert!((holder.percentage - 6.0).abs() < 1e-9);

        let err = f
            .ledger
            .revoke_equity(&RevokeRequest {
                percentage: 6.5,
                ..request
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NegativeBalance { .. }));
        assert!((f.ledger.available(project.id).await.unwrap() - 93.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn validator_flags_balances_that_history_cannot_explain() {
        let f = fixture().await;
        let project = f.projects.create_project(new_project(7, 10.0)).await.unwrap();
        f.ledger.initialize_creator(&project).await.unwrap();
        f.ledger.grant_equity(&grant(project.id, 3, 20.0)).await.unwrap();

        let clean = f.ledger.validate_and_fix(project.id).await.unwrap();
        assert!(clean.valid, "{:?}", clean.issues);
        assert!((clean.total - 30.0).abs() < 1e-9);
        assert!((clean.available - 69.0).abs() < 1e-9);

        sqlx::query("UPDATE project_equity SET percentage = 95.0 WHERE project_id = ? AND user_id = 3")
            .bind(project.id)
            .execute(&*f.db.pool)
            .await
            .unwrap();
        let report = f.ledger.validate_and_fix(project.id).await.unwrap();
        assert!(!report.valid);
        assert!(report.issues.iter().any(|i| i.contains("exceeding 100%")));
        assert!(report.issues.iter().any(|i| i.contains("history accounts for")));
    }

    #[tokio::test]
    async fn history_rows_cannot_be_rewritten() {
        let f = fixture().await;
        let project = f.projects.create_project(new_project(7, 10.0)).await.unwrap();
        f.ledger.initialize_creator(&project).await.unwrap();

        let result = sqlx::query("UPDATE equity_history SET equity_change = 50.0 WHERE project_id = ?")
            .bind(project.id)
            .execute(&*f.db.pool)
            .await;
        assert!(result.is_err());

        let result = sqlx::query("DELETE FROM equity_history WHERE project_id = ?")
            .bind(project.id)
            .execute(&*f.db.pool)
            .await;
        assert!(result.is_err());
        assert_eq!(f.ledger.get_history(project.id, Page::default()).await.unwrap().len(), 1);

        // History still leaves together with its project.
        f.projects.delete_project(project.id).await.unwrap();
        let (left,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM equity_history WHERE project_id = ?")
            .bind(project.id)
            .fetch_one(&*f.db.pool)
            .await
            .unwrap();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn shares_projects_are_refused() {
        let f = fixture().await;
        let project = f
            .projects
            .create_project(NewProject {
                uses_shares: true,
                ..new_project(7, 10.0)
            })
            .await
            .unwrap();
        let err = f.ledger.initialize_creator(&project).await.unwrap_err();
        assert!(matches!(err, LedgerError::LedgerMismatch { .. }));
    }

    #[tokio::test]
    async fn concurrent_grants_never_overshoot_capacity() {
        let f = fixture().await;
        let project = f.projects.create_project(new_project(7, 9.0)).await.unwrap();
        f.ledger.initialize_creator(&project).await.unwrap();

        // 90% left; ten concurrent 10% grants can only fit nine.
        let mut handles = Vec::new();
        for user in 100..110 {
            let ledger = f.ledger.clone();
            let request = grant(project.id, user, 10.0);
            handles.push(tokio::spawn(async move { ledger.grant_equity(&request).await }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                granted += 1;
            }
        }
        assert_eq!(granted, 9);
        let report = f.ledger.validate_and_fix(project.id).await.unwrap();
        assert!(report.valid, "{:?}", report.issues);
    }
}
