//! src/services/share_ledger.rs
//!
//! Shares ledger: exact fixed-decimal share counts instead of floating
//! percentages. A project is on this ledger once `projects.total_shares`
//! is set; that column is written once and never cleared.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    models::{
        equity::{EquityEvent, EquityHolder},
        ledger::{
            Capacity, CapTableEntry, EarnSources, GrantRequest, HolderSnapshot, LedgerAction,
            LedgerEventView, LedgerReport, Page, RevokeRequest, SourceKind,
        },
        project::Project,
        shares::{ShareEvent, ShareHolder, Shares},
    },
    services::{
        equity_ledger::{revoke_reason, source_exists},
        ledger::{
            Ledger, LedgerError, LedgerResult, MigrationReport, check_amount, check_source,
            fetch_project,
        },
    },
};

const HOLDER_COLUMNS: &str = "id, project_id, user_id, shares, earned_from, created_at, updated_at";
const EVENT_COLUMNS: &str = "id, project_id, user_id, action, shares_change, shares_before, shares_after, percentage_before, percentage_after, reason, source_type, source_id, changed_by, created_at";

struct Change<'a> {
    project_id: i64,
    total_shares: i64,
    user_id: i64,
    action: LedgerAction,
    delta: Shares,
    reason: &'a str,
    source: SourceKind,
    source_id: Option<i64>,
    changed_by: Option<i64>,
    tag: Option<String>,
}

#[derive(Clone)]
pub struct ShareLedger {
    db: Arc<SqlitePool>,
    write_lock: Arc<Mutex<()>>,
    default_total_shares: i64,
}

impl ShareLedger {
    pub fn new(db: Arc<SqlitePool>, write_lock: Arc<Mutex<()>>, default_total_shares: i64) -> Self {
        Self {
            db,
            write_lock,
            default_total_shares,
        }
    }

    /// Put a fresh project on the shares ledger and issue the creator's
    /// opening shares. `total_shares` only takes effect if the project has
    /// none yet.
    pub async fn initialize_project(
        &self,
        project: &Project,
        creator_percentage: Option<f64>,
        total_shares: Option<i64>,
    ) -> LedgerResult<ShareHolder> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;
        let mut project = fetch_project(&mut tx, project.id).await?;

        let total = match project.total_shares {
            Some(existing) => {
                if let Some(requested) = total_shares.filter(|t| *t != existing) {
                    warn!(
                        project_id = project.id,
                        existing, requested, "total_shares is immutable; keeping existing value"
                    );
                }
                existing
            }
            None => {
                let legacy: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM project_equity WHERE project_id = ?")
                        .bind(project.id)
                        .fetch_one(&mut *tx)
                        .await?;
                if legacy > 0 {
                    return Err(LedgerError::LedgerMismatch {
                        project_id: project.id,
                        expected: "shares",
                        actual: "percentage",
                    });
                }
                let total = total_shares.unwrap_or(self.default_total_shares);
                if total <= 0 {
                    return Err(LedgerError::InvalidSource(format!(
                        "total_shares must be positive, got {}",
                        total
                    )));
                }
                sqlx::query("UPDATE projects SET total_shares = ? WHERE id = ? AND total_shares IS NULL")
                    .bind(total)
                    .bind(project.id)
                    .execute(&mut *tx)
                    .await?;
                project.total_shares = Some(total);
                total
            }
        };

        let initialized: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM share_history WHERE project_id = ? AND action = 'initial' LIMIT 1",
        )
        .bind(project.id)
        .fetch_optional(&mut *tx)
        .await?;
        if initialized.is_some() {
            if let Some(holder) = fetch_holder(&mut tx, project.id, project.creator_id).await? {
                warn!(project_id = project.id, "shares ledger already initialized");
                tx.commit().await?;
                return Ok(holder);
            }
        }

        let (percentage, defaulted) = match creator_percentage {
            Some(pct) => (pct, false),
            None => project.creator_percentage(),
        };
        if !(0.0..=100.0).contains(&percentage) {
            return Err(LedgerError::InvalidAmount(percentage));
        }
        let shares = Shares::from_percentage(total, percentage);
        let distributable = Shares::distributable(total, project.platform_fee);
        if shares > distributable {
            return Err(LedgerError::InsufficientEquity {
                project_id: project.id,
                requested: percentage,
                available: distributable.percentage_of(total),
            });
        }

        let reason = if defaulted {
            format!(
                "Initial creator shares: {} of {} ({}% default applied; project did not set a creator percentage)",
                shares, total, percentage
            )
        } else {
            format!("Initial creator shares: {} of {}", shares, total)
        };
        let holder = apply_change(
            &mut tx,
            &Change {
                project_id: project.id,
                total_shares: total,
                user_id: project.creator_id,
                action: LedgerAction::Initial,
                delta: shares,
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
            total_shares = total,
            shares = %shares,
            "initialized shares ledger"
        );
        Ok(holder)
    }

    /// Convert `request.percentage` with the project's `total_shares` and
    /// credit it after a capacity check expressed in shares.
    pub async fn grant_shares(&self, request: &GrantRequest) -> LedgerResult<ShareHolder> {
        check_amount(request.percentage)?;
        if request.source == SourceKind::Initial {
            return Err(LedgerError::InvalidSource(
                "initial holdings are created by ledger initialization".into(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;
        let project = fetch_project(&mut tx, request.project_id).await?;
        let total = ensure_shares_ledger(&project)?;
        check_source(&mut tx, "share_history", request).await?;

        let amount = Shares::from_percentage(total, request.percentage);
        if amount <= Shares::ZERO {
            return Err(LedgerError::InvalidAmount(request.percentage));
        }
        let available = Shares::distributable(total, project.platform_fee)
            - distributed(&mut tx, project.id).await?;
        if amount > available {
            warn!(
                project_id = project.id,
                user_id = request.user_id,
                requested = %amount,
                available = %available,
                "grant refused: insufficient shares"
            );
            return Err(LedgerError::InsufficientEquity {
                project_id: project.id,
                requested: request.percentage,
                available: available.percentage_of(total).max(0.0),
            });
        }

        let reason = request
            .reason
            .clone()
            .unwrap_or_else(|| format!("Share grant ({})", request.source));
        let holder = apply_change(
            &mut tx,
            &Change {
                project_id: project.id,
                total_shares: total,
                user_id: request.user_id,
                action: LedgerAction::Grant,
                delta: amount,
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
            shares = %amount,
            source = %request.source,
            source_id = ?request.source_id,
            "granted shares"
        );
        Ok(holder)
    }

    pub async fn revoke_shares(&self, request: &RevokeRequest) -> LedgerResult<ShareHolder> {
        check_amount(request.percentage)?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;
        let project = fetch_project(&mut tx, request.project_id).await?;
        let total = ensure_shares_ledger(&project)?;

        let held = fetch_holder(&mut tx, project.id, request.user_id)
            .await?
            .map(|h| h.shares)
            .unwrap_or(Shares::ZERO);
        let amount = Shares::from_percentage(total, request.percentage);
        if amount > held || amount <= Shares::ZERO {
            return Err(LedgerError::NegativeBalance {
                project_id: project.id,
                user_id: request.user_id,
                held: held.percentage_of(total),
                requested: request.percentage,
            });
        }

        let reason = revoke_reason(&request.reason);
        let holder = apply_change(
            &mut tx,
            &Change {
                project_id: project.id,
                total_shares: total,
                user_id: request.user_id,
                action: LedgerAction::Revoke,
                delta: -amount,
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
            shares = %amount,
            "revoked shares"
        );
        Ok(holder)
    }

    /// Holders with the most shares first.
    pub async fn get_cap_table(&self, project_id: i64) -> LedgerResult<Vec<ShareHolder>> {
        let holders = sqlx::query_as::<_, ShareHolder>(&format!(
            "SELECT {} FROM project_shares WHERE project_id = ? ORDER BY shares DESC, created_at ASC, id ASC",
            HOLDER_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(holders)
    }

    pub async fn get_user_shares(
        &self,
        project_id: i64,
        user_id: i64,
    ) -> LedgerResult<Option<ShareHolder>> {
        let mut conn = self.db.acquire().await?;
        fetch_holder(&mut conn, project_id, user_id).await
    }

    pub async fn get_history(&self, project_id: i64, page: Page) -> LedgerResult<Vec<ShareEvent>> {
        let page = page.clamped();
        let events = sqlx::query_as::<_, ShareEvent>(&format!(
            "SELECT {} FROM share_history WHERE project_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
            EVENT_COLUMNS
        ))
        .bind(project_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&*self.db)
        .await?;
        Ok(events)
    }

    pub async fn validate_shares(&self, project_id: i64) -> LedgerResult<LedgerReport> {
        let mut conn = self.db.acquire().await?;
        let project = fetch_project(&mut conn, project_id).await?;
        let Some(total) = project.total_shares else {
            return Ok(LedgerReport {
                valid: false,
                issues: vec![format!(
                    "project {} is not on the shares ledger",
                    project_id
                )],
                ..LedgerReport::default()
            });
        };

        let mut issues = Vec::new();
        if total <= 0 {
            issues.push(format!("total_shares is {}, expected a positive count", total));
        }

        let holders = sqlx::query_as::<_, ShareHolder>(&format!(
            "SELECT {} FROM project_shares WHERE project_id = ?",
            HOLDER_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await?;
        let events = sqlx::query_as::<_, ShareEvent>(&format!(
            "SELECT {} FROM share_history WHERE project_id = ? ORDER BY id ASC",
            EVENT_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await?;

        let ceiling = Shares::total(total);
        for holder in &holders {
            if holder.shares.is_negative() || holder.shares > ceiling {
                issues.push(format!(
                    "user {} holds {} shares, outside [0, {}]",
                    holder.user_id, holder.shares, total
                ));
            }
        }

        let held: Shares = holders.iter().map(|h| h.shares).sum();
        let distributable = Shares::distributable(total, project.platform_fee);
        if held > distributable {
            issues.push(format!(
                "holders own {} shares but only {} are distributable after the {:.2}% platform fee",
                held, distributable, project.platform_fee
            ));
        }

        let mut replayed: HashMap<i64, Shares> = HashMap::new();
        for event in &events {
            let entry = replayed.entry(event.user_id).or_default();
            *entry = *entry + event.shares_change;
            if event.shares_before + event.shares_change != event.shares_after {
                issues.push(format!(
                    "event {} does not add up: {} + {} != {}",
                    event.id, event.shares_before, event.shares_change, event.shares_after
                ));
            }
        }
        for holder in &holders {
            let expected = replayed.remove(&holder.user_id).unwrap_or_default();
            if expected != holder.shares {
                issues.push(format!(
                    "user {} holds {} shares but history accounts for {}",
                    holder.user_id, holder.shares, expected
                ));
            }
        }
        for (user_id, expected) in replayed {
            if expected != Shares::ZERO {
                issues.push(format!(
                    "history credits user {} with {} shares but no holder exists",
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

        let held_pct = held.percentage_of(total);
        Ok(LedgerReport {
            valid: issues.is_empty(),
            issues,
            total: held_pct,
            available: (distributable - held).percentage_of(total),
            total_shares: Some(total),
        })
    }

    /// One-way conversion of a percentage-ledger project. Re-running it on
    /// a migrated project changes nothing.
    pub async fn migrate_project(&self, project_id: i64) -> LedgerResult<MigrationReport> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;
        let project = fetch_project(&mut tx, project_id).await?;

        if let Some(total) = project.total_shares {
            warn!(project_id, total_shares = total, "project already uses the shares ledger; skipping");
            return Ok(MigrationReport {
                project_id,
                total_shares: total,
                holders: 0,
                events: 0,
                migrated: false,
            });
        }

        let total = self.default_total_shares;
        sqlx::query("UPDATE projects SET total_shares = ? WHERE id = ? AND total_shares IS NULL")
            .bind(total)
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        let holders = sqlx::query_as::<_, EquityHolder>(
            r#"
            SELECT id, project_id, user_id, percentage, earned_from, created_at, updated_at
            FROM project_equity WHERE project_id = ? ORDER BY id ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(&mut *tx)
        .await?;
        let now = Utc::now();
        for holder in &holders {
            sqlx::query(
                r#"
                INSERT INTO project_shares (project_id, user_id, shares, earned_from, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(project_id)
            .bind(holder.user_id)
            .bind(Shares::from_percentage(total, holder.percentage))
            .bind(&holder.earned_from)
            .bind(holder.created_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let events = sqlx::query_as::<_, EquityEvent>(
            r#"
            SELECT id, project_id, user_id, action, equity_change, equity_before, equity_after,
                   reason, source_type, source_id, changed_by, created_at
            FROM equity_history WHERE project_id = ? ORDER BY id ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(&mut *tx)
        .await?;
        for event in &events {
            // Convert the endpoints and derive the delta from them so each
            // user's history still telescopes to the converted balance.
            let before = Shares::from_percentage(total, event.equity_before);
            let after = Shares::from_percentage(total, event.equity_after);
            insert_event(
                &mut tx,
                &ShareEventRow {
                    project_id,
                    user_id: event.user_id,
                    action: event.action,
                    shares_change: after - before,
                    shares_before: before,
                    shares_after: after,
                    percentage_before: event.equity_before,
                    percentage_after: event.equity_after,
                    reason: &event.reason,
                    source_type: event.source_type,
                    source_id: event.source_id,
                    changed_by: event.changed_by,
                    created_at: event.created_at,
                },
            )
            .await?;
        }
        tx.commit().await?;

        info!(
            project_id,
            total_shares = total,
            holders = holders.len(),
            events = events.len(),
            "migrated project to the shares ledger"
        );
        Ok(MigrationReport {
            project_id,
            total_shares: total,
            holders: holders.len(),
            events: events.len(),
            migrated: true,
        })
    }

    /// Migrate every project still on the percentage ledger. A project
    /// that fails is logged and left on the percentage ledger.
    pub async fn migrate_all(&self) -> LedgerResult<Vec<MigrationReport>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM projects WHERE total_shares IS NULL ORDER BY id")
                .fetch_all(&*self.db)
                .await?;

        let mut reports = Vec::with_capacity(ids.len());
        for project_id in ids {
            match self.migrate_project(project_id).await {
                Ok(report) => reports.push(report),
                Err(err) => error!(project_id, error = %err, "shares migration failed"),
            }
        }
        Ok(reports)
    }
}

#[async_trait]
impl Ledger for ShareLedger {
    fn pool(&self) -> &SqlitePool {
        self.db.as_ref()
    }

    async fn initialize(&self, project: &Project) -> LedgerResult<HolderSnapshot> {
        let holder = self.initialize_project(project, None, None).await?;
        let total = self.total_shares(project.id).await?;
        Ok(snapshot(holder, total))
    }

    async fn grant(&self, request: &GrantRequest) -> LedgerResult<HolderSnapshot> {
        let holder = self.grant_shares(request).await?;
        let total = self.total_shares(request.project_id).await?;
        Ok(snapshot(holder, total))
    }

    async fn revoke(&self, request: &RevokeRequest) -> LedgerResult<HolderSnapshot> {
        let holder = self.revoke_shares(request).await?;
        let total = self.total_shares(request.project_id).await?;
        Ok(snapshot(holder, total))
    }

    async fn capacity(&self, project_id: i64) -> LedgerResult<Capacity> {
        let mut conn = self.db.acquire().await?;
        let project = fetch_project(&mut conn, project_id).await?;
        let total = ensure_shares_ledger(&project)?;
        let held = distributed(&mut conn, project_id).await?;
        let available = Shares::distributable(total, project.platform_fee) - held;
        Ok(Capacity {
            distributed: held.percentage_of(total),
            available: available.percentage_of(total),
            reserved: project.platform_fee,
            total_shares: Some(total),
            distributed_shares: Some(held),
            available_shares: Some(available),
        })
    }

    async fn cap_table(&self, project_id: i64) -> LedgerResult<Vec<CapTableEntry>> {
        let total = self.total_shares(project_id).await?;
        Ok(self
            .get_cap_table(project_id)
            .await?
            .into_iter()
            .map(|h| CapTableEntry {
                user_id: h.user_id,
                percentage: h.shares.percentage_of(total),
                display_percentage: h.shares.display_percentage(total),
                shares: Some(h.shares),
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
        let total = self.total_shares(project_id).await?;
        Ok(self
            .get_user_shares(project_id, user_id)
            .await?
            .map(|h| snapshot(h, total)))
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
                percentage_change: e.percentage_after - e.percentage_before,
                percentage_before: e.percentage_before,
                percentage_after: e.percentage_after,
                shares_change: Some(e.shares_change),
                shares_before: Some(e.shares_before),
                shares_after: Some(e.shares_after),
                reason: e.reason,
                source_type: e.source_type,
                source_id: e.source_id,
                changed_by: e.changed_by,
                created_at: e.created_at,
            })
            .collect())
    }

    async fn validate(&self, project_id: i64) -> LedgerResult<LedgerReport> {
        self.validate_shares(project_id).await
    }
}

impl ShareLedger {
    async fn total_shares(&self, project_id: i64) -> LedgerResult<i64> {
        let mut conn = self.db.acquire().await?;
        let project = fetch_project(&mut conn, project_id).await?;
        ensure_shares_ledger(&project)
    }
}

fn snapshot(holder: ShareHolder, total_shares: i64) -> HolderSnapshot {
    HolderSnapshot {
        earned_from: holder.sources(),
        project_id: holder.project_id,
        user_id: holder.user_id,
        percentage: holder.shares.percentage_of(total_shares),
        shares: Some(holder.shares),
        created_at: holder.created_at,
        updated_at: holder.updated_at,
    }
}

fn ensure_shares_ledger(project: &Project) -> LedgerResult<i64> {
    project.total_shares.ok_or(LedgerError::LedgerMismatch {
        project_id: project.id,
        expected: "shares",
        actual: "percentage",
    })
}

async fn fetch_holder(
    conn: &mut SqliteConnection,
    project_id: i64,
    user_id: i64,
) -> LedgerResult<Option<ShareHolder>> {
    let holder = sqlx::query_as::<_, ShareHolder>(&format!(
        "SELECT {} FROM project_shares WHERE project_id = ? AND user_id = ?",
        HOLDER_COLUMNS
    ))
    .bind(project_id)
    .bind(user_id)
    .fetch_optional(conn)
    .await?;
    Ok(holder)
}

async fn distributed(conn: &mut SqliteConnection, project_id: i64) -> LedgerResult<Shares> {
    let hundredths: i64 =
        sqlx::query_scalar("SELECT COALESCE(SUM(shares), 0) FROM project_shares WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(conn)
            .await?;
    Ok(Shares::from_hundredths(hundredths))
}

struct ShareEventRow<'a> {
    project_id: i64,
    user_id: i64,
    action: LedgerAction,
    shares_change: Shares,
    shares_before: Shares,
    shares_after: Shares,
    percentage_before: f64,
    percentage_after: f64,
    reason: &'a str,
    source_type: SourceKind,
    source_id: Option<i64>,
    changed_by: Option<i64>,
    created_at: chrono::DateTime<Utc>,
}

async fn insert_event(conn: &mut SqliteConnection, row: &ShareEventRow<'_>) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO share_history
            (project_id, user_id, action, shares_change, shares_before, shares_after,
             percentage_before, percentage_after, reason, source_type, source_id, changed_by, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.project_id)
    .bind(row.user_id)
    .bind(row.action)
    .bind(row.shares_change)
    .bind(row.shares_before)
    .bind(row.shares_after)
    .bind(row.percentage_before)
    .bind(row.percentage_after)
    .bind(row.reason)
    .bind(row.source_type)
    .bind(row.source_id)
    .bind(row.changed_by)
    .bind(row.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Upsert the holder and append its audit event inside the caller's
/// transaction.
async fn apply_change(conn: &mut SqliteConnection, change: &Change<'_>) -> LedgerResult<ShareHolder> {
    let existing = fetch_holder(conn, change.project_id, change.user_id).await?;
    let before = existing.as_ref().map(|h| h.shares).unwrap_or(Shares::ZERO);
    let after = before + change.delta;
    if after.is_negative() {
        return Err(LedgerError::NegativeBalance {
            project_id: change.project_id,
            user_id: change.user_id,
            held: before.percentage_of(change.total_shares),
            requested: (-change.delta).percentage_of(change.total_shares),
        });
    }

    let mut sources = existing
        .as_ref()
        .map(ShareHolder::sources)
        .unwrap_or_else(EarnSources::default);
    if let Some(tag) = &change.tag {
        sources.push(tag);
    }

    let now = Utc::now();
    let holder = sqlx::query_as::<_, ShareHolder>(&format!(
        r#"
        INSERT INTO project_shares (project_id, user_id, shares, earned_from, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (project_id, user_id) DO UPDATE SET
            shares = excluded.shares,
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

    insert_event(
        conn,
        &ShareEventRow {
            project_id: change.project_id,
            user_id: change.user_id,
            action: change.action,
            shares_change: change.delta,
            shares_before: before,
            shares_after: after,
            percentage_before: before.percentage_of(change.total_shares),
            percentage_after: after.percentage_of(change.total_shares),
            reason: change.reason,
            source_type: change.source,
            source_id: change.source_id,
            changed_by: change.changed_by,
            created_at: now,
        },
    )
    .await?;

    Ok(holder)
}
