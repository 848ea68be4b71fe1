//! Percentage-based ownership: holders and their audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::ledger::{EarnSources, LedgerAction, SourceKind};

/// A (project, user) percentage balance. Never deleted; a zero balance
/// stays as historical record.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct EquityHolder {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub percentage: f64,
    /// Comma-joined earn-source tags, see [`EarnSources`].
    pub earned_from: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EquityHolder {
    pub fn sources(&self) -> EarnSources {
        EarnSources::parse(&self.earned_from)
    }
}

/// Immutable record of one change to a percentage balance.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct EquityEvent {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub action: LedgerAction,
    pub equity_change: f64,
    pub equity_before: f64,
    pub equity_after: f64,
    pub reason: String,
    pub source_type: SourceKind,
    pub source_id: Option<i64>,
    /// Acting user; `None` for system-initiated changes.
    pub changed_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}
