//! Vocabulary shared by the percentage and shares ledgers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::shares::Shares;

/// Absolute tolerance for comparing stored percentages.
pub const PERCENT_TOLERANCE: f64 = 0.01;

/// Slack allowed by capacity checks to absorb float noise only; it is far
/// below any amount a caller can meaningfully request.
pub const CAPACITY_EPSILON: f64 = 1e-9;

/// What kind of change an event records.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum LedgerAction {
    Initial,
    Grant,
    Revoke,
    Transfer,
    Adjust,
    Correction,
}

/// Where a change came from.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SourceKind {
    Initial,
    TaskCompletion,
    FreeProposal,
    Investment,
    Manual,
    Bonus,
    Correction,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Initial => "initial",
            SourceKind::TaskCompletion => "task_completion",
            SourceKind::FreeProposal => "free_proposal",
            SourceKind::Investment => "investment",
            SourceKind::Manual => "manual",
            SourceKind::Bonus => "bonus",
            SourceKind::Correction => "correction",
        }
    }

    /// Sources that must point at a concrete entity.
    pub fn requires_entity(self) -> bool {
        matches!(self, SourceKind::TaskCompletion | SourceKind::FreeProposal)
    }

    /// Tag recorded in a holder's earn-source list for this source.
    pub fn earn_tag(self, source_id: Option<i64>) -> String {
        match (self, source_id) {
            (SourceKind::Initial, _) => "creator".to_string(),
            (SourceKind::TaskCompletion, Some(id)) => format!("task_{}", id),
            (SourceKind::FreeProposal, Some(id)) => format!("free_proposal_{}", id),
            (other, _) => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, de-duplicated list of earn-source tags.
///
/// Persisted as a comma-joined string; tags can never contain a comma, so
/// the stored form always splits back into the same list.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct EarnSources(Vec<String>);

impl EarnSources {
    pub fn parse(stored: &str) -> Self {
        let mut sources = Self::default();
        for tag in stored.split(',') {
            sources.push(tag);
        }
        sources
    }

    /// Append `tag` unless already present. Commas and surrounding
    /// whitespace are stripped.
    pub fn push(&mut self, tag: &str) {
        let cleaned: String = tag.trim().chars().filter(|c| *c != ',').collect();
        if cleaned.is_empty() || self.0.iter().any(|t| *t == cleaned) {
            return;
        }
        self.0.push(cleaned);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn to_stored(&self) -> String {
        self.0.join(",")
    }
}

/// Input for a balance-increasing change on either ledger.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantRequest {
    pub project_id: i64,
    pub user_id: i64,
    /// Amount expressed as a percentage of the project. The shares ledger
    /// converts it with the project's `total_shares` at grant time.
    pub percentage: f64,
    pub source: SourceKind,
    #[serde(default)]
    pub source_id: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub changed_by: Option<i64>,
}

/// Input for a manual balance reduction.
#[derive(Debug, Clone, Deserialize)]
pub struct RevokeRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub percentage: f64,
    pub reason: String,
    #[serde(default)]
    pub changed_by: Option<i64>,
}

/// Ledger-agnostic view of one holder.
#[derive(Serialize, Clone, Debug)]
pub struct HolderSnapshot {
    pub project_id: i64,
    pub user_id: i64,
    pub percentage: f64,
    /// Only set for projects on the shares ledger.
    pub shares: Option<Shares>,
    pub earned_from: EarnSources,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of a cap table.
#[derive(Serialize, Clone, Debug)]
pub struct CapTableEntry {
    pub user_id: i64,
    /// Stored percentage (full precision).
    pub percentage: f64,
    /// Percentage rounded to two decimals for display.
    pub display_percentage: f64,
    pub shares: Option<Shares>,
    pub sources: EarnSources,
    pub first_seen_at: DateTime<Utc>,
}

/// Ledger-agnostic view of one audit event.
#[derive(Serialize, Clone, Debug)]
pub struct LedgerEventView {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub action: LedgerAction,
    pub percentage_change: f64,
    pub percentage_before: f64,
    pub percentage_after: f64,
    pub shares_change: Option<Shares>,
    pub shares_before: Option<Shares>,
    pub shares_after: Option<Shares>,
    pub reason: String,
    pub source_type: SourceKind,
    pub source_id: Option<i64>,
    pub changed_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// How much of a project is handed out and how much is left.
#[derive(Serialize, Clone, Debug)]
pub struct Capacity {
    pub distributed: f64,
    pub available: f64,
    pub reserved: f64,
    pub total_shares: Option<i64>,
    pub distributed_shares: Option<Shares>,
    pub available_shares: Option<Shares>,
}

/// Result of a read-only consistency sweep.
#[derive(Serialize, Clone, Debug, Default)]
pub struct LedgerReport {
    pub valid: bool,
    pub issues: Vec<String>,
    pub total: f64,
    pub available: f64,
    pub total_shares: Option<i64>,
}

/// Offset pagination for history queries.
#[derive(Deserialize, Clone, Copy, Debug)]
pub struct Page {
    #[serde(default = "Page::default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl Page {
    fn default_limit() -> i64 {
        50
    }

    pub fn clamped(self) -> Self {
        Self {
            limit: self.limit.clamp(1, 500),
            offset: self.offset.max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: Self::default_limit(),
            offset: 0,
        }
    }
}

/// Round to two decimals, ties to even.
pub fn round_display(value: f64) -> f64 {
    let scaled = value * 100.0;
    let floor = scaled.floor();
    let diff = scaled - floor;
    let rounded = if (diff - 0.5).abs() < 1e-9 {
        if floor % 2.0 == 0.0 { floor } else { floor + 1.0 }
    } else {
        scaled.round()
    };
    rounded / 100.0
}
