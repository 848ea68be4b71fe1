//! Contribution entities owned by the web layer. The ledgers only read
//! them to resolve what a grant is worth and who receives it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

/// An equity-rewarded unit of work inside a project.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    /// Percentage granted to the contributor whose solution is approved.
    pub equity_reward: f64,
    pub created_at: DateTime<Utc>,
}

/// A contributor's answer to a task.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct TaskSolution {
    pub id: i64,
    pub task_id: i64,
    pub project_id: i64,
    pub submitted_by: i64,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// A contributor-initiated offer not tied to a single task.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FreeProposal {
    pub id: i64,
    pub project_id: i64,
    pub proposed_by: i64,
    pub title: String,
    pub equity_requested: f64,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub equity_reward: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFreeProposal {
    pub proposed_by: i64,
    pub title: String,
    pub equity_requested: f64,
}
