//! Represents a project, the aggregate that owns a ledger, upload
//! sessions, sync history and a remote repository binding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Creator percentage applied when a project never set one.
pub const DEFAULT_CREATOR_PERCENTAGE: f64 = 5.0;

/// A project pitch published by a founder.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Project {
    pub id: i64,

    pub name: String,

    /// User who published the project and receives the creator holding.
    pub creator_id: i64,

    /// Creator's opening stake (0–100). `None` falls back to
    /// [`DEFAULT_CREATOR_PERCENTAGE`].
    pub initial_creator_percentage: Option<f64>,

    /// Reserved, non-distributable percentage.
    pub platform_fee: f64,

    /// When set, the project runs on the shares ledger. Written at most once.
    pub total_shares: Option<i64>,

    pub created_at: DateTime<Utc>,
}

impl Project {
    /// True iff the project has been moved onto the integer-share ledger.
    pub fn uses_shares_system(&self) -> bool {
        self.total_shares.is_some()
    }

    /// Creator stake with the default applied, plus whether the default was used.
    pub fn creator_percentage(&self) -> (f64, bool) {
        match self.initial_creator_percentage {
            Some(pct) => (pct, false),
            None => (DEFAULT_CREATOR_PERCENTAGE, true),
        }
    }

    /// Upper bound on what holders may collectively own.
    pub fn distributable_percentage(&self) -> f64 {
        100.0 - self.platform_fee
    }
}

/// Input for creating a project.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub creator_id: i64,
    #[serde(default)]
    pub initial_creator_percentage: Option<f64>,
    #[serde(default)]
    pub platform_fee: Option<f64>,
    #[serde(default)]
    pub uses_shares: bool,
}

/// Status of a project's remote repository.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RepoStatus {
    Disabled,
    Pending,
    Ready,
    Error,
}

/// Per-project pointer at the hosted repository that receives synced files.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct RepositoryBinding {
    pub project_id: i64,

    /// Provider kind, e.g. "github".
    pub provider: String,

    /// Full remote name, `<owner>/<repo>`.
    pub repo_name: String,

    pub default_branch: String,

    pub status: RepoStatus,

    pub last_sync_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl RepositoryBinding {
    /// Whether a transport may push to this binding.
    pub fn is_writable(&self) -> bool {
        self.status != RepoStatus::Disabled
    }

    /// Split `repo_name` into owner and repository parts.
    pub fn owner_and_repo(&self) -> Option<(&str, &str)> {
        self.repo_name
            .split_once('/')
            .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty())
    }
}
