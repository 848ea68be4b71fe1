//! Upload sessions, staged file descriptors and the sync history log.
//!
//! These records are persisted as JSON (`metadata.json` per session,
//! `history.json` per project) rather than in SQLite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Zip,
    Manual,
}

/// Lifecycle of a session.
///
/// `extracted → ready → syncing → completed | error`; `error` may be
/// retried, `completed` is terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Extracted,
    Ready,
    Syncing,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Extracted => "extracted",
            SessionStatus::Ready => "ready",
            SessionStatus::Syncing => "syncing",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }

    /// States from which a sync may start.
    pub fn can_start_sync(self) -> bool {
        matches!(
            self,
            SessionStatus::Extracted | SessionStatus::Ready | SessionStatus::Error
        )
    }

    /// States in which the session directory may be removed.
    pub fn can_cancel(self) -> bool {
        matches!(self, SessionStatus::Extracted | SessionStatus::Error)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of an uploaded file by extension.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Source,
    Prototype,
    Documentation,
    Visual,
    Archive,
    Other,
}

/// One file staged in a session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StagedFile {
    /// Sanitized path relative to the session's workspace subtree.
    pub path: String,
    pub size: u64,
    pub mime_type: String,
    pub content_kind: ContentKind,
    /// Hex MD5 of the staged bytes.
    pub checksum: String,
}

/// An archive entry that was dropped rather than staged.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: String,
}

/// Timing breakdown of a sync run, in milliseconds.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Performance {
    pub collect_ms: u64,
    pub transfer_ms: u64,
    pub mirror_ms: u64,
    pub total_ms: u64,
    /// Files held on disk until transfer time instead of being read up front.
    pub deferred_files: usize,
    /// Files whose content differs from the previous `synced/` mirror.
    pub changed_files: usize,
}

/// Contents of `metadata.json`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionMetadata {
    pub session_id: String,
    pub project_id: i64,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub file_count: usize,
    pub total_size: u64,
    #[serde(default)]
    pub files: Vec<StagedFile>,
    #[serde(default)]
    pub skipped: Vec<SkippedEntry>,
    pub initiated_by: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sync_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced_by: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    /// `git`, `rest` or `local`.
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    /// Files actually forwarded to the remote (build artifacts excluded).
    #[serde(default)]
    pub remote_file_count: Option<usize>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub performance: Option<Performance>,
}

impl SessionMetadata {
    pub fn new(session_id: String, project_id: i64, kind: SessionKind, initiated_by: i64) -> Self {
        Self {
            session_id,
            project_id,
            kind,
            status: SessionStatus::Extracted,
            file_count: 0,
            total_size: 0,
            files: Vec::new(),
            skipped: Vec::new(),
            initiated_by,
            created_at: Utc::now(),
            sync_started_at: None,
            sync_finished_at: None,
            synced_by: None,
            error: None,
            error_kind: None,
            transport: None,
            commit_sha: None,
            remote_file_count: None,
            message: None,
            performance: None,
        }
    }

    /// Insert or replace the descriptor for `file.path`, keeping counters
    /// in step.
    pub fn upsert_file(&mut self, file: StagedFile) {
        if let Some(existing) = self.files.iter_mut().find(|f| f.path == file.path) {
            *existing = file;
        } else {
            self.files.push(file);
        }
        self.file_count = self.files.len();
        self.total_size = self.files.iter().map(|f| f.size).sum();
    }
}

/// One line of `history.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub file_count: usize,
    pub total_size: u64,
    pub completed_at: DateTime<Utc>,
    pub initiator: Option<i64>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

impl HistoryEntry {
    pub fn from_metadata(meta: &SessionMetadata, initiator: Option<i64>) -> Self {
        Self {
            session_id: meta.session_id.clone(),
            status: meta.status,
            kind: meta.kind,
            file_count: meta.file_count,
            total_size: meta.total_size,
            completed_at: meta.sync_finished_at.unwrap_or_else(Utc::now),
            initiator: initiator.or(Some(meta.initiated_by)),
            error: meta.error.clone(),
            transport: meta.transport.clone(),
            commit_sha: meta.commit_sha.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64) -> StagedFile {
        StagedFile {
            path: path.into(),
            size,
            mime_type: "text/plain".into(),
            content_kind: ContentKind::Documentation,
            checksum: String::new(),
        }
    }

    #[test]
    fn upsert_replaces_existing_descriptor() {
        let mut meta = SessionMetadata::new("abc".into(), 1, SessionKind::Manual, 7);
        meta.upsert_file(file("a.txt", 10));
        meta.upsert_file(file("b.txt", 5));
        meta.upsert_file(file("a.txt", 3));
        assert_eq!(meta.file_count, 2);
        assert_eq!(meta.total_size, 8);
    }

    #[test]
    fn metadata_uses_type_key_and_lowercase_status() {
        let meta = SessionMetadata::new("abc".into(), 1, SessionKind::Zip, 7);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "zip");
        assert_eq!(json["status"], "extracted");
        assert_eq!(json["file_count"], 0);
    }
}
