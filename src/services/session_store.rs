//! src/services/session_store.rs
//!
//! SessionStore: per-upload session directories on local disk.
//!
//! Layout under the workspace root:
//!
//! ```text
//! <root>/<project_id>/
//!   incoming/<session_id>/metadata.json
//!   incoming/<session_id>/workspace/<staged files>
//!   synced/workspace/<mirror of the last synced tree>
//!   history.json
//! ```
//!
//! Metadata and history are always rewritten through a temp file and a
//! rename, so readers never observe a half-written JSON document.

use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use std::{
    collections::HashMap,
    io::{self, Cursor, ErrorKind as IoErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zip::ZipArchive;

use crate::{
    config::SessionLimits,
    errors::ErrorKind,
    models::session::{
        HistoryEntry, SessionKind, SessionMetadata, SessionStatus, SkippedEntry, StagedFile,
    },
    services::path_guard::{self, Decision, GuardError},
};

const METADATA_FILE: &str = "metadata.json";
const HISTORY_FILE: &str = "history.json";
const STAGED_DIR: &str = "workspace";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    InvalidPath(#[from] GuardError),
    #[error("file `{path}` rejected: {reason}")]
    UnsafeFile { path: String, reason: String },
    #[error("upload limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("session `{0}` not found")]
    NotFound(String),
    #[error("file `{path}` not found in session `{session_id}`")]
    FileNotFound { session_id: String, path: String },
    #[error("session `{session_id}` is {status}; cannot {action}")]
    Conflict {
        session_id: String,
        status: SessionStatus,
        action: &'static str,
    },
    #[error("corrupt {what}: {detail}")]
    Corruption { what: String, detail: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidPath(_)
            | SessionError::UnsafeFile { .. }
            | SessionError::LimitExceeded(_)
            | SessionError::Archive(_) => ErrorKind::InvalidPath,
            SessionError::NotFound(_) | SessionError::FileNotFound { .. } => ErrorKind::NotFound,
            SessionError::Conflict { .. } => ErrorKind::SessionConflict,
            SessionError::Corruption { .. } => ErrorKind::Corruption,
            SessionError::Io(_) => ErrorKind::Internal,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Counts returned after staging an archive.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StageSummary {
    pub file_count: usize,
    pub total_size: u64,
    pub staged: usize,
    pub skipped: Vec<SkippedEntry>,
}

/// Result of trying to move a session into `syncing`.
#[derive(Debug)]
pub enum SyncClaim {
    /// The caller owns the run now.
    Started(SessionMetadata),
    /// Nothing to do; the session already reached `completed`.
    AlreadyCompleted(SessionMetadata),
    /// Another run is in flight and not yet stale.
    InFlight(SessionMetadata),
}

/// Filesystem-backed store for upload sessions.
///
/// The store is cheap to clone; clones share the locks that serialize
/// status transitions and history rewrites.
#[derive(Clone)]
pub struct SessionStore {
    /// Parent of every project directory.
    pub root: PathBuf,
    limits: SessionLimits,
    transition_lock: Arc<Mutex<()>>,
    history_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
    /// Number of upcoming metadata writes to fail.
    #[cfg(test)]
    failing_metadata_writes: Arc<std::sync::atomic::AtomicUsize>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>, limits: SessionLimits) -> Self {
        Self {
            root: root.into(),
            limits,
            transition_lock: Arc::new(Mutex::new(())),
            history_locks: Arc::new(Mutex::new(HashMap::new())),
            #[cfg(test)]
            failing_metadata_writes: Arc::default(),
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn project_root(&self, project_id: i64) -> PathBuf {
        self.root.join(project_id.to_string())
    }

    fn incoming_root(&self, project_id: i64) -> PathBuf {
        self.project_root(project_id).join("incoming")
    }

    /// Session directory for an id that already passed [`validate_session_id`].
    fn session_dir(&self, project_id: i64, session_id: &str) -> PathBuf {
        self.incoming_root(project_id).join(session_id)
    }

    fn staged_root(&self, project_id: i64, session_id: &str) -> PathBuf {
        self.session_dir(project_id, session_id).join(STAGED_DIR)
    }

    pub fn synced_root(&self, project_id: i64) -> PathBuf {
        self.project_root(project_id).join("synced").join(STAGED_DIR)
    }

    fn history_path(&self, project_id: i64) -> PathBuf {
        self.project_root(project_id).join(HISTORY_FILE)
    }

    /// Absolute path of a staged file. `relative_path` is sanitized first.
    pub fn staged_file_path(
        &self,
        project_id: i64,
        session_id: &str,
        relative_path: &str,
    ) -> SessionResult<PathBuf> {
        validate_session_id(session_id)?;
        let clean = path_guard::sanitize(relative_path)?;
        Ok(self.staged_root(project_id, session_id).join(clean))
    }

    /// Allocate a session directory and write its initial metadata.
    pub async fn create_session(
        &self,
        project_id: i64,
        initiated_by: i64,
        kind: SessionKind,
    ) -> SessionResult<String> {
        let session_id = Uuid::new_v4().simple().to_string();
        let dir = self.session_dir(project_id, &session_id);
        fs::create_dir_all(&dir).await?;

        let meta = SessionMetadata::new(session_id.clone(), project_id, kind, initiated_by);
        if let Err(err) = self.write_metadata(&meta).await {
            let _ = fs::remove_dir_all(&dir).await;
            return Err(err);
        }

        info!(project_id, session_id = %session_id, ?kind, "created upload session");
        Ok(session_id)
    }

    /// Stream-extract a ZIP archive into the session.
    ///
    /// Any rejected path or exceeded budget aborts the whole session and
    /// removes its directory before the error is returned.
    pub async fn stage_zip(
        &self,
        project_id: i64,
        session_id: &str,
        archive: Bytes,
    ) -> SessionResult<StageSummary> {
        let mut meta = self.read_session(project_id, session_id).await?;
        ensure_stageable(&meta)?;

        let budget = Budget::for_session(&self.limits, &meta);
        let target = self.staged_root(project_id, session_id);
        let allow_scripts = self.limits.allow_shell_scripts;

        let extraction = tokio::task::spawn_blocking(move || {
            extract_archive(archive, &target, budget, allow_scripts)
        })
        .await
        .map_err(|err| SessionError::Io(io::Error::other(err)))?;

        let outcome = match extraction {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(project_id, session_id, error = %err, "archive rejected; discarding session");
                self.discard_session_dir(project_id, session_id).await;
                return Err(err);
            }
        };

        let staged = outcome.files.len();
        for file in outcome.files {
            meta.upsert_file(file);
        }
        meta.skipped.extend(outcome.skipped.iter().cloned());

        self.persist_after_staging(&mut meta).await?;

        info!(
            project_id,
            session_id,
            staged,
            skipped = outcome.skipped.len(),
            total_size = meta.total_size,
            "staged archive"
        );

        Ok(StageSummary {
            file_count: meta.file_count,
            total_size: meta.total_size,
            staged,
            skipped: outcome.skipped,
        })
    }

    /// Stage a single file under `relative_path`.
    pub async fn stage_file(
        &self,
        project_id: i64,
        session_id: &str,
        relative_path: &str,
        content: Bytes,
    ) -> SessionResult<StagedFile> {
        let clean = path_guard::sanitize(relative_path)?;
        if let Decision::Deny(reason) = path_guard::is_safe(&clean, self.limits.allow_shell_scripts)
        {
            return Err(SessionError::UnsafeFile {
                path: clean,
                reason,
            });
        }

        let mut meta = self.read_session(project_id, session_id).await?;
        ensure_stageable(&meta)?;

        let size = content.len() as u64;
        if size > self.limits.max_file_bytes {
            return Err(SessionError::LimitExceeded(format!(
                "`{}` is {} bytes; the per-file limit is {}",
                clean, size, self.limits.max_file_bytes
            )));
        }
        let replaced = meta.files.iter().find(|f| f.path == clean);
        let previous_size = replaced.map(|f| f.size).unwrap_or(0);
        if meta.total_size - previous_size + size > self.limits.max_zip_bytes {
            return Err(SessionError::LimitExceeded(format!(
                "session would hold more than {} bytes",
                self.limits.max_zip_bytes
            )));
        }
        if replaced.is_none() && path_guard::should_sync_to_remote(&clean).is_allowed() {
            let counted = counted_files(&meta) + 1;
            if counted > self.limits.max_files {
                return Err(SessionError::LimitExceeded(format!(
                    "more than {} files",
                    self.limits.max_files
                )));
            }
        }

        let file_path = self.staged_root(project_id, session_id).join(&clean);
        write_atomically(&file_path, &content).await?;

        let descriptor = StagedFile {
            mime_type: path_guard::content_type(&clean).to_string(),
            content_kind: path_guard::classify(&clean),
            checksum: format!("{:x}", md5::compute(&content)),
            path: clean,
            size,
        };
        meta.upsert_file(descriptor.clone());
        self.persist_after_staging(&mut meta).await?;

        debug!(project_id, session_id, path = %descriptor.path, size, "staged file");
        Ok(descriptor)
    }

    /// Mark a session `ready`. No-op when already `completed` or `ready`.
    pub async fn finalize(&self, project_id: i64, session_id: &str) -> SessionResult<SessionMetadata> {
        let _guard = self.transition_lock.lock().await;
        let mut meta = self.read_session(project_id, session_id).await?;
        match meta.status {
            SessionStatus::Completed | SessionStatus::Ready => Ok(meta),
            SessionStatus::Syncing => Err(SessionError::Conflict {
                session_id: session_id.to_string(),
                status: meta.status,
                action: "finalize",
            }),
            SessionStatus::Extracted | SessionStatus::Error => {
                meta.status = SessionStatus::Ready;
                self.write_metadata(&meta).await?;
                info!(project_id, session_id, "session ready");
                Ok(meta)
            }
        }
    }

    /// Load metadata, turning an abandoned `syncing` run into `error`.
    pub async fn read_session(
        &self,
        project_id: i64,
        session_id: &str,
    ) -> SessionResult<SessionMetadata> {
        validate_session_id(session_id)?;
        let meta = self.load_metadata(project_id, session_id).await?;
        self.recover_if_stale(meta).await
    }

    pub async fn list_files(
        &self,
        project_id: i64,
        session_id: &str,
    ) -> SessionResult<Vec<StagedFile>> {
        Ok(self.read_session(project_id, session_id).await?.files)
    }

    /// Open a staged file for streaming, together with its descriptor.
    pub async fn open_file(
        &self,
        project_id: i64,
        session_id: &str,
        relative_path: &str,
    ) -> SessionResult<(StagedFile, fs::File)> {
        let path = self.staged_file_path(project_id, session_id, relative_path)?;
        let clean = path_guard::sanitize(relative_path)?;
        let not_found = || SessionError::FileNotFound {
            session_id: session_id.to_string(),
            path: clean.clone(),
        };

        let descriptor = self
            .read_session(project_id, session_id)
            .await?
            .files
            .into_iter()
            .find(|f| f.path == clean)
            .ok_or_else(not_found)?;
        let file = fs::File::open(&path).await.map_err(|err| {
            if err.kind() == IoErrorKind::NotFound {
                not_found()
            } else {
                SessionError::Io(err)
            }
        })?;
        Ok((descriptor, file))
    }

    /// Remove a session that never started syncing (or failed).
    pub async fn cancel(&self, project_id: i64, session_id: &str) -> SessionResult<()> {
        let _guard = self.transition_lock.lock().await;
        let meta = self.read_session(project_id, session_id).await?;
        if !meta.status.can_cancel() {
            return Err(SessionError::Conflict {
                session_id: session_id.to_string(),
                status: meta.status,
                action: "cancel",
            });
        }
        fs::remove_dir_all(self.session_dir(project_id, session_id)).await?;
        self.prune_empty_dirs(&self.incoming_root(project_id), &self.root)
            .await;
        info!(project_id, session_id, "cancelled upload session");
        Ok(())
    }

    /// Every session of a project, newest first. Unreadable sessions are
    /// logged and left out.
    pub async fn list_sessions(&self, project_id: i64) -> SessionResult<Vec<SessionMetadata>> {
        let incoming = self.incoming_root(project_id);
        let mut entries = match fs::read_dir(&incoming).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_session_id(&name).is_err() {
                continue;
            }
            match self.read_session(project_id, &name).await {
                Ok(meta) => sessions.push(meta),
                Err(err) => warn!(project_id, session_id = %name, error = %err, "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Append to `history.json` with a read-modify-rename under a
    /// per-project lock. A corrupt log is set aside rather than blocking
    /// new entries.
    pub async fn append_history(&self, project_id: i64, entry: HistoryEntry) -> SessionResult<()> {
        let lock = self.history_lock(project_id).await;
        let _guard = lock.lock().await;

        let path = self.history_path(project_id);
        let mut history = match read_history_file(&path).await {
            Ok(history) => history,
            Err(SessionError::Corruption { detail, .. }) => {
                let backup = path.with_file_name(format!(
                    "{}.corrupt-{}",
                    HISTORY_FILE,
                    Utc::now().format("%Y%m%d%H%M%S")
                ));
                error!(
                    alert = true,
                    project_id,
                    backup = %backup.display(),
                    detail = %detail,
                    "history log is corrupt; moving it aside"
                );
                fs::rename(&path, &backup).await?;
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        history.push(entry);
        let encoded = serde_json::to_vec_pretty(&history)
            .map_err(|err| SessionError::Io(io::Error::other(err)))?;
        write_atomically(&path, &encoded).await?;
        Ok(())
    }

    pub async fn list_history(&self, project_id: i64) -> SessionResult<Vec<HistoryEntry>> {
        read_history_file(&self.history_path(project_id)).await
    }

    /// Move a session into `syncing` unless it is complete or already
    /// owned by a live run.
    pub async fn claim_for_sync(
        &self,
        project_id: i64,
        session_id: &str,
        initiator: Option<i64>,
    ) -> SessionResult<SyncClaim> {
        let _guard = self.transition_lock.lock().await;
        let mut meta = self.read_session(project_id, session_id).await?;
        match meta.status {
            SessionStatus::Completed => Ok(SyncClaim::AlreadyCompleted(meta)),
            SessionStatus::Syncing => Ok(SyncClaim::InFlight(meta)),
            status if status.can_start_sync() => {
                meta.status = SessionStatus::Syncing;
                meta.sync_started_at = Some(Utc::now());
                meta.sync_finished_at = None;
                meta.synced_by = initiator;
                meta.error = None;
                meta.error_kind = None;
                self.write_metadata(&meta).await?;
                Ok(SyncClaim::Started(meta))
            }
            status => Err(SessionError::Conflict {
                session_id: session_id.to_string(),
                status,
                action: "sync",
            }),
        }
    }

    /// Persist a terminal state for a run that this process owns.
    pub async fn finish_sync(&self, meta: &mut SessionMetadata) -> SessionResult<()> {
        let _guard = self.transition_lock.lock().await;
        let finished = Utc::now();
        meta.sync_finished_at = Some(match meta.sync_started_at {
            Some(started) if started > finished => started,
            _ => finished,
        });
        self.write_metadata(meta).await
    }

    /// Replace the project's `synced/workspace` mirror with the files of a
    /// session that passed the remote filter. Returns the number copied.
    pub async fn mirror_to_synced(
        &self,
        project_id: i64,
        session_id: &str,
        files: &[StagedFile],
    ) -> SessionResult<usize> {
        let mirror = self.synced_root(project_id);
        match fs::remove_dir_all(&mirror).await {
            Ok(()) => {}
            Err(err) if err.kind() == IoErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&mirror).await?;

        let source_root = self.staged_root(project_id, session_id);
        let mut copied = 0;
        for file in files {
            if !path_guard::should_sync_to_remote(&file.path).is_allowed() {
                continue;
            }
            let destination = mirror.join(&file.path);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(source_root.join(&file.path), &destination).await?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Count files whose content differs from the `synced/` mirror.
    pub async fn changed_since_last_sync(&self, project_id: i64, files: &[StagedFile]) -> usize {
        let mirror = self.synced_root(project_id);
        let mut changed = 0;
        for file in files {
            match fs::read(mirror.join(&file.path)).await {
                Ok(previous) if format!("{:x}", md5::compute(&previous)) == file.checksum => {}
                _ => changed += 1,
            }
        }
        changed
    }

    /// Remove everything stored for a project.
    pub async fn remove_project(&self, project_id: i64) -> SessionResult<()> {
        match fs::remove_dir_all(self.project_root(project_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Write `metadata.json` through a temp file + rename.
    pub async fn write_metadata(&self, meta: &SessionMetadata) -> SessionResult<()> {
        let path = self
            .session_dir(meta.project_id, &meta.session_id)
            .join(METADATA_FILE);
        let encoded = serde_json::to_vec_pretty(meta)
            .map_err(|err| SessionError::Io(io::Error::other(err)))?;
        self.metadata_fault()?;
        write_atomically(&path, &encoded).await?;
        Ok(())
    }

    #[cfg(test)]
    fn metadata_fault(&self) -> SessionResult<()> {
        use std::sync::atomic::Ordering;
        let armed = self
            .failing_metadata_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(SessionError::Io(io::Error::other("disk full")));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn metadata_fault(&self) -> SessionResult<()> {
        Ok(())
    }

    async fn load_metadata(&self, project_id: i64, session_id: &str) -> SessionResult<SessionMetadata> {
        let path = self.session_dir(project_id, session_id).join(METADATA_FILE);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                return Err(SessionError::NotFound(session_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&raw).map_err(|err| {
            error!(
                alert = true,
                project_id,
                session_id,
                error = %err,
                "session metadata is corrupt"
            );
            SessionError::Corruption {
                what: format!("metadata for session `{}`", session_id),
                detail: err.to_string(),
            }
        })
    }

    async fn recover_if_stale(&self, mut meta: SessionMetadata) -> SessionResult<SessionMetadata> {
        if meta.status != SessionStatus::Syncing {
            return Ok(meta);
        }
        let threshold = TimeDelta::from_std(self.limits.stale_sync).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        let stale = match meta.sync_started_at {
            Some(started) => now.signed_duration_since(started) > threshold,
            None => true,
        };
        if !stale {
            return Ok(meta);
        }

        let message = format!(
            "Sync timeout after {}s (server restart or crash)",
            self.limits.stale_sync.as_secs()
        );
        warn!(
            project_id = meta.project_id,
            session_id = %meta.session_id,
            "recovering stale syncing session"
        );
        meta.status = SessionStatus::Error;
        meta.error = Some(message);
        meta.error_kind = Some(ErrorKind::Timeout.as_str().to_string());
        meta.sync_finished_at = Some(now);
        self.write_metadata(&meta).await?;
        Ok(meta)
    }

    /// Save metadata after new files landed; on failure keep the files and
    /// flag the session so an operator can inspect it.
    async fn persist_after_staging(&self, meta: &mut SessionMetadata) -> SessionResult<()> {
        if let Err(err) = self.write_metadata(meta).await {
            error!(
                project_id = meta.project_id,
                session_id = %meta.session_id,
                error = %err,
                "failed to write metadata after staging"
            );
            meta.status = SessionStatus::Error;
            meta.error = Some(format!("metadata write failed after staging: {}", err));
            meta.error_kind = Some(ErrorKind::Internal.as_str().to_string());
            let _ = self.write_metadata(meta).await;
            return Err(err);
        }
        Ok(())
    }

    async fn discard_session_dir(&self, project_id: i64, session_id: &str) {
        let dir = self.session_dir(project_id, session_id);
        if let Err(err) = fs::remove_dir_all(&dir).await {
            if err.kind() != IoErrorKind::NotFound {
                warn!("failed to remove session directory {}: {}", dir.display(), err);
            }
        }
        self.prune_empty_dirs(&self.incoming_root(project_id), &self.root)
            .await;
    }

    async fn history_lock(&self, project_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.history_locks.lock().await;
        locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Recursively remove empty directories up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == IoErrorKind::NotFound => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == IoErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Session ids are 32 lowercase hex digits; anything else never touches disk.
pub fn validate_session_id(session_id: &str) -> SessionResult<()> {
    let well_formed = session_id.len() == 32
        && session_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(SessionError::NotFound(session_id.chars().take(64).collect()))
    }
}

fn ensure_stageable(meta: &SessionMetadata) -> SessionResult<()> {
    if meta.status == SessionStatus::Extracted {
        Ok(())
    } else {
        Err(SessionError::Conflict {
            session_id: meta.session_id.clone(),
            status: meta.status,
            action: "stage files",
        })
    }
}

/// Files that consume the entry budget (build artifacts do not).
fn counted_files(meta: &SessionMetadata) -> usize {
    meta.files
        .iter()
        .filter(|f| path_guard::should_sync_to_remote(&f.path).is_allowed())
        .count()
}

async fn read_history_file(path: &Path) -> SessionResult<Vec<HistoryEntry>> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&raw).map_err(|err| SessionError::Corruption {
        what: format!("history log {}", path.display()),
        detail: err.to_string(),
    })
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
async fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| io::Error::other("path missing parent directory"))?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

/// Remaining allowance for one staging call. `sizes` tracks every path the
/// session holds so far, including entries earlier in the same archive, so
/// a replaced path gives its bytes back instead of counting twice.
#[derive(Debug, Clone)]
struct Budget {
    max_file_bytes: u64,
    max_total_bytes: u64,
    max_files: usize,
    used_bytes: u64,
    used_files: usize,
    sizes: HashMap<String, u64>,
}

impl Budget {
    fn for_session(limits: &SessionLimits, meta: &SessionMetadata) -> Self {
        Self {
            max_file_bytes: limits.max_file_bytes,
            max_total_bytes: limits.max_zip_bytes,
            max_files: limits.max_files,
            used_bytes: meta.total_size,
            used_files: counted_files(meta),
            sizes: meta
                .files
                .iter()
                .map(|f| (f.path.clone(), f.size))
                .collect(),
        }
    }

    /// Bytes already held at `path`, if the path is staged.
    fn previous(&self, path: &str) -> Option<u64> {
        self.sizes.get(path).copied()
    }

    fn record(&mut self, path: String, previous: u64, written: u64) {
        self.used_bytes = self.used_bytes - previous + written;
        self.sizes.insert(path, written);
    }
}

#[derive(Debug, Default)]
struct Extraction {
    files: Vec<StagedFile>,
    skipped: Vec<SkippedEntry>,
}

/// Blocking ZIP extraction into `target`. Sizes are enforced on the bytes
/// actually inflated, never on what the archive declares.
fn extract_archive(
    archive: Bytes,
    target: &Path,
    mut budget: Budget,
    allow_shell_scripts: bool,
) -> SessionResult<Extraction> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;
    let mut out = Extraction::default();

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        if entry.is_dir() {
            continue;
        }

        let raw_name = entry.name().to_string();
        let clean = path_guard::sanitize(&raw_name)?;

        if let Decision::Deny(reason) = path_guard::is_safe(&clean, allow_shell_scripts) {
            warn!(path = %clean, reason = %reason, "skipping unsafe archive entry");
            out.skipped.push(SkippedEntry {
                path: clean,
                reason,
            });
            continue;
        }

        if entry.size() > budget.max_file_bytes {
            return Err(SessionError::LimitExceeded(format!(
                "`{}` declares {} bytes; the per-file limit is {}",
                clean,
                entry.size(),
                budget.max_file_bytes
            )));
        }

        let previous = budget.previous(&clean);
        if previous.is_none() && path_guard::should_sync_to_remote(&clean).is_allowed() {
            budget.used_files += 1;
            if budget.used_files > budget.max_files {
                return Err(SessionError::LimitExceeded(format!(
                    "archive holds more than {} files",
                    budget.max_files
                )));
            }
        }

        let destination = target.join(&clean);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let previous = previous.unwrap_or(0);
        let remaining_total = budget
            .max_total_bytes
            .saturating_sub(budget.used_bytes - previous);
        let cap = budget.max_file_bytes.min(remaining_total);
        let mut writer = HashingWriter::new(std::fs::File::create(&destination)?);
        let written = io::copy(&mut (&mut entry).take(cap + 1), &mut writer)?;

        if written > cap {
            return Err(if cap == budget.max_file_bytes {
                SessionError::LimitExceeded(format!(
                    "`{}` exceeds the per-file limit of {} bytes",
                    clean, budget.max_file_bytes
                ))
            } else {
                SessionError::LimitExceeded(format!(
                    "archive expands beyond {} bytes",
                    budget.max_total_bytes
                ))
            });
        }
        budget.record(clean.clone(), previous, written);
        let checksum = writer.finish()?;

        out.files.push(StagedFile {
            mime_type: path_guard::content_type(&clean).to_string(),
            content_kind: path_guard::classify(&clean),
            checksum,
            path: clean,
            size: written,
        });
    }

    Ok(out)
}

/// File writer that computes an MD5 of everything written through it.
struct HashingWriter {
    file: std::fs::File,
    digest: md5::Context,
}

impl HashingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file,
            digest: md5::Context::new(),
        }
    }

    fn finish(mut self) -> io::Result<String> {
        self.file.flush()?;
        Ok(format!("{:x}", self.digest.compute()))
    }
}

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.digest.consume(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
