//! Fixtures shared by the unit tests.

use bytes::Bytes;
use sqlx::SqlitePool;
use std::{io::Write, sync::Arc};
use tempfile::TempDir;
use zip::{ZipWriter, write::SimpleFileOptions};

use crate::{
    config::SessionLimits, db, models::project::NewProject, services::session_store::SessionStore,
};

/// A migrated, file-backed database living in its own temp directory.
pub struct TestDb {
    pub pool: Arc<SqlitePool>,
    pub dir: TempDir,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let pool = db::connect(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        Self { pool, dir }
    }

    /// Session store rooted next to the database.
    pub fn store(&self) -> SessionStore {
        SessionStore::new(self.dir.path().join("uploads"), test_limits())
    }
}

pub fn test_limits() -> SessionLimits {
    SessionLimits::default()
}

pub fn new_project(creator_id: i64, creator_percentage: f64) -> NewProject {
    NewProject {
        name: "Demo".into(),
        creator_id,
        initial_creator_percentage: Some(creator_percentage),
        platform_fee: Some(1.0),
        uses_shares: false,
    }
}

/// Build an in-memory ZIP archive from `(path, content)` pairs.
pub fn build_zip(entries: &[(String, Vec<u8>)]) -> Bytes {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (path, content) in entries {
        writer.start_file(path.as_str(), options).unwrap();
        writer.write_all(content).unwrap();
    }
    Bytes::from(writer.finish().unwrap().into_inner())
}
