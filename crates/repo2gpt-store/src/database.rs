use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// Shared handle to the job database. Clones share one connection; every
/// repository serializes through its mutex.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    /// `None` for an in-memory database.
    file: Option<PathBuf>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let db = Self::prepare(Connection::open(path)?, Some(path.to_owned()))?;
        info!(path = %path.display(), "job database opened");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory()?, None)
    }

    fn prepare(conn: Connection, file: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute_batch(schema::PRAGMAS)?;
        conn.execute_batch(schema::CREATE_TABLES)?;
        conn.execute(
            "INSERT INTO schema_version (version)
             SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
            [schema::SCHEMA_VERSION],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            file,
        })
    }

    /// Run `f` against the connection without a transaction.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        f(&self.conn.lock())
    }

    /// Run `f` inside a transaction; commits only if `f` succeeds.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Fold the WAL back into the database file. No-op in memory.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        if self.file.is_none() {
            return Ok(());
        }
        self.with_conn(|conn| Ok(conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?))
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version_rows(db: &Database) -> i64 {
        db.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))?))
            .unwrap()
    }

    #[test]
    fn in_memory_has_schema() {
        let db = Database::in_memory().unwrap();
        assert!(db.file().is_none());
        assert_eq!(version_rows(&db), 1);

        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
                let names = stmt.query_map([], |row| row.get(0))?;
                Ok(names.collect::<Result<_, _>>()?)
            })
            .unwrap();
        for t in ["jobs", "job_events", "job_artifacts", "job_chunks"] {
            assert!(tables.iter().any(|name| name == t), "missing {t}");
        }
    }

    #[test]
    fn reopen_file_database_keeps_single_version_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/jobs.db");
        let db = Database::open(&path).unwrap();
        assert_eq!(db.file(), Some(path.as_path()));
        drop(db);

        let db = Database::open(&path).unwrap();
        assert_eq!(version_rows(&db), 1);
        db.checkpoint().unwrap();
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let db = Database::in_memory().unwrap();
        let res: Result<(), StoreError> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, status, request, created_at, updated_at)
                 VALUES ('job_x', 'pending', '{}', 't', 't')",
                [],
            )?;
            Err(StoreError::Database("boom".into()))
        });
        assert!(res.is_err());
        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
