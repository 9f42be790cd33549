use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Local;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use tracing::info;

use super::{Blob, BlobStore, VersionToken};
use crate::error::{Result, StoreError};

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Blobs in a local SQLite database, with a commit history per path.
///
/// Writes open an `IMMEDIATE` transaction, so a second process waits for the
/// lock (up to [`BUSY_TIMEOUT`]) and then sees the committed version.
pub struct SqliteBlobStore {
    conn: Mutex<Connection>,
}

/// One entry of a blob's commit history.
#[derive(Debug, Clone, Serialize)]
pub struct BlobCommit {
    pub version: i64,
    pub message: String,
    pub committed_at: String,
}

impl SqliteBlobStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            StoreError::backend(format!("failed to open database {}: {e}", path.display()))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = SqliteBlobStore {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteBlobStore {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS blobs (
                    path TEXT PRIMARY KEY NOT NULL,
                    content TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS blob_commits (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    path TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    message TEXT NOT NULL,
                    committed_at TEXT NOT NULL
                );

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_blob_commits_path ON blob_commits(path, version);

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    /// Commit history for `path`, newest first.
    pub fn commits(&self, path: &str) -> Result<Vec<BlobCommit>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT version, message, committed_at FROM blob_commits
             WHERE path = ?1 ORDER BY version DESC",
        )?;
        let commits = stmt
            .query_map(params![path], |row| {
                Ok(BlobCommit {
                    version: row.get(0)?,
                    message: row.get(1)?,
                    committed_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(commits)
    }
}

fn record_commit(conn: &Connection, path: &str, version: i64, message: &str, now: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO blob_commits (path, version, message, committed_at) VALUES (?1, ?2, ?3, ?4)",
        params![path, version, message, now],
    )?;
    Ok(())
}

impl BlobStore for SqliteBlobStore {
    fn get(&self, path: &str) -> Result<Blob> {
        let conn = self.conn();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT content, version FROM blobs WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (content, version) = row.ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        Ok(Blob {
            content,
            version: VersionToken::new(version.to_string()),
        })
    }

    fn put(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: &VersionToken,
    ) -> Result<VersionToken> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM blobs WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        // A token that is not a number can never match.
        let Ok(expected_version) = expected.as_str().parse::<i64>() else {
            return Err(StoreError::conflict(path));
        };

        let now = Local::now().to_rfc3339();
        let next = current + 1;
        let updated = tx.execute(
            "UPDATE blobs SET content = ?1, version = ?2, updated_at = ?3
             WHERE path = ?4 AND version = ?5",
            params![content, next, now, path, expected_version],
        )?;
        if updated == 0 {
            return Err(StoreError::conflict(path));
        }
        record_commit(&tx, path, next, message, &now)?;
        tx.commit()?;

        info!(path, version = next, message, "blob committed");
        Ok(VersionToken::new(next.to_string()))
    }

    fn create(&self, path: &str, content: &str, message: &str) -> Result<VersionToken> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Local::now().to_rfc3339();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO blobs (path, content, version, updated_at) VALUES (?1, ?2, 1, ?3)",
            params![path, content, now],
        )?;
        if inserted == 0 {
            return Err(StoreError::conflict(path));
        }
        record_commit(&tx, path, 1, message, &now)?;
        tx.commit()?;

        info!(path, version = 1, message, "blob created");
        Ok(VersionToken::new("1"))
    }
}
