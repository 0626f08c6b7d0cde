//! State database trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema::{self, IDENTITY_SCHEME};
use super::types::{StateSummary, SyncRunRecord, SyncRunStats};
use crate::key::ContentKey;
use crate::snapshot::{ImageRecord, Snapshot};

/// Durable storage for the persisted snapshot and sync history.
///
/// Object-safe so the engine can hold an `Arc<dyn StateDb>`.
#[async_trait]
pub trait StateDb: Send + Sync {
    /// Load the persisted snapshot.
    ///
    /// A snapshot written under another identity scheme is cleared once and
    /// an empty snapshot is returned, forcing a full resync.
    async fn load_persisted(&self) -> Result<Snapshot, StateError>;

    /// Replace the persisted snapshot atomically. A crash mid-write leaves
    /// the previous snapshot intact.
    async fn save_persisted(&self, snapshot: &Snapshot) -> Result<(), StateError>;

    /// Start a sync pass for `directory` and return its ID.
    async fn start_sync_run(&self, directory: &Path) -> Result<i64, StateError>;

    /// Complete a sync pass with its counts.
    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError>;

    /// Record (or clear, with `None`) the last engine error.
    async fn set_last_error(&self, message: Option<&str>) -> Result<(), StateError>;

    async fn get_summary(&self) -> Result<StateSummary, StateError>;

    /// Most recent sync passes, newest first.
    async fn recent_sync_runs(&self, limit: u32) -> Result<Vec<SyncRunRecord>, StateError>;
}

/// SQLite implementation of the state database.
pub struct SqliteStateDb {
    /// rusqlite::Connection is not Sync. No lock is held across an await.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStateDb {
    /// Open or create a database at the given path, creating parent
    /// directories as needed.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let open_path = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = open_path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| StateError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let conn = Connection::open(&open_path).map_err(|source| StateError::Open {
                path: open_path.clone(),
                source,
            })?;

            // WAL keeps readers (`imgsync status`) from blocking a running sync.
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Schema)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Schema)?;

            schema::migrate(&conn)?;
            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|source| StateError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn.lock().map_err(|_| StateError::Poisoned)
    }
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, StateError> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?)
}

fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<(), StateError> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn row_to_image_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImageRecord> {
    let size_bytes: i64 = row.get(3)?;
    Ok(ImageRecord {
        content_key: ContentKey::from_stored(row.get(0)?),
        file_path: PathBuf::from(row.get::<_, String>(1)?),
        file_name: row.get(2)?,
        size: size_bytes.max(0) as u64,
        modified_ms: row.get(4)?,
        created_ms: row.get(5)?,
    })
}

/// Read the persisted snapshot, failing with `SchemeMismatch` if it was not
/// written under the current identity scheme.
fn read_persisted(conn: &Connection) -> Result<Snapshot, StateError> {
    let scheme = read_meta(conn, "identity_scheme")?;
    if scheme.as_deref() != Some(IDENTITY_SCHEME) {
        return Err(StateError::SchemeMismatch {
            found: scheme.unwrap_or_else(|| "unknown".to_string()),
            expected: IDENTITY_SCHEME,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT content_key, file_path, file_name, size_bytes, modified_ms, created_ms FROM images",
    )?;
    let records = stmt
        .query_map([], row_to_image_record)?
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(bad) = records.iter().find(|r| r.content_key.looks_like_path()) {
        tracing::debug!(key = %bad.content_key, "Found path-shaped key in persisted snapshot");
        return Err(StateError::SchemeMismatch {
            found: "path".to_string(),
            expected: IDENTITY_SCHEME,
        });
    }

    Ok(records.into_iter().collect())
}

fn reset_persisted(conn: &Connection) -> Result<(), StateError> {
    conn.execute("DELETE FROM images", [])?;
    write_meta(conn, "identity_scheme", IDENTITY_SCHEME)?;
    write_meta(conn, "last_update", &Utc::now().timestamp_millis().to_string())?;
    Ok(())
}

#[async_trait]
impl StateDb for SqliteStateDb {
    async fn load_persisted(&self) -> Result<Snapshot, StateError> {
        let conn = self.conn()?;
        match read_persisted(&conn) {
            Ok(snapshot) => {
                tracing::debug!(images = snapshot.len(), "Loaded persisted snapshot");
                Ok(snapshot)
            }
            Err(StateError::SchemeMismatch { found, expected }) => {
                tracing::warn!(
                    found = %found,
                    expected,
                    "Persisted snapshot was written under another identity scheme; \
                     resetting it for a one-time full resync"
                );
                reset_persisted(&conn)?;
                Ok(Snapshot::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn save_persisted(&self, snapshot: &Snapshot) -> Result<(), StateError> {
        let conn = self.conn()?;

        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| {
            conn.execute("DELETE FROM images", [])?;
            let mut stmt = conn.prepare_cached(
                "INSERT INTO images (content_key, file_path, file_name, size_bytes, modified_ms, created_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in snapshot.records() {
                stmt.execute(rusqlite::params![
                    record.content_key.as_str(),
                    record.file_path.to_string_lossy(),
                    record.file_name,
                    record.size as i64,
                    record.modified_ms,
                    record.created_ms,
                ])?;
            }
            write_meta(&conn, "last_update", &Utc::now().timestamp_millis().to_string())?;
            Ok::<_, StateError>(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                tracing::debug!(images = snapshot.len(), "Saved persisted snapshot");
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    async fn start_sync_run(&self, directory: &Path) -> Result<i64, StateError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_runs (directory, started_at) VALUES (?1, ?2)",
            rusqlite::params![directory.to_string_lossy(), Utc::now().timestamp_millis()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, added = ?2, removed = ?3, failed = ?4, interrupted = ?5 WHERE id = ?6",
            rusqlite::params![
                Utc::now().timestamp_millis(),
                stats.added as i64,
                stats.removed as i64,
                stats.failed as i64,
                stats.interrupted,
                run_id,
            ],
        )?;
        Ok(())
    }

    async fn set_last_error(&self, message: Option<&str>) -> Result<(), StateError> {
        let conn = self.conn()?;
        match message {
            Some(message) => write_meta(&conn, "last_error", message)?,
            None => {
                conn.execute("DELETE FROM meta WHERE key = 'last_error'", [])?;
            }
        }
        Ok(())
    }

    async fn get_summary(&self) -> Result<StateSummary, StateError> {
        let conn = self.conn()?;

        let (total_images, total_bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM images",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let (last_started, last_completed): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MAX(started_at), MAX(completed_at) FROM sync_runs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let last_update = read_meta(&conn, "last_update")?
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(millis_to_datetime);

        Ok(StateSummary {
            total_images: total_images as u64,
            total_bytes: total_bytes as u64,
            last_update,
            last_error: read_meta(&conn, "last_error")?,
            identity_scheme: read_meta(&conn, "identity_scheme")?,
            last_sync_started: last_started.and_then(millis_to_datetime),
            last_sync_completed: last_completed.and_then(millis_to_datetime),
        })
    }

    async fn recent_sync_runs(&self, limit: u32) -> Result<Vec<SyncRunRecord>, StateError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, directory, started_at, completed_at, added, removed, failed, interrupted
             FROM sync_runs ORDER BY id DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map([limit], |row| {
                let started_at: i64 = row.get(2)?;
                let completed_at: Option<i64> = row.get(3)?;
                Ok(SyncRunRecord {
                    id: row.get(0)?,
                    directory: PathBuf::from(row.get::<_, String>(1)?),
                    started_at: millis_to_datetime(started_at).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                    completed_at: completed_at.and_then(millis_to_datetime),
                    stats: SyncRunStats {
                        added: row.get::<_, i64>(4)? as u64,
                        removed: row.get::<_, i64>(5)? as u64,
                        failed: row.get::<_, i64>(6)? as u64,
                        interrupted: row.get(7)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}
