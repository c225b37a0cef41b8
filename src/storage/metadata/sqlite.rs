//! `SQLite` metadata store.
//!
//! Version numbers are allocated with a counter upsert
//! (`INSERT ... ON CONFLICT DO UPDATE ... RETURNING`) inside a
//! `BEGIN IMMEDIATE` transaction, so allocation, the version insert and the
//! optional head update either all land or none do.

use super::{MetadataStore, VersionCommit};
use crate::models::{FileHead, FileId, FileVersion};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::instrument;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS file_heads (
        file_id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        content_type TEXT NOT NULL,
        storage_path TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS version_counters (
        file_id TEXT PRIMARY KEY,
        last_version INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS file_versions (
        file_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        storage_path TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        change_note TEXT,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (file_id, version)
    );
    CREATE INDEX IF NOT EXISTS idx_file_versions_hash ON file_versions(file_id, content_hash);
";

const VERSION_COLUMNS: &str =
    "file_id, version, storage_path, size_bytes, content_hash, change_note, created_by, created_at";

/// Metadata store backed by a `SQLite` database.
#[derive(Debug)]
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteMetadataStore {
    /// Opens (or creates) the database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::OperationFailed {
                operation: "create_db_dir".to_string(),
                cause: e.to_string(),
            })?;
        }
        let conn = Connection::open(&db_path).map_err(|e| sql_error("open_sqlite", &e))?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Creates an in-memory database (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| sql_error("open_sqlite_in_memory", &e))?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub const fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        configure_connection(&conn);
        conn.execute_batch(SCHEMA)
            .map_err(|e| sql_error("create_schema", &e))
    }
}

/// Acquires the connection lock, recovering from poisoning.
fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("SQLite mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// WAL journaling, NORMAL sync and a 5s busy timeout.
fn configure_connection(conn: &Connection) {
    // journal_mode answers with a row, so failures here are ignored rather
    // than surfaced through execute_batch.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", "5000");
}

fn sql_error(operation: &str, e: &rusqlite::Error) -> Error {
    Error::OperationFailed {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}

fn record_metrics(operation: &'static str, start: Instant, ok: bool) {
    metrics::counter!(
        "version_store_operations_total",
        "backend" => "sqlite",
        "operation" => operation,
        "status" => if ok { "success" } else { "error" }
    )
    .increment(1);
    metrics::histogram!(
        "version_store_operation_duration_ms",
        "backend" => "sqlite",
        "operation" => operation
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<FileVersion> {
    Ok(FileVersion {
        file_id: FileId::new(row.get::<_, String>(0)?),
        version: row.get(1)?,
        storage_path: row.get(2)?,
        size_bytes: from_i64(row.get(3)?),
        content_hash: row.get(4)?,
        change_note: row.get(5)?,
        created_by: row.get(6)?,
        created_at: millis_to_datetime(row.get(7)?),
    })
}

fn row_to_head(row: &Row<'_>) -> rusqlite::Result<FileHead> {
    Ok(FileHead {
        file_id: FileId::new(row.get::<_, String>(0)?),
        owner_id: row.get(1)?,
        filename: row.get(2)?,
        content_type: row.get(3)?,
        storage_path: row.get(4)?,
        content_hash: row.get(5)?,
        size_bytes: from_i64(row.get(6)?),
        updated_at: millis_to_datetime(row.get(7)?),
    })
}

fn upsert_head(conn: &Connection, head: &FileHead) -> Result<()> {
    conn.execute(
        "INSERT INTO file_heads
             (file_id, owner_id, filename, content_type, storage_path, content_hash, size_bytes, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(file_id) DO UPDATE SET
             owner_id = excluded.owner_id,
             filename = excluded.filename,
             content_type = excluded.content_type,
             storage_path = excluded.storage_path,
             content_hash = excluded.content_hash,
             size_bytes = excluded.size_bytes,
             updated_at = excluded.updated_at",
        params![
            head.file_id.as_str(),
            head.owner_id,
            head.filename,
            head.content_type,
            head.storage_path,
            head.content_hash,
            to_i64(head.size_bytes),
            head.updated_at.timestamp_millis(),
        ],
    )
    .map_err(|e| sql_error("upsert_head", &e))?;
    Ok(())
}

fn commit_in_transaction(conn: &Connection, commit: VersionCommit) -> Result<Option<FileVersion>> {
    let file_id = commit.version.file_id.as_str().to_string();

    if commit.skip_if_head_matches {
        let head_hash: Option<String> = conn
            .query_row(
                "SELECT content_hash FROM file_heads WHERE file_id = ?1",
                params![file_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| sql_error("read_head_hash", &e))?;
        if head_hash.as_deref() == Some(commit.version.content_hash.as_str()) {
            return Ok(None);
        }
    }

    let number: u32 = conn
        .query_row(
            "INSERT INTO version_counters (file_id, last_version) VALUES (?1, 1)
             ON CONFLICT(file_id) DO UPDATE SET last_version = last_version + 1
             RETURNING last_version",
            params![file_id],
            |row| row.get(0),
        )
        .map_err(|e| sql_error("allocate_version", &e))?;

    let version = commit.version.into_version(number, Utc::now());
    conn.execute(
        &format!("INSERT INTO file_versions ({VERSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            version.file_id.as_str(),
            version.version,
            version.storage_path,
            to_i64(version.size_bytes),
            version.content_hash,
            version.change_note,
            version.created_by,
            version.created_at.timestamp_millis(),
        ],
    )
    .map_err(|e| sql_error("insert_version", &e))?;

    if let Some(head) = &commit.head {
        upsert_head(conn, head)?;
    }
    Ok(Some(version))
}

impl MetadataStore for SqliteMetadataStore {
    #[instrument(skip(self, commit), fields(backend = "sqlite", file_id = %commit.version.file_id))]
    fn commit_version(&self, commit: VersionCommit) -> Result<Option<FileVersion>> {
        let start = Instant::now();
        let mut conn = acquire_lock(&self.conn);

        // Dropping the transaction without committing rolls it back, so a
        // failed step or a failed COMMIT never leaves the connection inside
        // an open transaction.
        let result = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| sql_error("begin_transaction", &e))
            .and_then(|tx| {
                let version = commit_in_transaction(&tx, commit)?;
                tx.commit()
                    .map_err(|e| sql_error("commit_transaction", &e))?;
                Ok(version)
            });

        record_metrics("commit_version", start, result.is_ok());
        result
    }

    fn list_versions(&self, file_id: &FileId) -> Result<Vec<FileVersion>> {
        let start = Instant::now();
        let conn = acquire_lock(&self.conn);
        let result = (|| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {VERSION_COLUMNS} FROM file_versions
                     WHERE file_id = ?1 ORDER BY version DESC"
                ))
                .map_err(|e| sql_error("prepare_list_versions", &e))?;
            let rows = stmt
                .query_map(params![file_id.as_str()], row_to_version)
                .map_err(|e| sql_error("list_versions", &e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| sql_error("list_versions", &e))
        })();
        record_metrics("list_versions", start, result.is_ok());
        result
    }

    fn get_version(&self, file_id: &FileId, version: u32) -> Result<Option<FileVersion>> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            &format!("SELECT {VERSION_COLUMNS} FROM file_versions WHERE file_id = ?1 AND version = ?2"),
            params![file_id.as_str(), version],
            row_to_version,
        )
        .optional()
        .map_err(|e| sql_error("get_version", &e))
    }

    fn latest_version(&self, file_id: &FileId) -> Result<Option<FileVersion>> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            &format!(
                "SELECT {VERSION_COLUMNS} FROM file_versions
                 WHERE file_id = ?1 ORDER BY version DESC LIMIT 1"
            ),
            params![file_id.as_str()],
            row_to_version,
        )
        .optional()
        .map_err(|e| sql_error("latest_version", &e))
    }

    fn count_versions(&self, file_id: &FileId) -> Result<usize> {
        let conn = acquire_lock(&self.conn);
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM file_versions WHERE file_id = ?1",
                params![file_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| sql_error("count_versions", &e))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    #[instrument(skip(self, versions), fields(backend = "sqlite", file_id = %file_id, count = versions.len()))]
    fn delete_versions(&self, file_id: &FileId, versions: &[u32]) -> Result<usize> {
        let start = Instant::now();
        let conn = acquire_lock(&self.conn);
        let result = (|| {
            let mut stmt = conn
                .prepare("DELETE FROM file_versions WHERE file_id = ?1 AND version = ?2")
                .map_err(|e| sql_error("prepare_delete_versions", &e))?;
            let mut deleted = 0;
            for version in versions {
                deleted += stmt
                    .execute(params![file_id.as_str(), version])
                    .map_err(|e| sql_error("delete_version", &e))?;
            }
            Ok(deleted)
        })();
        record_metrics("delete_versions", start, result.is_ok());
        result
    }

    fn get_head(&self, file_id: &FileId) -> Result<Option<FileHead>> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            "SELECT file_id, owner_id, filename, content_type, storage_path, content_hash, size_bytes, updated_at
             FROM file_heads WHERE file_id = ?1",
            params![file_id.as_str()],
            row_to_head,
        )
        .optional()
        .map_err(|e| sql_error("get_head", &e))
    }

    fn set_head(&self, head: &FileHead) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        upsert_head(&conn, head)
    }
}
