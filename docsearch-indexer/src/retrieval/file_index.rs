//! SQLite database holding the file-status table, chunks and indexed folders.
//!
//! ## Database Schema
//!
//! ```sql
//! -- One row per discovered file
//! CREATE TABLE tracked_files (
//!     path TEXT PRIMARY KEY,           -- absolute path
//!     size_bytes INTEGER,
//!     modified_at INTEGER,             -- unix milliseconds
//!     content_hash TEXT,               -- blake3, hex
//!     parser_version INTEGER,
//!     status TEXT,                     -- queued|processing|indexed|failed|error|outdated
//!     chunk_count INTEGER,
//!     error_message TEXT,
//!     last_indexed_at TIMESTAMP,
//!     last_retry_at TIMESTAMP
//! );
//!
//! -- Chunk rows with f16 vectors, keyed by blake3(path, page, offset)
//! CREATE TABLE chunks (
//!     id TEXT PRIMARY KEY,
//!     path TEXT, mtime INTEGER, page INTEGER, byte_offset INTEGER,
//!     text TEXT, vector BLOB, source_type TEXT, title TEXT
//! );
//!
//! -- One row per scanned root
//! CREATE TABLE folders (path TEXT PRIMARY KEY, last_indexed_at TIMESTAMP, total_files INTEGER);
//!
//! -- Vectors by blake3(text) and model, shared across files
//! CREATE TABLE embedding_cache (text_hash TEXT, model TEXT, vector BLOB);
//! ```
//!
//! `FileIndex` owns the tracked-file and folder tables. Chunk rows are read and
//! written through [`crate::storage::sqlite_store::SqliteStore`], which shares
//! the same connection pool.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Name of the database file inside the data directory.
pub const DATABASE_FILE: &str = ".docsearch.db";

/// Processing state of one tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Queued,
    Processing,
    Indexed,
    /// The content cannot be indexed (empty, corrupt). Not retried.
    Failed,
    /// A transient failure outlasted its retries. Retried periodically.
    Error,
    /// Indexed by an older parser version.
    Outdated,
}

impl FileStatus {
    pub const ALL: [FileStatus; 6] = [
        FileStatus::Queued,
        FileStatus::Processing,
        FileStatus::Indexed,
        FileStatus::Failed,
        FileStatus::Error,
        FileStatus::Outdated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Queued => "queued",
            FileStatus::Processing => "processing",
            FileStatus::Indexed => "indexed",
            FileStatus::Failed => "failed",
            FileStatus::Error => "error",
            FileStatus::Outdated => "outdated",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        FileStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| anyhow!("Unknown file status: {s}"))
    }
}

/// A row of the file-status table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedFile {
    pub path: String,
    pub size_bytes: u64,
    /// Modification time in unix milliseconds.
    pub modified_at: i64,
    pub content_hash: Option<String>,
    pub parser_version: u32,
    pub status: FileStatus,
    pub chunk_count: usize,
    pub error_message: Option<String>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl TrackedFile {
    /// A freshly discovered file, waiting to be processed.
    pub fn queued(path: impl Into<String>, size_bytes: u64, modified_at: i64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            modified_at,
            content_hash: None,
            parser_version: 0,
            status: FileStatus::Queued,
            chunk_count: 0,
            error_message: None,
            last_indexed_at: None,
            last_retry_at: None,
        }
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            path: row.try_get("path")?,
            size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
            modified_at: row.try_get("modified_at")?,
            content_hash: row.try_get("content_hash")?,
            parser_version: row.try_get::<i64, _>("parser_version")? as u32,
            status: status.parse()?,
            chunk_count: row.try_get::<i64, _>("chunk_count")? as usize,
            error_message: row.try_get("error_message")?,
            last_indexed_at: row.try_get("last_indexed_at")?,
            last_retry_at: row.try_get("last_retry_at")?,
        })
    }
}

/// One scanned root directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedFolder {
    pub path: String,
    pub last_indexed_at: DateTime<Utc>,
    pub total_files: usize,
}

/// Size, modification time and content hash of a file as last indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub size_bytes: u64,
    pub modified_at: i64,
    pub content_hash: String,
}

const TRACKED_COLUMNS: &str = "path, size_bytes, modified_at, content_hash, parser_version, status, chunk_count, error_message, last_indexed_at, last_retry_at";

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn like_prefix(prefix: &str) -> String {
    let escaped = prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{escaped}%")
}

/// Prefix matching every path strictly below `root`.
pub(crate) fn dir_prefix(root: &str) -> String {
    let separator = std::path::MAIN_SEPARATOR;
    if root.ends_with(separator) {
        root.to_string()
    } else {
        format!("{root}{separator}")
    }
}

#[derive(Clone, Debug)]
pub struct FileIndex {
    location: Option<PathBuf>,
    pool: SqlitePool,
}

impl FileIndex {
    /// Opens (creating if needed) `<base>/.docsearch.db`.
    pub async fn open(base: &Path) -> Result<Self> {
        let db_path = base.join(DATABASE_FILE);

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(&db_path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
                .create_if_missing(true)
                .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::Full)
                .page_size(1 << 16)
                .optimize_on_close(true, 1 << 10),
        )
        .await?;
        Self::new_with_pool(Some(db_path), pool).await
    }

    /// In-memory database for tests. A single connection, so every query sees
    /// the same database.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await?;
        Self::new_with_pool(None, pool).await
    }

    async fn new_with_pool(location: Option<PathBuf>, pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { location, pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_files (
                path TEXT PRIMARY KEY,
                size_bytes INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                content_hash TEXT,
                parser_version INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                last_indexed_at TIMESTAMP,
                last_retry_at TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                mtime INTEGER NOT NULL,
                page INTEGER NOT NULL,
                byte_offset INTEGER NOT NULL,
                text TEXT NOT NULL,
                vector BLOB NOT NULL,
                source_type TEXT NOT NULL,
                title TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                path TEXT PRIMARY KEY,
                last_indexed_at TIMESTAMP NOT NULL,
                total_files INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_cache (
                text_hash TEXT NOT NULL,
                model TEXT NOT NULL,
                vector BLOB NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (text_hash, model)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracked_files_status ON tracked_files(status)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Path of the database file, `None` for in-memory databases.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub async fn get_file(&self, path: &str) -> Result<Option<TrackedFile>> {
        let row = sqlx::query(&format!(
            "SELECT {TRACKED_COLUMNS} FROM tracked_files WHERE path = ?1"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(TrackedFile::from_row).transpose()
    }

    /// Inserts or replaces a file-status row.
    pub async fn upsert_file(&self, file: &TrackedFile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracked_files (path, size_bytes, modified_at, content_hash, parser_version,
                                       status, chunk_count, error_message, last_indexed_at, last_retry_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(path) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                content_hash = excluded.content_hash,
                parser_version = excluded.parser_version,
                status = excluded.status,
                chunk_count = excluded.chunk_count,
                error_message = excluded.error_message,
                last_indexed_at = excluded.last_indexed_at,
                last_retry_at = excluded.last_retry_at
            "#,
        )
        .bind(&file.path)
        .bind(file.size_bytes as i64)
        .bind(file.modified_at)
        .bind(&file.content_hash)
        .bind(file.parser_version as i64)
        .bind(file.status.as_str())
        .bind(file.chunk_count as i64)
        .bind(&file.error_message)
        .bind(file.last_indexed_at)
        .bind(file.last_retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a newly discovered or changed file as queued. An existing row
    /// keeps its fingerprint and chunk count until the file is processed.
    pub async fn mark_queued(&self, path: &str, size_bytes: u64, modified_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracked_files (path, size_bytes, modified_at, status)
            VALUES (?1, ?2, ?3, 'queued')
            ON CONFLICT(path) DO UPDATE SET status = 'queued'
            "#,
        )
        .bind(path)
        .bind(size_bytes as i64)
        .bind(modified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, path: &str, status: FileStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE tracked_files SET status = ?1 WHERE path = ?2")
            .bind(status.as_str())
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `Indexed` with a fresh fingerprint. Clears any previous error.
    pub async fn mark_indexed(
        &self,
        path: &str,
        fingerprint: &Fingerprint,
        parser_version: u32,
        chunk_count: usize,
    ) -> Result<()> {
        let file = TrackedFile {
            path: path.to_string(),
            size_bytes: fingerprint.size_bytes,
            modified_at: fingerprint.modified_at,
            content_hash: Some(fingerprint.content_hash.clone()),
            parser_version,
            status: FileStatus::Indexed,
            chunk_count,
            error_message: None,
            last_indexed_at: Some(Utc::now()),
            last_retry_at: None,
        };
        self.upsert_file(&file).await
    }

    /// `Failed`: a content problem, never retried automatically. The
    /// fingerprint is stored so an unchanged file is not reprocessed.
    pub async fn mark_failed(
        &self,
        path: &str,
        fingerprint: &Fingerprint,
        parser_version: u32,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tracked_files SET
                status = 'failed', size_bytes = ?2, modified_at = ?3, content_hash = ?4,
                parser_version = ?5, chunk_count = 0, error_message = ?6
            WHERE path = ?1
            "#,
        )
        .bind(path)
        .bind(fingerprint.size_bytes as i64)
        .bind(fingerprint.modified_at)
        .bind(&fingerprint.content_hash)
        .bind(parser_version as i64)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `Error`: transient failures exhausted their retries. Stamps
    /// `last_retry_at` for the periodic sweep.
    pub async fn mark_error(&self, path: &str, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tracked_files SET status = 'error', error_message = ?2, last_retry_at = ?3 WHERE path = ?1",
        )
        .bind(path)
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store a new modification time for a file whose content did not change.
    pub async fn refresh_modified_at(&self, path: &str, modified_at: i64) -> Result<()> {
        sqlx::query("UPDATE tracked_files SET modified_at = ?2 WHERE path = ?1")
            .bind(path)
            .bind(modified_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_file(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tracked_files WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Every tracked file, optionally filtered by status, ordered by path.
    pub async fn list_files(&self, status: Option<FileStatus>) -> Result<Vec<TrackedFile>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {TRACKED_COLUMNS} FROM tracked_files WHERE status = ?1 ORDER BY path"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {TRACKED_COLUMNS} FROM tracked_files ORDER BY path"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(TrackedFile::from_row).collect()
    }

    /// Paths of tracked files below `root`.
    pub async fn paths_under(&self, root: &str) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar::<_, String>(
            "SELECT path FROM tracked_files WHERE path LIKE ?1 ESCAPE '\\' ORDER BY path",
        )
        .bind(like_prefix(&dir_prefix(root)))
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    pub async fn status_counts(&self) -> Result<BTreeMap<FileStatus, usize>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tracked_files GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            counts.insert(status.parse()?, count as usize);
        }
        Ok(counts)
    }

    /// Flag every file indexed by a parser older than `parser_version`.
    pub async fn mark_outdated(&self, parser_version: u32) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tracked_files SET status = 'outdated' WHERE parser_version < ?1 AND status IN ('indexed', 'failed')",
        )
        .bind(parser_version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Files in `error` whose last attempt is older than `before`.
    pub async fn errors_due(&self, before: DateTime<Utc>) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar::<_, String>(
            "SELECT path FROM tracked_files WHERE status = 'error' AND (last_retry_at IS NULL OR last_retry_at <= ?1) ORDER BY path",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    pub async fn upsert_folder(&self, path: &str, total_files: usize) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO folders (path, last_indexed_at, total_files) VALUES (?1, ?2, ?3)
            ON CONFLICT(path) DO UPDATE SET
                last_indexed_at = excluded.last_indexed_at,
                total_files = excluded.total_files
            "#,
        )
        .bind(path)
        .bind(Utc::now())
        .bind(total_files as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn folders(&self) -> Result<Vec<IndexedFolder>> {
        let rows = sqlx::query(
            "SELECT path, last_indexed_at, total_files FROM folders ORDER BY last_indexed_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(IndexedFolder {
                    path: row.try_get("path")?,
                    last_indexed_at: row.try_get("last_indexed_at")?,
                    total_files: row.try_get::<i64, _>("total_files")? as usize,
                })
            })
            .collect()
    }

    pub async fn remove_folder(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM folders WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Wipe tracked files, chunks, folders and cached embeddings.
    pub async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM embedding_cache").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM tracked_files").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM folders").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Get the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
