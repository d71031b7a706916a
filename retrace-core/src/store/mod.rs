//! Content-addressed, compressed snapshot storage on SQLite.
//!
//! The store is append-only: snapshots are immutable once written and
//! only removed by retention trimming or an explicit file delete. WAL
//! journaling keeps readers concurrent with the single capture-worker
//! writer. Snapshot content is zstd-compressed; identity is the SHA-256
//! of the uncompressed bytes, which also drives duplicate suppression.

mod migrate;

use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{FromRow, Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::error::{HistoryError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id       TEXT PRIMARY KEY,
    path     TEXT NOT NULL UNIQUE,
    created  INTEGER NOT NULL DEFAULT (unixepoch()),
    updated  INTEGER NOT NULL DEFAULT (unixepoch())
);

CREATE TABLE IF NOT EXISTS snapshots (
    id        TEXT PRIMARY KEY,
    file_id   TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    content   BLOB NOT NULL,
    size      INTEGER NOT NULL,
    hash      TEXT NOT NULL,
    timestamp INTEGER NOT NULL DEFAULT (unixepoch())
);

CREATE INDEX IF NOT EXISTS idx_snapshots_file_ts ON snapshots(file_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON snapshots(timestamp DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);

CREATE TABLE IF NOT EXISTS renames (
    id          TEXT PRIMARY KEY,
    old_file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    new_file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    old_path    TEXT NOT NULL,
    new_path    TEXT NOT NULL,
    timestamp   INTEGER NOT NULL DEFAULT (unixepoch())
);

CREATE INDEX IF NOT EXISTS idx_renames_old_file ON renames(old_file_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_renames_new_file ON renames(new_file_id, timestamp DESC);
"#;

/// A path that has been captured at least once.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TrackedFile {
    pub id: String,
    pub path: String,
    pub created: i64,
    pub updated: i64,
}

/// An immutable capture of one file's content at one moment.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub file_id: String,
    #[serde(skip)]
    #[sqlx(default)]
    pub content: Vec<u8>,
    /// Uncompressed length of the content.
    pub size: i64,
    pub hash: String,
    pub timestamp: i64,
}

/// A record that one path was observed to become another.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Rename {
    pub id: String,
    pub old_file_id: String,
    pub new_file_id: String,
    pub old_path: String,
    pub new_path: String,
    pub timestamp: i64,
}

/// One row of the merged save/rename history view.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    /// Either `save` or `rename`.
    pub kind: String,
    pub file_id: String,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub timestamp: i64,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_files: i64,
    pub total_snapshots: i64,
    /// Sum of uncompressed snapshot sizes.
    pub total_size: i64,
}

/// One item of a snapshot batch.
#[derive(Debug, Clone)]
pub struct SnapshotInput {
    pub path: String,
    pub content: Vec<u8>,
    /// Per-file snapshot cap from the owning group; zero is unbounded.
    pub retention: u32,
}

/// Per-item outcome of a snapshot batch.
#[derive(Debug)]
pub struct SaveOutcome {
    pub path: String,
    /// False when the content matched the latest snapshot (duplicate) or
    /// when the item failed.
    pub saved: bool,
    pub error: Option<HistoryError>,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if necessary) the store at `path`, enables WAL and
    /// NORMAL synchronous mode, creates the schema, and migrates a legacy
    /// integer-id database in place when one is found.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let mut conn = pool.acquire().await?;
        sqlx::raw_sql(SCHEMA).execute(&mut *conn).await?;
        migrate::run_if_needed(&mut conn).await?;
        drop(conn);

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Saves a batch of snapshots in a single transaction, reporting a
    /// per-item outcome for every input.
    ///
    /// Per-item failures inside the transaction are carried in that
    /// item's outcome. When the transaction itself fails to begin or
    /// commit, nothing was persisted and every previously-succeeding
    /// item reports `saved = false` with the transaction error. The
    /// caller retries the entire batch when any outcome's error is the
    /// transient lock error.
    pub async fn save_snapshot_batch(&self, items: &[SnapshotInput]) -> Vec<SaveOutcome> {
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                let message = format!("beginning transaction: {err}");
                return items
                    .iter()
                    .map(|item| SaveOutcome {
                        path: item.path.clone(),
                        saved: false,
                        error: Some(HistoryError::Internal(message.clone())),
                    })
                    .collect();
            }
        };

        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            match save_snapshot_in_tx(&mut tx, item).await {
                Ok(saved) => outcomes.push(SaveOutcome {
                    path: item.path.clone(),
                    saved,
                    error: None,
                }),
                Err(err) => outcomes.push(SaveOutcome {
                    path: item.path.clone(),
                    saved: false,
                    error: Some(err),
                }),
            }
        }

        if let Err(err) = tx.commit().await {
            let message = format!("committing transaction: {err}");
            for outcome in &mut outcomes {
                if outcome.saved && outcome.error.is_none() {
                    outcome.saved = false;
                    outcome.error = Some(HistoryError::Internal(message.clone()));
                }
            }
        }

        outcomes
    }

    /// Saves one snapshot; returns false on duplicate content.
    pub async fn save_snapshot(&self, path: &str, content: &[u8]) -> Result<bool> {
        let item = SnapshotInput {
            path: path.to_string(),
            content: content.to_vec(),
            retention: 0,
        };
        let mut outcomes = self.save_snapshot_batch(std::slice::from_ref(&item)).await;
        let outcome = outcomes.remove(0);
        match outcome.error {
            Some(err) => Err(err),
            None => Ok(outcome.saved),
        }
    }

    /// Records a rename. Returns the destination file id, or `None` when
    /// the source path was never tracked (nothing is recorded then).
    pub async fn save_rename(&self, old_path: &str, new_path: &str) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await?;

        let old_id: Option<String> = sqlx::query_scalar("SELECT id FROM files WHERE path = ?")
            .bind(old_path)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(old_id) = old_id else {
            return Ok(None);
        };

        let now = chrono::Utc::now().timestamp();

        let new_id: Option<String> = sqlx::query_scalar("SELECT id FROM files WHERE path = ?")
            .bind(new_path)
            .fetch_optional(&mut *tx)
            .await?;
        let new_id = match new_id {
            Some(id) => id,
            None => {
                let id = new_uuid();
                sqlx::query("INSERT INTO files (id, path, created, updated) VALUES (?, ?, ?, ?)")
                    .bind(&id)
                    .bind(new_path)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                id
            }
        };

        sqlx::query(
            "INSERT INTO renames (id, old_file_id, new_file_id, old_path, new_path, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(new_uuid())
        .bind(&old_id)
        .bind(&new_id)
        .bind(old_path)
        .bind(new_path)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(new_id))
    }

    /// Files whose path contains the query substring, most recently
    /// updated first.
    pub async fn search_files(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TrackedFile>> {
        let files = sqlx::query_as::<_, TrackedFile>(
            "SELECT id, path, created, updated FROM files
             WHERE path LIKE '%' || ? || '%'
             ORDER BY updated DESC
             LIMIT ? OFFSET ?",
        )
        .bind(query)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    pub async fn get_file(&self, id: &str) -> Result<TrackedFile> {
        sqlx::query_as::<_, TrackedFile>("SELECT id, path, created, updated FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| HistoryError::NotFound(format!("file {id}")))
    }

    /// All snapshots for a file (metadata only), newest first.
    pub async fn get_snapshots(&self, file_id: &str) -> Result<Vec<Snapshot>> {
        let snapshots = sqlx::query_as::<_, Snapshot>(
            "SELECT id, file_id, size, hash, timestamp FROM snapshots
             WHERE file_id = ?
             ORDER BY timestamp DESC, id DESC",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(snapshots)
    }

    /// A single snapshot including its decompressed content.
    pub async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        let row = sqlx::query(
            "SELECT id, file_id, content, size, hash, timestamp FROM snapshots WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HistoryError::NotFound(format!("snapshot {id}")))?;

        let compressed: Vec<u8> = row.get("content");
        let content = decompress(&compressed)?;

        Ok(Snapshot {
            id: row.get("id"),
            file_id: row.get("file_id"),
            content,
            size: row.get("size"),
            hash: row.get("hash"),
            timestamp: row.get("timestamp"),
        })
    }

    /// The merged save/rename history, newest first.
    ///
    /// Returns up to `limit + 1` rows so the caller can tell whether more
    /// history exists without a separate count. `query` filters by path
    /// substring (case-insensitive, covering the old path of renames);
    /// `dir_filter` restricts to entries under any of the given roots.
    pub async fn get_recent_history(
        &self,
        limit: i64,
        offset: i64,
        query: Option<&str>,
        dir_filter: Option<&[String]>,
    ) -> Result<Vec<HistoryEntry>> {
        let mut sql = String::from(
            "SELECT id, kind, file_id, file_path, old_path, new_path, size, hash, timestamp FROM (
                SELECT s.id AS id, 'save' AS kind, s.file_id AS file_id, f.path AS file_path,
                       NULL AS old_path, NULL AS new_path, s.size AS size, s.hash AS hash,
                       s.timestamp AS timestamp
                  FROM snapshots s JOIN files f ON s.file_id = f.id
                UNION ALL
                SELECT r.id, 'rename', r.new_file_id, r.new_path,
                       r.old_path, r.new_path, NULL, NULL, r.timestamp
                  FROM renames r
             )",
        );

        let mut clauses = Vec::new();
        if query.is_some() {
            clauses.push(
                "(file_path LIKE '%' || ? || '%' OR old_path LIKE '%' || ? || '%')".to_string(),
            );
        }
        let dirs = dir_filter.unwrap_or(&[]);
        if !dirs.is_empty() {
            let alternatives = vec!["file_path LIKE ? || '%'"; dirs.len()];
            clauses.push(format!("({})", alternatives.join(" OR ")));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query_as::<_, HistoryEntry>(&sql);
        if let Some(query) = query {
            q = q.bind(query.to_string()).bind(query.to_string());
        }
        for dir in dirs {
            // Append the separator so /p does not match /projects-old.
            let prefix = if dir.ends_with(MAIN_SEPARATOR) {
                dir.clone()
            } else {
                format!("{dir}{MAIN_SEPARATOR}")
            };
            q = q.bind(prefix);
        }
        q = q.bind(limit + 1).bind(offset);

        let entries = q.fetch_all(&self.pool).await?;
        Ok(entries)
    }

    /// Rename records touching a file as source or destination, oldest
    /// first.
    pub async fn get_renames(&self, file_id: &str) -> Result<Vec<Rename>> {
        let renames = sqlx::query_as::<_, Rename>(
            "SELECT id, old_file_id, new_file_id, old_path, new_path, timestamp
             FROM renames
             WHERE old_file_id = ? OR new_file_id = ?
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(file_id)
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(renames)
    }

    /// Deletes a file and, through cascade, its snapshots and renames.
    pub async fn delete_file(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(HistoryError::NotFound(format!("file {id}")));
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<Stats> {
        let total_files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let row = sqlx::query("SELECT COUNT(*), COALESCE(SUM(size), 0) FROM snapshots")
            .fetch_one(&self.pool)
            .await?;
        Ok(Stats {
            total_files,
            total_snapshots: row.get(0),
            total_size: row.get(1),
        })
    }

    /// Estimated database size in bytes from page accounting.
    pub async fn database_size(&self) -> Result<i64> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        Ok(page_count * page_size)
    }

    /// Produces a consistent point-in-time copy of the whole store at a
    /// fresh path under `tmp_dir` using `VACUUM INTO`. Fails fast when the
    /// filesystem does not have room for a full copy. The caller removes
    /// the file when done.
    pub async fn create_backup_snapshot(&self, tmp_dir: &Path) -> Result<PathBuf> {
        let db_size = self.database_size().await?.max(0) as u64;
        let available = available_bytes(tmp_dir)?;
        if db_size > available {
            return Err(HistoryError::InsufficientStorage {
                needed: db_size,
                available,
            });
        }

        let target = tmp_dir.join(format!("history-backup-{}.db", new_uuid()));
        let escaped = target.to_string_lossy().replace('\'', "''");
        if let Err(err) = sqlx::raw_sql(&format!("VACUUM INTO '{escaped}'"))
            .execute(&self.pool)
            .await
        {
            let _ = std::fs::remove_file(&target);
            return Err(err.into());
        }

        info!(path = %target.display(), "database backup written");
        Ok(target)
    }
}

async fn save_snapshot_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    item: &SnapshotInput,
) -> Result<bool> {
    let hash = sha256_hex(&item.content);

    let existing: Option<(String, Option<String>)> = sqlx::query_as(
        "SELECT f.id, (
            SELECT hash FROM snapshots WHERE file_id = f.id
            ORDER BY timestamp DESC, id DESC LIMIT 1
         ) FROM files f WHERE f.path = ?",
    )
    .bind(&item.path)
    .fetch_optional(&mut **tx)
    .await?;

    // Unchanged content produces no new snapshot.
    if let Some((_, Some(last_hash))) = &existing {
        if *last_hash == hash {
            return Ok(false);
        }
    }

    let now = chrono::Utc::now().timestamp();

    let file_id = match existing {
        None => {
            let id = new_uuid();
            sqlx::query("INSERT INTO files (id, path, created, updated) VALUES (?, ?, ?, ?)")
                .bind(&id)
                .bind(&item.path)
                .bind(now)
                .bind(now)
                .execute(&mut **tx)
                .await?;
            id
        }
        Some((id, _)) => {
            sqlx::query("UPDATE files SET updated = ? WHERE id = ?")
                .bind(now)
                .bind(&id)
                .execute(&mut **tx)
                .await?;
            id
        }
    };

    let compressed = compress(&item.content)?;
    sqlx::query(
        "INSERT INTO snapshots (id, file_id, content, size, hash, timestamp)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(new_uuid())
    .bind(&file_id)
    .bind(&compressed)
    .bind(item.content.len() as i64)
    .bind(&hash)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    if item.retention > 0 {
        sqlx::query(
            "DELETE FROM snapshots WHERE file_id = ? AND id NOT IN (
                SELECT id FROM snapshots WHERE file_id = ?
                ORDER BY timestamp DESC, id DESC LIMIT ?
             )",
        )
        .bind(&file_id)
        .bind(&file_id)
        .bind(item.retention as i64)
        .execute(&mut **tx)
        .await?;
    }

    Ok(true)
}

pub(crate) fn new_uuid() -> String {
    Uuid::now_v7().to_string()
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(digest)
}

fn compress(content: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(content, 0).map_err(HistoryError::Compression)
}

fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(compressed).map_err(HistoryError::Compression)
}

#[cfg(unix)]
fn available_bytes(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| HistoryError::Internal(format!("path contains NUL: {}", path.display())))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(HistoryError::Io(std::io::Error::last_os_error()));
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn available_bytes(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}
