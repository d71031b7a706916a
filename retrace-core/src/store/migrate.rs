//! In-place upgrade of a legacy store whose `files` and `snapshots`
//! tables still use integer auto-increment keys. Every row is rewritten
//! with a fresh time-ordered UUID; cross-references are carried over
//! through a temporary mapping table. The whole rewrite is one
//! transaction, so a failure leaves the original data intact.

use std::collections::HashMap;

use sqlx::{Connection, Row, SqliteConnection};
use tracing::info;

use super::new_uuid;
use crate::error::{HistoryError, Result};

pub(super) async fn run_if_needed(conn: &mut SqliteConnection) -> Result<()> {
    if !needs_migration(conn).await? {
        return Ok(());
    }

    info!("migrating store from integer ids to UUIDv7");

    // Referential rewiring below requires foreign keys off; the pragma is
    // a no-op inside a transaction, so set it first.
    sqlx::raw_sql("PRAGMA foreign_keys = OFF")
        .execute(&mut *conn)
        .await?;

    let mut tx = conn.begin().await?;

    sqlx::raw_sql(
        r#"
        CREATE TABLE files_new (
            id       TEXT PRIMARY KEY,
            path     TEXT NOT NULL UNIQUE,
            created  INTEGER NOT NULL DEFAULT (unixepoch()),
            updated  INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE snapshots_new (
            id        TEXT PRIMARY KEY,
            file_id   TEXT NOT NULL REFERENCES files_new(id) ON DELETE CASCADE,
            content   BLOB NOT NULL,
            size      INTEGER NOT NULL,
            hash      TEXT NOT NULL,
            timestamp INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TEMPORARY TABLE id_mapping (
            old_id INTEGER NOT NULL,
            new_id TEXT NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    let file_rows: Vec<(i64, String, i64, i64)> =
        sqlx::query_as("SELECT id, path, created, updated FROM files")
            .fetch_all(&mut *tx)
            .await?;

    for (old_id, path, created, updated) in &file_rows {
        let new_id = new_uuid();
        sqlx::query("INSERT INTO files_new (id, path, created, updated) VALUES (?, ?, ?, ?)")
            .bind(&new_id)
            .bind(path)
            .bind(created)
            .bind(updated)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO id_mapping (old_id, new_id) VALUES (?, ?)")
            .bind(old_id)
            .bind(&new_id)
            .execute(&mut *tx)
            .await?;
    }

    let snapshot_rows =
        sqlx::query("SELECT file_id, content, size, hash, timestamp FROM snapshots")
            .fetch_all(&mut *tx)
            .await?;

    let mapping_rows: Vec<(i64, String)> = sqlx::query_as("SELECT old_id, new_id FROM id_mapping")
        .fetch_all(&mut *tx)
        .await?;
    let id_map: HashMap<i64, String> = mapping_rows.into_iter().collect();

    for row in snapshot_rows {
        let old_file_id: i64 = row.get("file_id");
        let new_file_id = id_map.get(&old_file_id).ok_or_else(|| {
            HistoryError::Internal(format!("no mapping for legacy file_id {old_file_id}"))
        })?;
        sqlx::query(
            "INSERT INTO snapshots_new (id, file_id, content, size, hash, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(new_uuid())
        .bind(new_file_id)
        .bind(row.get::<Vec<u8>, _>("content"))
        .bind(row.get::<i64, _>("size"))
        .bind(row.get::<String, _>("hash"))
        .bind(row.get::<i64, _>("timestamp"))
        .execute(&mut *tx)
        .await?;
    }

    sqlx::raw_sql(
        r#"
        DROP TABLE snapshots;
        DROP TABLE files;
        ALTER TABLE files_new RENAME TO files;
        ALTER TABLE snapshots_new RENAME TO snapshots;

        CREATE INDEX IF NOT EXISTS idx_snapshots_file_ts ON snapshots(file_id, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON snapshots(timestamp DESC, id DESC);
        CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    sqlx::raw_sql("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await?;

    let violations = sqlx::query("PRAGMA foreign_key_check")
        .fetch_all(&mut *conn)
        .await?;
    if !violations.is_empty() {
        return Err(HistoryError::Internal(
            "foreign key integrity check failed after migration".to_string(),
        ));
    }

    info!(files = file_rows.len(), "store migration complete");
    Ok(())
}

/// True when the `files` table still has the legacy integer `id` column.
async fn needs_migration(conn: &mut SqliteConnection) -> Result<bool> {
    let rows = sqlx::query("PRAGMA table_info(files)")
        .fetch_all(&mut *conn)
        .await?;

    for row in rows {
        let name: String = row.get("name");
        if name == "id" {
            let col_type: String = row.get("type");
            return Ok(col_type == "INTEGER");
        }
    }
    Ok(false)
}
