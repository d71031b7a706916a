//! JSON handlers for the history API.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use retrace_core::{HistoryEntry, HistoryError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::diff;
use crate::state::AppState;

const HISTORY_DEFAULT_LIMIT: i64 = 50;
const HISTORY_MAX_LIMIT: i64 = 200;
const SEARCH_DEFAULT_LIMIT: i64 = 20;
const SEARCH_MAX_LIMIT: i64 = 100;

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<HistoryError> for ApiError {
    fn from(err: HistoryError) -> Self {
        match &err {
            HistoryError::NotFound(what) => Self {
                status: StatusCode::NOT_FOUND,
                message: format!("{what} not found"),
            },
            HistoryError::InsufficientStorage { .. } => Self {
                status: StatusCode::INSUFFICIENT_STORAGE,
                message: err.to_string(),
            },
            _ => {
                error!("internal error: {err}");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal server error".to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

fn parse_uuid(value: &str, name: &str) -> Result<String, ApiError> {
    Uuid::parse_str(value)
        .map(|_| value.to_string())
        .map_err(|_| ApiError::bad_request(format!("invalid {name} parameter: not a valid UUID")))
}

#[derive(Deserialize)]
pub struct HistoryParams {
    limit: Option<i64>,
    offset: Option<i64>,
    q: Option<String>,
    /// Comma-separated directory prefixes.
    dirs: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    entries: Vec<HistoryEntry>,
    has_more: bool,
}

pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryPage>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(HISTORY_DEFAULT_LIMIT)
        .clamp(1, HISTORY_MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);
    let query = params.q.as_deref().filter(|q| !q.is_empty());
    let dirs: Vec<String> = params
        .dirs
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect();
    let dir_filter = (!dirs.is_empty()).then_some(dirs.as_slice());

    let mut entries = state
        .store
        .get_recent_history(limit, offset, query, dir_filter)
        .await?;
    let has_more = entries.len() as i64 > limit;
    entries.truncate(limit as usize);

    Ok(Json(HistoryPage { entries, has_more }))
}

#[derive(Deserialize)]
pub struct SearchParams {
    q: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

pub async fn search_files(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Response, ApiError> {
    let limit = params
        .limit
        .unwrap_or(SEARCH_DEFAULT_LIMIT)
        .clamp(1, SEARCH_MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let files = state
        .store
        .search_files(params.q.as_deref().unwrap_or(""), limit, offset)
        .await?;
    Ok(Json(files).into_response())
}

pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_uuid(&id, "id")?;
    let file = state.store.get_file(&id).await?;
    Ok(Json(file).into_response())
}

pub async fn get_snapshots(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_uuid(&id, "id")?;
    let snapshots = state.store.get_snapshots(&id).await?;
    Ok(Json(snapshots).into_response())
}

pub async fn get_renames(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_uuid(&id, "id")?;
    let renames = state.store.get_renames(&id).await?;
    Ok(Json(renames).into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody {
    id: String,
    file_id: String,
    content: String,
    size: i64,
    hash: String,
    timestamp: i64,
}

pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_uuid(&id, "id")?;
    let snapshot = state.store.get_snapshot(&id).await?;

    Ok(Json(SnapshotBody {
        id: snapshot.id,
        file_id: snapshot.file_id,
        content: String::from_utf8_lossy(&snapshot.content).into_owned(),
        size: snapshot.size,
        hash: snapshot.hash,
        timestamp: snapshot.timestamp,
    })
    .into_response())
}

pub async fn download_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_uuid(&id, "id")?;
    let snapshot = state.store.get_snapshot(&id).await?;
    let file = state.store.get_file(&snapshot.file_id).await?;

    let filename = std::path::Path::new(&file.path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());

    Ok((
        [
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
        ],
        snapshot.content,
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct DiffParams {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Serialize)]
struct DiffBody {
    diff: String,
    from: String,
    to: String,
}

pub async fn diff(
    State(state): State<AppState>,
    Query(params): Query<DiffParams>,
) -> Result<Response, ApiError> {
    let to_id = params
        .to
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("missing 'to' parameter"))?;
    let to_id = parse_uuid(to_id, "to")?;
    let to_snapshot = state.store.get_snapshot(&to_id).await?;
    let file = state.store.get_file(&to_snapshot.file_id).await?;

    // Without `from`, diff against an empty baseline (initial snapshot).
    let mut from_id = String::new();
    let mut from_content = String::new();
    if let Some(from) = params.from.as_deref().filter(|f| !f.is_empty()) {
        from_id = parse_uuid(from, "from")?;
        let from_snapshot = state.store.get_snapshot(&from_id).await?;
        from_content = String::from_utf8_lossy(&from_snapshot.content).into_owned();
    }

    let to_content = String::from_utf8_lossy(&to_snapshot.content).into_owned();
    let rendered = diff::unified_diff(&from_content, &to_content, &file.path, &file.path);

    Ok(Json(DiffBody {
        diff: rendered,
        from: from_id,
        to: to_id,
    })
    .into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsBody {
    total_files: i64,
    total_snapshots: i64,
    total_size: i64,
    watch_dirs: Vec<String>,
}

pub async fn stats(State(state): State<AppState>) -> Result<Response, ApiError> {
    let stats = state.store.stats().await?;
    Ok(Json(StatsBody {
        total_files: stats.total_files,
        total_snapshots: stats.total_snapshots,
        total_size: stats.total_size,
        watch_dirs: state
            .watch_dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect(),
    })
    .into_response())
}

pub async fn download_database(State(state): State<AppState>) -> Result<Response, ApiError> {
    let backup_path = state
        .store
        .create_backup_snapshot(&std::env::temp_dir())
        .await?;

    let result = tokio::fs::read(&backup_path).await;
    let _ = tokio::fs::remove_file(&backup_path).await;
    let bytes = result.map_err(HistoryError::Io)?;

    let filename = format!(
        "history-{}.db",
        chrono::Utc::now().format("%Y%m%d-%H%M%S")
    );
    Ok((
        [
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
            (
                header::CONTENT_TYPE,
                "application/x-sqlite3".to_string(),
            ),
        ],
        bytes,
    )
        .into_response())
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_uuid(&id, "id")?;
    state.store.delete_file(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn not_found() -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: "endpoint not found".to_string(),
    }
}
