use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use retrace_config::BasicAuth;
use retrace_core::{Notifier, Store};
use retrace_server::{AppState, EventBroadcaster};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tower::ServiceExt;

async fn test_state() -> (TempDir, AppState) {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(Store::open(&tmp.path().join("history.db")).await.unwrap());
    let (events, _) = broadcast::channel(16);
    let state = AppState {
        store,
        events,
        watch_dirs: vec![PathBuf::from("/w")],
        basic_auth: None,
    };
    (tmp, state)
}

async fn get(state: &AppState, uri: &str) -> (StatusCode, Value) {
    let app = retrace_server::router(state.clone());
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn history_lists_saves_and_renames() {
    let (_tmp, state) = test_state().await;
    state.store.save_snapshot("/w/a.txt", b"X").await.unwrap();
    state.store.save_rename("/w/a.txt", "/w/b.txt").await.unwrap();
    state.store.save_snapshot("/w/b.txt", b"Y").await.unwrap();

    let (status, body) = get(&state, "/api/history").await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(body["hasMore"], false);

    let (_, body) = get(&state, "/api/history?limit=1").await;
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);
    assert_eq!(body["hasMore"], true);

    let (_, body) = get(&state, "/api/history?q=b.txt").await;
    let kinds: Vec<&str> = body["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["kind"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"rename"));
    assert!(kinds.contains(&"save"));
}

#[tokio::test]
async fn history_dir_filter_restricts_roots() {
    let (_tmp, state) = test_state().await;
    state.store.save_snapshot("/p/in.txt", b"a").await.unwrap();
    state
        .store
        .save_snapshot("/projects-old/out.txt", b"b")
        .await
        .unwrap();

    let (_, body) = get(&state, "/api/history?dirs=/p").await;
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["filePath"], "/p/in.txt");
}

#[tokio::test]
async fn file_lookup_validates_and_resolves_ids() {
    let (_tmp, state) = test_state().await;
    state.store.save_snapshot("/w/a.txt", b"X").await.unwrap();
    let files = state.store.search_files("a.txt", 10, 0).await.unwrap();
    let id = &files[0].id;

    let (status, body) = get(&state, &format!("/api/files/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "/w/a.txt");

    let (status, _) = get(&state, "/api/files/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing = uuid::Uuid::now_v7();
    let (status, _) = get(&state, &format!("/api/files/{missing}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn snapshot_content_is_decompressed() {
    let (_tmp, state) = test_state().await;
    state
        .store
        .save_snapshot("/w/a.txt", b"snapshot body")
        .await
        .unwrap();
    let files = state.store.search_files("a.txt", 10, 0).await.unwrap();
    let snapshots = state.store.get_snapshots(&files[0].id).await.unwrap();

    let (status, body) = get(&state, &format!("/api/snapshots/{}", snapshots[0].id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "snapshot body");
    assert_eq!(body["size"], 13);
}

#[tokio::test]
async fn snapshot_download_sets_attachment_headers() {
    let (_tmp, state) = test_state().await;
    state.store.save_snapshot("/w/notes.md", b"# hi").await.unwrap();
    let files = state.store.search_files("notes.md", 10, 0).await.unwrap();
    let snapshots = state.store.get_snapshots(&files[0].id).await.unwrap();

    let app = retrace_server::router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/snapshots/{}/download", snapshots[0].id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(disposition.contains("notes.md"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"# hi");
}

#[tokio::test]
async fn diff_renders_changes_between_snapshots() {
    let (_tmp, state) = test_state().await;
    state
        .store
        .save_snapshot("/w/a.txt", b"line one\nline two\n")
        .await
        .unwrap();
    state
        .store
        .save_snapshot("/w/a.txt", b"line one\nline TWO\n")
        .await
        .unwrap();
    let files = state.store.search_files("a.txt", 10, 0).await.unwrap();
    let snapshots = state.store.get_snapshots(&files[0].id).await.unwrap();
    let (newest, oldest) = (&snapshots[0].id, &snapshots[1].id);

    let (status, body) = get(&state, &format!("/api/diff?from={oldest}&to={newest}")).await;
    assert_eq!(status, StatusCode::OK);
    let diff = body["diff"].as_str().unwrap();
    assert!(diff.contains("-line two"));
    assert!(diff.contains("+line TWO"));

    // Without `from`, everything is an addition.
    let (_, body) = get(&state, &format!("/api/diff?to={oldest}")).await;
    assert!(body["diff"].as_str().unwrap().contains("+line one"));

    let (status, _) = get(&state, "/api/diff").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stats_reports_totals_and_roots() {
    let (_tmp, state) = test_state().await;
    state.store.save_snapshot("/w/a.txt", b"12345").await.unwrap();

    let (status, body) = get(&state, "/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalFiles"], 1);
    assert_eq!(body["totalSnapshots"], 1);
    assert_eq!(body["totalSize"], 5);
    assert_eq!(body["watchDirs"][0], "/w");
}

#[tokio::test]
async fn delete_removes_file_history() {
    let (_tmp, state) = test_state().await;
    state.store.save_snapshot("/w/a.txt", b"X").await.unwrap();
    let files = state.store.search_files("a.txt", 10, 0).await.unwrap();
    let id = files[0].id.clone();

    let app = retrace_server::router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/files/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (status, _) = get(&state, &format!("/api/files/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_api_routes_return_json_404() {
    let (_tmp, state) = test_state().await;
    let (status, body) = get(&state, "/api/nonsense").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "endpoint not found");
}

#[tokio::test]
async fn database_download_is_a_sqlite_file() {
    let (_tmp, state) = test_state().await;
    state.store.save_snapshot("/w/a.txt", b"X").await.unwrap();

    let app = retrace_server::router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/database/download")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.starts_with(b"SQLite format 3\0"));
}

#[tokio::test]
async fn basic_auth_guards_every_route() {
    let (_tmp, mut state) = test_state().await;
    state.basic_auth = Some(BasicAuth {
        username: "admin".to_string(),
        password: "secret".to_string(),
    });

    let (status, _) = get(&state, "/api/stats").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let app = retrace_server::router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/stats")
                // base64("admin:secret")
                .header(header::AUTHORIZATION, "Basic YWRtaW46c2VjcmV0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let app = retrace_server::router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/stats")
                .header(header::AUTHORIZATION, "Basic d3Jvbmc6d3Jvbmc=")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn broadcaster_delivers_commit_events() {
    let (_tmp, state) = test_state().await;
    let mut rx = state.events.subscribe();

    let broadcaster = EventBroadcaster::new(state.events.clone());
    broadcaster.notify_save(std::path::Path::new("/w/a.txt"));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind, "snapshot");
    assert_eq!(event.file_path, "/w/a.txt");

    broadcaster.notify_rename(std::path::Path::new("/w/a.txt"), std::path::Path::new("/w/b.txt"));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind, "rename");
    assert_eq!(event.file_path, "/w/b.txt");
    assert_eq!(event.old_path.as_deref(), Some("/w/a.txt"));
}
