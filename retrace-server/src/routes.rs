use axum::routing::get;
use axum::{middleware, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::{auth, handlers, sse};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/history", get(handlers::history))
        .route("/api/events", get(sse::events))
        .route("/api/files", get(handlers::search_files))
        .route(
            "/api/files/{id}",
            get(handlers::get_file).delete(handlers::delete_file),
        )
        .route("/api/files/{id}/snapshots", get(handlers::get_snapshots))
        .route("/api/files/{id}/renames", get(handlers::get_renames))
        .route("/api/snapshots/{id}", get(handlers::get_snapshot))
        .route(
            "/api/snapshots/{id}/download",
            get(handlers::download_snapshot),
        )
        .route("/api/diff", get(handlers::diff))
        .route("/api/stats", get(handlers::stats))
        .route("/api/database/download", get(handlers::download_database))
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_basic_auth,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
