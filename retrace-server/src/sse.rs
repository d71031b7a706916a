//! Server-sent-events fan-out for committed history.
//!
//! The capture worker announces commits through [`EventBroadcaster`],
//! which pushes onto a broadcast channel; every connected `/api/events`
//! client gets its own receiver. Slow clients that fall behind the
//! channel capacity miss events rather than block the pipeline.

use std::convert::Infallible;
use std::path::Path;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use retrace_core::Notifier;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use crate::state::AppState;

/// Payload pushed to SSE subscribers after each commit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    pub timestamp: i64,
}

/// Bridges the core's notifier capability onto the broadcast channel.
pub struct EventBroadcaster {
    tx: broadcast::Sender<HistoryEvent>,
}

impl EventBroadcaster {
    pub fn new(tx: broadcast::Sender<HistoryEvent>) -> Self {
        Self { tx }
    }
}

impl Notifier for EventBroadcaster {
    fn notify_save(&self, path: &Path) {
        let _ = self.tx.send(HistoryEvent {
            kind: "snapshot",
            file_path: path.display().to_string(),
            old_path: None,
            timestamp: chrono::Utc::now().timestamp(),
        });
    }

    fn notify_rename(&self, old_path: &Path, new_path: &Path) {
        let _ = self.tx.send(HistoryEvent {
            kind: "rename",
            file_path: new_path.display().to_string(),
            old_path: Some(old_path.display().to_string()),
            timestamp: chrono::Utc::now().timestamp(),
        });
    }
}

pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();

    let stream = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(event) => serde_json::to_string(&event)
            .ok()
            .map(|data| Ok(Event::default().data(data))),
        Err(err) => {
            warn!("event broadcast error: {err}");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
