use std::path::PathBuf;
use std::sync::Arc;

use retrace_config::BasicAuth;
use retrace_core::Store;
use tokio::sync::broadcast;

use crate::sse::HistoryEvent;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub events: broadcast::Sender<HistoryEvent>,
    pub watch_dirs: Vec<PathBuf>,
    pub basic_auth: Option<BasicAuth>,
}
