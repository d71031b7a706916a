//! Per-path debounce timers.
//!
//! Each eligible path gets an independent timer for its group's debounce
//! interval; a fresh event cancels and rearms it. When the timer expires
//! it removes itself from the map and runs the capture procedure, so a
//! burst of writes collapses into one snapshot of the final content.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{capture_file, Pipeline};

/// Arms (or rearms) the debounce timer for `path`.
pub(crate) fn schedule_capture(pipeline: &Arc<Pipeline>, path: PathBuf) {
    let Some(group) = pipeline.filter.group_of(&path) else {
        return;
    };
    let delay = Duration::from_secs(group.policy().debounce_sec);

    let timer_pipeline = Arc::clone(pipeline);
    let timer_path = path.clone();

    let mut state = pipeline.state.lock().unwrap();
    if state.closed {
        return;
    }
    if let Some(existing) = state.timers.remove(&path) {
        existing.abort();
    }

    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        {
            let mut state = timer_pipeline.state.lock().unwrap();
            state.timers.remove(&timer_path);
        }
        capture_file(&timer_pipeline, &timer_path).await;
    });
    state.timers.insert(path, handle);
}
