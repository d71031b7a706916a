//! Bulk onboarding of newly created directories.
//!
//! Files that appear inside a brand-new directory had no prior events in
//! flight, so the scan feeds them straight to the capture procedure
//! without debouncing. A registry keeps two scans of the same root from
//! overlapping, and the walk checks the shutdown signal between entries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::capture::{capture_file, Pipeline};

/// Starts a background scan of `root` unless one is already running.
pub(crate) fn spawn_scan(pipeline: Arc<Pipeline>, root: PathBuf) {
    {
        let mut scans = pipeline.scans.lock().unwrap();
        if !scans.insert(root.clone()) {
            return;
        }
    }

    tokio::spawn(async move {
        let count = scan_tree(&pipeline, &root).await;
        pipeline.scans.lock().unwrap().remove(&root);
        if count > 0 {
            info!(root = %root.display(), files = count, "scan completed");
        }
    });
}

async fn scan_tree(pipeline: &Arc<Pipeline>, root: &Path) -> usize {
    let walk_pipeline = Arc::clone(pipeline);
    let walk_root = root.to_path_buf();

    let paths = tokio::task::spawn_blocking(move || {
        let mut paths = Vec::new();
        let walker = WalkDir::new(&walk_root).into_iter().filter_entry(|entry| {
            !(entry.file_type().is_dir() && walk_pipeline.filter.is_excluded_dir(entry.path()))
        });
        for entry in walker {
            if walk_pipeline.shutdown.is_cancelled() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(root = %walk_root.display(), error = %err, "scan: skipping entry");
                    continue;
                }
            };
            if entry.file_type().is_file() && walk_pipeline.filter.should_track(entry.path()) {
                paths.push(entry.path().to_path_buf());
            }
        }
        paths
    })
    .await
    .unwrap_or_default();

    let mut count = 0;
    for path in paths {
        if pipeline.shutdown.is_cancelled() {
            break;
        }
        capture_file(pipeline, &path).await;
        count += 1;
    }
    count
}
