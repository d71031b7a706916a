//! Capture jobs, the bounded capture queue, and the single-writer worker.
//!
//! Producers (debounce timers, rename pairing, bulk scans) enqueue jobs;
//! the worker is the only task that writes to the store. It batches
//! whatever is queued into one transaction and retries the whole batch on
//! transient lock contention.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HistoryError;
use crate::filter::{looks_binary, PathFilter};
use crate::notifier::Notifier;
use crate::store::{SnapshotInput, Store};
use crate::watch::WatchState;

/// Capacity of the capture queue. Producers await a free slot when the
/// queue is full, which is the backpressure path.
pub(crate) const QUEUE_CAPACITY: usize = 10_000;

const SAVE_RETRY_ATTEMPTS: u32 = 3;
const SAVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A unit of work for the capture worker.
#[derive(Debug)]
pub(crate) enum CaptureJob {
    Save {
        path: PathBuf,
        content: Vec<u8>,
        retention: u32,
    },
    Rename {
        old_path: PathBuf,
        new_path: PathBuf,
    },
}

/// Shared pipeline state: the owner of everything the ingestor, debounce
/// timers, scanners, and worker coordinate through.
pub(crate) struct Pipeline {
    pub filter: PathFilter,
    pub queue: mpsc::Sender<CaptureJob>,
    /// Debounce timers and pending renames, under one lock.
    pub state: Mutex<WatchState>,
    /// Roots currently being bulk-scanned.
    pub scans: Mutex<HashSet<PathBuf>>,
    pub shutdown: CancellationToken,
}

/// The capture procedure: policy checks against the owning group, a full
/// read, the binary gate, then enqueue. Silently abandons paths that
/// vanished during the debounce window.
pub(crate) async fn capture_file(pipeline: &Pipeline, path: &Path) {
    let Some(group) = pipeline.filter.group_of(path) else {
        return;
    };
    let policy = group.policy();

    let Ok(meta) = tokio::fs::metadata(path).await else {
        // Removed between the event and the timer firing.
        return;
    };
    if !meta.is_file() {
        return;
    }
    if meta.len() > policy.max_file_size {
        debug!(path = %path.display(), size = meta.len(), "skipping oversized file");
        return;
    }
    if meta.len() == 0 {
        return;
    }

    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read file");
            return;
        }
    };
    if looks_binary(&content) {
        return;
    }

    let job = CaptureJob::Save {
        path: path.to_path_buf(),
        content,
        retention: policy.max_snapshots,
    };
    // A send error means the worker is gone, i.e. shutdown.
    let _ = pipeline.queue.send(job).await;
}

/// Single consumer of the capture queue and sole writer to the store.
pub(crate) struct CaptureWorker {
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    jobs: mpsc::Receiver<CaptureJob>,
    shutdown: CancellationToken,
}

impl CaptureWorker {
    pub fn new(
        store: Arc<Store>,
        notifier: Arc<dyn Notifier>,
        jobs: mpsc::Receiver<CaptureJob>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            notifier,
            jobs,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    // Drain whatever is still queued as one final batch.
                    let batch = self.drain(Vec::new());
                    if !batch.is_empty() {
                        self.process_batch(batch).await;
                    }
                    return;
                }
                job = self.jobs.recv() => {
                    let Some(first) = job else { return };
                    let batch = self.drain(vec![first]);
                    self.process_batch(batch).await;
                }
            }
        }
    }

    /// Opportunistically pulls every job currently available without
    /// blocking, up to the queue capacity.
    fn drain(&mut self, mut batch: Vec<CaptureJob>) -> Vec<CaptureJob> {
        while batch.len() < QUEUE_CAPACITY {
            match self.jobs.try_recv() {
                Ok(job) => batch.push(job),
                Err(_) => break,
            }
        }
        batch
    }

    async fn process_batch(&self, batch: Vec<CaptureJob>) {
        let mut saves = Vec::new();
        let mut renames = Vec::new();
        for job in batch {
            match job {
                CaptureJob::Save {
                    path,
                    content,
                    retention,
                } => saves.push(SnapshotInput {
                    path: path.to_string_lossy().into_owned(),
                    content,
                    retention,
                }),
                CaptureJob::Rename { old_path, new_path } => renames.push((old_path, new_path)),
            }
        }

        if !saves.is_empty() {
            self.save_batch(&saves).await;
        }
        for (old_path, new_path) in renames {
            self.save_rename(&old_path, &new_path).await;
        }
    }

    async fn save_batch(&self, saves: &[SnapshotInput]) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcomes = self.store.save_snapshot_batch(saves).await;

            let busy = outcomes
                .iter()
                .any(|o| o.error.as_ref().is_some_and(HistoryError::is_busy));
            if busy && attempt < SAVE_RETRY_ATTEMPTS {
                warn!(attempt, "snapshot batch hit lock contention, retrying");
                tokio::time::sleep(SAVE_RETRY_DELAY).await;
                continue;
            }

            for outcome in outcomes {
                match (&outcome.error, outcome.saved) {
                    (None, true) => {
                        info!(path = %outcome.path, "snapshot saved");
                        self.notifier.notify_save(Path::new(&outcome.path));
                    }
                    (None, false) => {
                        debug!(path = %outcome.path, "unchanged content, snapshot skipped");
                    }
                    (Some(err), _) => {
                        warn!(path = %outcome.path, error = %err, "failed to save snapshot");
                    }
                }
            }
            return;
        }
    }

    async fn save_rename(&self, old_path: &Path, new_path: &Path) {
        let old = old_path.to_string_lossy();
        let new = new_path.to_string_lossy();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.save_rename(&old, &new).await {
                Ok(Some(_)) => {
                    info!(old = %old, new = %new, "rename recorded");
                    self.notifier.notify_rename(old_path, new_path);
                    return;
                }
                Ok(None) => {
                    // Source was never tracked; nothing to link.
                    debug!(old = %old, "rename source not tracked, ignoring");
                    return;
                }
                Err(err) if err.is_busy() && attempt < SAVE_RETRY_ATTEMPTS => {
                    warn!(attempt, "rename hit lock contention, retrying");
                    tokio::time::sleep(SAVE_RETRY_DELAY).await;
                }
                Err(err) => {
                    warn!(old = %old, new = %new, error = %err, "failed to record rename");
                    return;
                }
            }
        }
    }
}
