//! The owner object for the whole capture pipeline.
//!
//! `HistoryService` wires filesystem events through the debouncer into
//! the capture queue, runs the single-writer worker, and tears everything
//! down in a fixed order on shutdown: timers first, then the worker's
//! final drain, and the OS subscription last.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use retrace_config::WatchGroup;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureWorker, Pipeline, QUEUE_CAPACITY};
use crate::error::Result;
use crate::filter::PathFilter;
use crate::notifier::Notifier;
use crate::store::Store;
use crate::watch::{WatchService, WatchState};

pub struct HistoryService {
    pipeline: Arc<Pipeline>,
    watch_cancel: CancellationToken,
    watch: WatchService,
    worker: JoinHandle<()>,
}

impl HistoryService {
    /// Subscribes to every group root and starts the capture pipeline.
    pub async fn start(
        groups: Vec<WatchGroup>,
        store: Arc<Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let filter = PathFilter::new(groups)?;
        let (queue, jobs) = mpsc::channel(QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();

        let pipeline = Arc::new(Pipeline {
            filter,
            queue,
            state: Mutex::new(WatchState::default()),
            scans: Mutex::new(HashSet::new()),
            shutdown: shutdown.clone(),
        });

        let worker = tokio::spawn(
            CaptureWorker::new(store, notifier, jobs, shutdown.clone()).run(),
        );

        let watch_cancel = CancellationToken::new();
        let watch = WatchService::start(Arc::clone(&pipeline), watch_cancel.clone()).await?;

        Ok(Self {
            pipeline,
            watch_cancel,
            watch,
            worker,
        })
    }

    /// Stops the pipeline: cancels all debounce timers, clears pending
    /// renames, lets the worker drain the queue as one final batch, and
    /// releases the OS subscription.
    pub async fn shutdown(self) {
        {
            let mut state = self.pipeline.state.lock().unwrap();
            state.closed = true;
            for (_, timer) in state.timers.drain() {
                timer.abort();
            }
            state.pending_renames.clear();
        }

        self.pipeline.shutdown.cancel();
        let _ = self.worker.await;

        self.watch_cancel.cancel();
        self.watch.stop().await;
    }
}
