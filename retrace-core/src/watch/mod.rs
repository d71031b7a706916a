//! Filesystem-event ingestion.
//!
//! A single `notify` watcher covers every configured root, registered
//! directory by directory so excluded subtrees never enter the
//! subscription. Raw events are bridged from the notify callback thread
//! into a tokio channel and classified here: writes feed the debouncer,
//! directory creations extend the subscription and trigger a bulk scan,
//! and rename pre-events are held for pairing with a subsequent creation.

pub(crate) mod debounce;
pub(crate) mod scanner;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::capture::{CaptureJob, Pipeline};
use crate::error::{HistoryError, Result};
use crate::watch::debounce::schedule_capture;

/// How long a rename pre-event waits for its matching creation.
const RENAME_WINDOW: Duration = Duration::from_millis(500);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Debounce timers and pending renames. One lock covers both because the
/// rename path consults trackability while timers may be rearming for the
/// same paths.
#[derive(Default)]
pub(crate) struct WatchState {
    pub timers: HashMap<PathBuf, JoinHandle<()>>,
    pub pending_renames: HashMap<PathBuf, Instant>,
    /// Set during shutdown; no new timers or pending entries after this.
    pub closed: bool,
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

/// The live OS subscription plus its event loop task.
pub(crate) struct WatchService {
    events_task: JoinHandle<()>,
}

impl WatchService {
    /// Builds the watcher, registers every group root recursively, and
    /// starts the event loop. The watcher itself lives inside the loop
    /// task so new directories can be added to the subscription; dropping
    /// the task releases the subscription.
    pub async fn start(pipeline: Arc<Pipeline>, cancel: CancellationToken) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WatchMessage>(EVENT_CHANNEL_CAPACITY);

        let build_pipeline = Arc::clone(&pipeline);
        let watcher = tokio::task::spawn_blocking(move || -> Result<RecommendedWatcher> {
            let mut watcher = RecommendedWatcher::new(
                move |res: std::result::Result<Event, notify::Error>| match res {
                    Ok(event) => {
                        let _ = tx.blocking_send(WatchMessage::Event(event));
                    }
                    Err(err) => {
                        let _ = tx.blocking_send(WatchMessage::Error(err.to_string()));
                    }
                },
                NotifyConfig::default(),
            )?;
            for root in build_pipeline.filter.roots() {
                register_tree(&mut watcher, &build_pipeline, &root)?;
            }
            Ok(watcher)
        })
        .await
        .map_err(|err| HistoryError::Internal(format!("watcher initialization panicked: {err}")))??;

        let events_task = tokio::spawn(event_loop(pipeline, watcher, rx, cancel));
        Ok(Self { events_task })
    }

    /// Waits for the event loop to exit after its cancellation token has
    /// been triggered, releasing the OS subscription.
    pub async fn stop(self) {
        let _ = self.events_task.await;
    }
}

async fn event_loop(
    pipeline: Arc<Pipeline>,
    mut watcher: RecommendedWatcher,
    mut rx: mpsc::Receiver<WatchMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    WatchMessage::Error(err) => warn!("watcher error: {err}"),
                    WatchMessage::Event(event) => {
                        handle_event(&pipeline, &mut watcher, event).await;
                    }
                }
            }
        }
    }
    drop(watcher);
}

async fn handle_event(pipeline: &Arc<Pipeline>, watcher: &mut RecommendedWatcher, event: Event) {
    match event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                handle_creation(pipeline, watcher, path).await;
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            if let Some(path) = event.paths.first() {
                note_pending_rename(pipeline, path.clone());
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            if let Some(path) = event.paths.first() {
                handle_creation(pipeline, watcher, path).await;
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.iter();
            if let Some(old) = paths.next() {
                note_pending_rename(pipeline, old.clone());
            }
            if let Some(new) = paths.next() {
                handle_creation(pipeline, watcher, new).await;
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Platform reported a rename without saying which side; treat
            // it as the source pre-event, like the single-path OS event.
            if let Some(path) = event.paths.first() {
                note_pending_rename(pipeline, path.clone());
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                if pipeline.filter.should_track(path) {
                    schedule_capture(pipeline, path.clone());
                }
            }
        }
        EventKind::Access(_) | EventKind::Remove(_) | EventKind::Any | EventKind::Other => {}
    }
}

/// A creation event: first try to pair it with a pending rename, then
/// either extend the subscription (directories) or debounce a capture
/// (eligible files).
async fn handle_creation(pipeline: &Arc<Pipeline>, watcher: &mut RecommendedWatcher, path: &Path) {
    let meta = tokio::fs::metadata(path).await.ok();

    if meta.as_ref().is_some_and(|m| m.is_dir()) {
        if !pipeline.filter.is_excluded_dir(path) {
            if let Err(err) = register_tree(watcher, pipeline, path) {
                warn!(path = %path.display(), error = %err, "failed to watch new directory");
            }
            scanner::spawn_scan(Arc::clone(pipeline), path.to_path_buf());
        }
        return;
    }

    if let Some(old) = pair_rename(pipeline, path).await {
        debug!(old = %old.display(), new = %path.display(), "rename paired");
    }

    if pipeline.filter.should_track(path) {
        schedule_capture(pipeline, path.to_path_buf());
    }
}

/// Records a rename pre-event and schedules its expiry sweep.
fn note_pending_rename(pipeline: &Arc<Pipeline>, path: PathBuf) {
    let noted_at = Instant::now();
    {
        let mut state = pipeline.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.pending_renames.insert(path.clone(), noted_at);
    }

    // Sweep the entry once the pairing window has passed, unless a newer
    // pre-event replaced it.
    let pipeline = Arc::clone(pipeline);
    tokio::spawn(async move {
        tokio::time::sleep(RENAME_WINDOW).await;
        let mut state = pipeline.state.lock().unwrap();
        if state.pending_renames.get(&path) == Some(&noted_at) {
            state.pending_renames.remove(&path);
        }
    });
}

/// Tries to consume a pending rename for a creation at `new_path`.
/// Entries older than the window are dropped; among the rest, the oldest
/// whose source was trackable wins. The paired rename is dispatched as a
/// job; the caller still treats the creation as a save candidate.
async fn pair_rename(pipeline: &Arc<Pipeline>, new_path: &Path) -> Option<PathBuf> {
    let old_path = {
        let mut state = pipeline.state.lock().unwrap();
        state
            .pending_renames
            .retain(|_, noted_at| noted_at.elapsed() <= RENAME_WINDOW);

        let candidate = state
            .pending_renames
            .iter()
            .filter(|(path, _)| pipeline.filter.should_track(path))
            .min_by_key(|(_, noted_at)| **noted_at)
            .map(|(path, _)| path.clone());

        match candidate {
            Some(path) => {
                state.pending_renames.remove(&path);
                Some(path)
            }
            None => None,
        }
    }?;

    let job = CaptureJob::Rename {
        old_path: old_path.clone(),
        new_path: new_path.to_path_buf(),
    };
    let _ = pipeline.queue.send(job).await;
    Some(old_path)
}

/// Adds `root` and every non-excluded subdirectory to the subscription.
fn register_tree(
    watcher: &mut RecommendedWatcher,
    pipeline: &Pipeline,
    root: &Path,
) -> Result<()> {
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir() && pipeline.filter.is_excluded_dir(entry.path()))
    });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_dir() {
            watcher.watch(entry.path(), RecursiveMode::NonRecursive)?;
        }
    }
    Ok(())
}
