//! Core of the retrace local history service: filesystem-event capture
//! and the content-addressed snapshot store.
//!
//! Events flow from the OS through the [`watch`] ingestor into per-path
//! debounce timers, then as jobs onto a bounded queue consumed by the
//! single-writer capture worker, which persists batches through
//! [`store::Store`] and announces commits via [`notifier::Notifier`].

mod capture;
pub mod error;
pub mod filter;
pub mod notifier;
pub mod service;
pub mod store;
mod watch;

pub use error::{HistoryError, Result};
pub use filter::{looks_binary, PathFilter};
pub use notifier::{Notifier, NoopNotifier};
pub use service::HistoryService;
pub use store::{
    HistoryEntry, Rename, SaveOutcome, Snapshot, SnapshotInput, Stats, Store, TrackedFile,
};
