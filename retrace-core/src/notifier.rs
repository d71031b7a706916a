use std::path::Path;

/// Capability the capture worker uses to announce committed history.
///
/// The HTTP host implements this to fan events out to its push channel;
/// tests substitute their own recorder.
pub trait Notifier: Send + Sync {
    fn notify_save(&self, path: &Path);
    fn notify_rename(&self, old_path: &Path, new_path: &Path);
}

/// No-op notifier for hosts that do not push events.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify_save(&self, _path: &Path) {}
    fn notify_rename(&self, _old_path: &Path, _new_path: &Path) {}
}
