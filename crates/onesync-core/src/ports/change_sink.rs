//! Change sink port (driving/primary port)
//!
//! The interface a filesystem monitor (inotify or equivalent) pushes into.
//! The engine's scanner queue implements this; the monitor adapter in
//! `onesync-engine` feeds it debounced events. Classification of what a
//! change *means* stays with the scanner; the monitor only reports that a
//! path moved under its feet.

use crate::domain::newtypes::SyncPath;

/// What happened to a path, as far as the monitor can tell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathChangeKind {
    /// A file or directory appeared
    Created,
    /// Content or metadata changed
    Modified,
    /// The path disappeared
    Removed,
    /// The path is the destination of a rename
    Renamed {
        /// The previous path, when the monitor could pair the events
        old: Option<SyncPath>,
    },
}

/// Receiver of path-level change notifications
pub trait ChangeSink: Send + Sync {
    /// Report that `path` changed
    ///
    /// Must be cheap and non-blocking; implementations enqueue and return.
    fn on_path_changed(&self, path: &SyncPath, kind: PathChangeKind);
}
