//! Filesystem monitor bridge
//!
//! Wraps the `notify` crate to watch the sync root, converts raw OS events
//! into [`PathChangeKind`] values, debounces rapid-fire sequences, and
//! delivers settled changes through the engine's
//! [`ChangeSink`](onesync_core::ports::ChangeSink) port. Classification of
//! what a change means stays with the scanner; the monitor only reports
//! which paths moved.
//!
//! ```text
//! inotify ──→ FileWatcher ──→ mpsc ──→ DebouncedChangeQueue ──→ ChangeSink
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use onesync_core::domain::newtypes::SyncPath;
use onesync_core::ports::change_sink::{ChangeSink, PathChangeKind};

// ============================================================================
// Raw events
// ============================================================================

/// A filesystem change as the watcher saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    /// Absolute path that changed
    pub path: PathBuf,
    /// What happened
    pub kind: PathChangeKind,
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Watches the sync root using the OS-native mechanism (inotify on Linux)
///
/// Raw `notify` events are translated into [`RawChange`] values and sent
/// through an mpsc channel; drop the watcher to stop.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Start watching `root` recursively
    ///
    /// # Returns
    /// The watcher handle (keep it alive) and the receiving end of the
    /// change channel.
    pub fn start(root: &Path) -> Result<(Self, mpsc::Receiver<RawChange>)> {
        let (tx, rx) = mpsc::channel::<RawChange>(1024);

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let event = match result {
                Ok(e) => e,
                Err(e) => {
                    warn!("Watcher error: {e}");
                    return;
                }
            };
            for change in translate_event(&event) {
                if tx.blocking_send(change).is_err() {
                    // Receiver gone; the bridge is shutting down
                    return;
                }
            }
        })
        .context("Failed to create filesystem watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        info!(root = %root.display(), "Filesystem monitor started");
        Ok((Self { _watcher: watcher }, rx))
    }
}

/// Convert one notify event into zero or more raw changes
fn translate_event(event: &notify::Event) -> Vec<RawChange> {
    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| RawChange {
                path: p.clone(),
                kind: PathChangeKind::Created,
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let old = SyncPath::new(event.paths[0].clone()).ok();
            vec![RawChange {
                path: event.paths[1].clone(),
                kind: PathChangeKind::Renamed { old },
            }]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| RawChange {
                path: p.clone(),
                kind: PathChangeKind::Removed,
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(|p| RawChange {
                path: p.clone(),
                kind: PathChangeKind::Created,
            })
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| RawChange {
                path: p.clone(),
                kind: PathChangeKind::Modified,
            })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| RawChange {
                path: p.clone(),
                kind: PathChangeKind::Removed,
            })
            .collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// DebouncedChangeQueue
// ============================================================================

/// Coalesces rapid-fire events per path
///
/// A path is emitted only after it has been quiet for the debounce window;
/// later events replace earlier ones so consumers see the final state.
pub struct DebouncedChangeQueue {
    window: Duration,
    entries: Mutex<HashMap<PathBuf, (PathChangeKind, Instant)>>,
}

impl DebouncedChangeQueue {
    /// Create a queue with the given quiet window
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a change, replacing any earlier one for the same path
    pub fn push(&self, change: RawChange) {
        self.push_at(change, Instant::now());
    }

    fn push_at(&self, change: RawChange, now: Instant) {
        let mut entries = self.entries.lock().unwrap();
        let merged_kind = match (entries.get(&change.path), &change.kind) {
            // A modify after a create is still "created" for downstream
            (Some((PathChangeKind::Created, _)), PathChangeKind::Modified) => {
                PathChangeKind::Created
            }
            _ => change.kind,
        };
        entries.insert(change.path, (merged_kind, now));
    }

    /// Remove and return every change that has settled
    pub fn poll(&self) -> Vec<RawChange> {
        self.poll_at(Instant::now())
    }

    fn poll_at(&self, now: Instant) -> Vec<RawChange> {
        let mut entries = self.entries.lock().unwrap();
        let settled: Vec<PathBuf> = entries
            .iter()
            .filter(|(_, (_, last))| now.duration_since(*last) >= self.window)
            .map(|(path, _)| path.clone())
            .collect();

        settled
            .into_iter()
            .filter_map(|path| {
                entries
                    .remove(&path)
                    .map(|(kind, _)| RawChange { path, kind })
            })
            .collect()
    }

    /// Number of paths still waiting out the window
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Returns true when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

// ============================================================================
// MonitorBridge
// ============================================================================

/// Pumps watcher events through the debounce queue into a [`ChangeSink`]
///
/// The sink is typically the coordinator's scanner queue; every settled
/// path goes through the same classification rules as a full scan.
pub struct MonitorBridge {
    rx: mpsc::Receiver<RawChange>,
    queue: DebouncedChangeQueue,
    poll_interval: Duration,
}

impl MonitorBridge {
    /// Create a bridge over a watcher channel
    #[must_use]
    pub fn new(rx: mpsc::Receiver<RawChange>, debounce: Duration, poll_interval: Duration) -> Self {
        Self {
            rx,
            queue: DebouncedChangeQueue::new(debounce),
            poll_interval,
        }
    }

    /// Run until the watcher channel closes, delivering settled changes
    pub async fn run(&mut self, sink: &dyn ChangeSink) {
        info!("Monitor bridge running");
        let mut timer = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                received = self.rx.recv() => {
                    match received {
                        Some(change) => {
                            debug!(path = %change.path.display(), "Monitor event");
                            self.queue.push(change);
                        }
                        None => {
                            // Watcher dropped; flush what settled and stop
                            for change in self.queue.poll() {
                                deliver(sink, change);
                            }
                            break;
                        }
                    }
                }
                _ = timer.tick() => {
                    for change in self.queue.poll() {
                        deliver(sink, change);
                    }
                }
            }
        }

        info!("Monitor bridge stopped");
    }
}

fn deliver(sink: &dyn ChangeSink, change: RawChange) {
    match SyncPath::new(change.path) {
        Ok(path) => sink.on_path_changed(&path, change.kind),
        Err(e) => debug!("Ignoring unrepresentable path from watcher: {e}"),
    }
}
