//! Sync coordinator: phase sequencing and run ownership
//!
//! One coordinator owns a run. Per drive the phases are strictly ordered:
//!
//! 1. delta ingestion (page by page, each page committed transactionally)
//! 2. local scan (never concurrent with delta; uploads must not race
//!    incoming overwrites)
//! 3. transfer drain (the scheduler's worker pool)
//! 4. delta-link persistence (only after everything above applied)
//!
//! The coordinator also owns the cancellation token, the startup integrity
//! check (orphaned rows force a full reseed of their drive), resync
//! handling, and the monitor loop that re-runs classification for paths the
//! filesystem watcher reports.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onesync_core::config::EngineConfig;
use onesync_core::domain::errors::EngineError;
use onesync_core::domain::newtypes::{DriveId, SyncPath};
use onesync_core::domain::report::SyncReport;
use onesync_core::ports::change_sink::{ChangeSink, PathChangeKind};
use onesync_core::ports::item_store::ItemStore;
use onesync_core::ports::remote_drive::{RemoteDrive, RemoteError, TransferBudget};
use onesync_filter::PathFilter;
use onesync_store::StateFiles;

use crate::delta::{DeltaPager, DeltaProcessor};
use crate::intent::TransferIntent;
use crate::monitor::{FileWatcher, MonitorBridge};
use crate::scanner::LocalScanner;
use crate::transfer::TransferScheduler;

/// Debounce window for monitor-driven syncs
const MONITOR_DEBOUNCE: Duration = Duration::from_secs(2);

/// Poll interval for the monitor's debounce queue
const MONITOR_POLL: Duration = Duration::from_millis(500);

/// Interval between remote polls while monitoring
const MONITOR_REMOTE_POLL: Duration = Duration::from_secs(300);

// ============================================================================
// SyncCoordinator
// ============================================================================

/// Sequences the phases of a synchronization run
pub struct SyncCoordinator {
    remote: Arc<dyn RemoteDrive>,
    store: Arc<dyn ItemStore>,
    state_files: StateFiles,
    budget: Arc<dyn TransferBudget>,
    filter: PathFilter,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl SyncCoordinator {
    /// Build a coordinator; compiles the filter from the configuration
    pub fn new(
        remote: Arc<dyn RemoteDrive>,
        store: Arc<dyn ItemStore>,
        state_files: StateFiles,
        budget: Arc<dyn TransferBudget>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let filter = PathFilter::from_config(&config)?;
        Ok(Self {
            remote,
            store,
            state_files,
            budget,
            filter,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// The cancellation signal observed at every suspension point
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one full synchronization cycle across all configured drives
    pub async fn run(&self) -> Result<SyncReport, EngineError> {
        let started = Instant::now();
        self.config.validate()?;

        // Startup integrity: a row whose parent is missing means the cache
        // can no longer be trusted for that drive; reseed it from scratch.
        let orphans = self
            .store
            .orphans()
            .await
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
        let mut reseed: Vec<DriveId> = Vec::new();
        for orphan in &orphans {
            if !reseed.contains(&orphan.drive_id) {
                warn!(
                    drive = orphan.drive_id.as_str(),
                    item = orphan.item_id.as_str(),
                    "Orphaned cache row; forcing full reseed of its drive"
                );
                reseed.push(orphan.drive_id.clone());
            }
        }

        let drives = self.select_drives().await?;
        info!(drives = drives.len(), "Sync run starting");

        let mut report = SyncReport::default();
        for drive_id in &drives {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let root = self.drive_root(drives.len(), drive_id)?;
            let force_reseed = reseed.contains(drive_id);
            let drive_report = self.sync_drive(drive_id, &root, force_reseed).await?;
            report.absorb(drive_report);
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(summary = %report, "Sync run complete");
        Ok(report)
    }

    /// Run once, then keep the mirror current from filesystem events plus a
    /// periodic remote poll, until cancelled
    pub async fn run_monitor(&self) -> Result<(), EngineError> {
        self.run().await?;

        let sync_root = SyncPath::new(self.config.sync_dir.clone())
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        let (watcher, rx) = FileWatcher::start(sync_root.as_path())
            .map_err(EngineError::Other)?;

        let queue = Arc::new(ScannerQueue::new());
        let bridge_queue = queue.clone();
        let bridge_cancel = self.cancel.clone();
        let bridge = tokio::spawn(async move {
            let mut bridge = MonitorBridge::new(rx, MONITOR_DEBOUNCE, MONITOR_POLL);
            tokio::select! {
                _ = bridge.run(bridge_queue.as_ref() as &dyn ChangeSink) => {}
                _ = bridge_cancel.cancelled() => {}
            }
        });

        let mut remote_poll = tokio::time::interval(MONITOR_REMOTE_POLL);
        remote_poll.tick().await; // first tick fires immediately; skip it

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = queue.notified() => {
                    if let Err(e) = self.sync_monitored_paths(&queue).await {
                        if matches!(e, EngineError::Cancelled) {
                            break Ok(());
                        }
                        break Err(e);
                    }
                }
                _ = remote_poll.tick() => {
                    // Remote changes have no local watcher; poll the feed
                    match self.run().await {
                        Ok(_) => {}
                        Err(EngineError::Cancelled) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        drop(watcher);
        let _ = bridge.await;
        result
    }

    /// Classify and transfer the paths the monitor reported
    async fn sync_monitored_paths(&self, queue: &ScannerQueue) -> Result<(), EngineError> {
        let changes = queue.take();
        if changes.is_empty() {
            return Ok(());
        }
        debug!(count = changes.len(), "Processing monitored changes");

        let drives = self.select_drives().await?;
        let mut report = SyncReport::default();
        let mut intents: Vec<TransferIntent> = Vec::new();

        for (path, _kind) in &changes {
            // Find the drive whose root contains this path
            for drive_id in &drives {
                let root = self.drive_root(drives.len(), drive_id)?;
                if path.relative_to(&root).is_err() {
                    continue;
                }
                let scanner = LocalScanner::new(
                    self.store.as_ref(),
                    self.remote.as_ref(),
                    &self.filter,
                    &self.config,
                    drive_id.clone(),
                    root,
                );
                intents.extend(scanner.scan_path(path, &mut report).await?);
                break;
            }
        }

        if !intents.is_empty() {
            let scheduler = self.scheduler();
            scheduler.drain(intents, &mut report).await?;
        }
        if report.total_changes() > 0 {
            info!(summary = %report, "Monitor cycle complete");
        }
        Ok(())
    }

    // ========================================================================
    // Per-drive cycle
    // ========================================================================

    async fn sync_drive(
        &self,
        drive_id: &DriveId,
        sync_root: &SyncPath,
        force_reseed: bool,
    ) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::default();
        info!(drive = drive_id.as_str(), root = %sync_root, "Syncing drive");

        if force_reseed {
            // Orphaned rows: the cache is inconsistent, drop it entirely.
            // Local files are adopted back during reseed if they match.
            self.store
                .clear_drive(drive_id)
                .await
                .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
            self.state_files
                .clear_delta_link(drive_id)
                .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
        } else if self.config.resync {
            // Resync keeps the rows (adoption avoids re-downloading
            // identical content) but discards the feed position
            info!(drive = drive_id.as_str(), "Resync requested; discarding delta link");
            self.state_files
                .clear_delta_link(drive_id)
                .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
        }

        let stored_link = self
            .state_files
            .delta_link(drive_id)
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;

        // Phase 1: delta ingestion, page by page
        let mut intents: Vec<TransferIntent> = Vec::new();
        let mut processor = DeltaProcessor::new(
            self.store.as_ref(),
            &self.filter,
            &self.config,
            drive_id.clone(),
            sync_root.clone(),
        );

        let mut attempted_reseed = false;
        let mut start_link = stored_link;
        let final_link = 'delta: loop {
            let mut pager = DeltaPager::new(self.remote.as_ref(), drive_id, start_link.as_ref());
            loop {
                if self.cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                match pager.next_page().await {
                    Ok(Some(page)) => {
                        let page_intents = processor.process_page(&page, &mut report).await?;
                        intents.extend(page_intents);
                    }
                    Ok(None) => break 'delta pager.into_delta_link(),
                    Err(RemoteError::DeltaReset) if !attempted_reseed => {
                        // The token expired server-side; restart the feed
                        // from scratch (existing rows allow adoption)
                        warn!(drive = drive_id.as_str(), "Delta token expired; reseeding");
                        attempted_reseed = true;
                        self.state_files
                            .clear_delta_link(drive_id)
                            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
                        start_link = None;
                        continue 'delta;
                    }
                    Err(RemoteError::AuthExpired) => return Err(EngineError::AuthExpired),
                    Err(e) => {
                        // Run-level: the delta link is not advanced
                        return Err(EngineError::Transient(format!(
                            "delta ingestion failed: {e}"
                        )));
                    }
                }
            }
        };

        // Phase 2: local scan (sequenced strictly after delta)
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let scanner = LocalScanner::new(
            self.store.as_ref(),
            self.remote.as_ref(),
            &self.filter,
            &self.config,
            drive_id.clone(),
            sync_root.clone(),
        );
        intents.extend(scanner.scan(&mut report).await?);

        // Phase 3: transfer drain
        let scheduler = self.scheduler();
        scheduler.drain(intents, &mut report).await?;

        // Phase 4: persist the delta link; its presence certifies that the
        // database reflects the feed up to this point
        if let Some(link) = final_link {
            if !self.config.dry_run {
                self.state_files
                    .set_delta_link(drive_id, &link)
                    .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
                debug!(drive = drive_id.as_str(), "Delta link persisted");
            }
        }

        Ok(report)
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    fn scheduler(&self) -> TransferScheduler {
        TransferScheduler::new(
            self.remote.clone(),
            self.store.clone(),
            self.state_files.clone(),
            self.budget.clone(),
            self.config.clone(),
            self.cancel.clone(),
        )
    }

    async fn select_drives(&self) -> Result<Vec<DriveId>, EngineError> {
        if !self.config.drives.is_empty() {
            return self
                .config
                .drives
                .iter()
                .map(|raw| {
                    DriveId::new(raw.clone())
                        .map_err(|e| EngineError::ConfigInvalid(e.to_string()))
                })
                .collect();
        }

        let listed = self
            .remote
            .list_drives()
            .await
            .map_err(|e| EngineError::Transient(format!("cannot enumerate drives: {e}")))?;
        match listed.into_iter().next() {
            Some(primary) => Ok(vec![primary.id]),
            None => Err(EngineError::ConfigInvalid(
                "the account exposes no drives and none are configured".to_string(),
            )),
        }
    }

    /// Local root for one drive: the sync root itself for a single drive,
    /// a per-drive subdirectory when several are mirrored
    fn drive_root(&self, total: usize, drive_id: &DriveId) -> Result<SyncPath, EngineError> {
        let base = SyncPath::new(self.config.sync_dir.clone())
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        if total <= 1 {
            return Ok(base);
        }
        let sub: String = drive_id
            .as_str()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let root = base
            .join(&sub)
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        if !self.config.dry_run {
            std::fs::create_dir_all(root.as_path()).map_err(|e| {
                EngineError::Other(anyhow::anyhow!("cannot create {}: {e}", root))
            })?;
        }
        Ok(root)
    }
}

// ============================================================================
// ScannerQueue
// ============================================================================

/// The monitor-facing change sink: collects paths for the next cycle
pub struct ScannerQueue {
    pending: Mutex<Vec<(SyncPath, PathChangeKind)>>,
    notify: Notify,
}

impl ScannerQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Wait until at least one change is queued
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Take everything queued so far
    pub fn take(&self) -> Vec<(SyncPath, PathChangeKind)> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

impl Default for ScannerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSink for ScannerQueue {
    fn on_path_changed(&self, path: &SyncPath, kind: PathChangeKind) {
        self.pending
            .lock()
            .unwrap()
            .push((path.clone(), kind));
        self.notify.notify_one();
    }
}
