//! Local scanner: reconciles the on-disk tree against the cache
//!
//! Runs after delta ingestion for a drive, never concurrently with it. The
//! walk is depth-first; every path is run through the client-side filter
//! and then classified against the database:
//!
//! - unknown file → upload intent (new)
//! - unknown directory → remote folder created inline (parents must exist
//!   remotely before any child upload), then descent continues
//! - known file, hash unchanged → nothing (or an mtime-only cache fix)
//! - known file, hash changed → upload intent (modify, etag-guarded)
//! - known row with no file on disk → remote delete intent; the executor
//!   performs the safe-delete check before touching the remote
//!
//! The filesystem monitor feeds [`LocalScanner::scan_path`] with single
//! paths; classification is identical to the full walk.

use chrono::Utc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use onesync_core::config::EngineConfig;
use onesync_core::domain::errors::EngineError;
use onesync_core::domain::item::{CachedItem, ItemKind, SyncState};
use onesync_core::domain::newtypes::{DriveId, ItemId, SyncPath};
use onesync_core::domain::report::SyncReport;
use onesync_core::ports::item_store::ItemStore;
use onesync_core::ports::remote_drive::RemoteDrive;
use onesync_filter::{PathFilter, PathMeta};

use crate::fsops;
use crate::intent::TransferIntent;

/// Placeholder parent id used in dry-run when the real folder was not created
const DRY_RUN_PARENT: &str = "dry-run-pending-folder";

/// Scans one drive's local tree
pub struct LocalScanner<'a> {
    store: &'a dyn ItemStore,
    remote: &'a dyn RemoteDrive,
    filter: &'a PathFilter,
    config: &'a EngineConfig,
    drive_id: DriveId,
    sync_root: SyncPath,
}

impl<'a> LocalScanner<'a> {
    /// Create a scanner for one drive
    pub fn new(
        store: &'a dyn ItemStore,
        remote: &'a dyn RemoteDrive,
        filter: &'a PathFilter,
        config: &'a EngineConfig,
        drive_id: DriveId,
        sync_root: SyncPath,
    ) -> Self {
        Self {
            store,
            remote,
            filter,
            config,
            drive_id,
            sync_root,
        }
    }

    /// Walk the whole tree and return the transfer intents it produced
    pub async fn scan(&self, report: &mut SyncReport) -> Result<Vec<TransferIntent>, EngineError> {
        let Some(_root_row) = self
            .store
            .get_by_path(&self.sync_root)
            .await
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?
        else {
            // Without a root row there is no remote parent to attach
            // anything to; the first delta cycle creates it.
            warn!("No cached root for drive; skipping local scan");
            return Ok(Vec::new());
        };

        let mut intents = Vec::new();

        let mut walker = WalkDir::new(self.sync_root.as_path())
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    report.record_failure(
                        e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                        "filesystem",
                        e.to_string(),
                    );
                    continue;
                }
            };

            let path = match SyncPath::new(entry.path().to_path_buf()) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let name = path.file_name().unwrap_or_default().to_string();

            // Our own in-flight temp files are never sync candidates
            if fsops::is_partial_name(&name) {
                continue;
            }

            let descend = self
                .classify_entry(&path, &mut intents, report)
                .await?;
            if !descend && entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
        }

        self.detect_local_removals(&mut intents, report).await?;

        debug!(intents = intents.len(), "Local scan complete");
        Ok(intents)
    }

    /// Classify a single path (monitor entry point)
    ///
    /// Applies the same rules as the full walk; a missing path with a
    /// cached row becomes a remote-delete intent.
    pub async fn scan_path(
        &self,
        path: &SyncPath,
        report: &mut SyncReport,
    ) -> Result<Vec<TransferIntent>, EngineError> {
        if path
            .file_name()
            .map(fsops::is_partial_name)
            .unwrap_or(false)
        {
            return Ok(Vec::new());
        }

        let mut intents = Vec::new();

        if path.as_path().exists() {
            self.classify_entry(path, &mut intents, report).await?;
        } else if let Some(row) = self
            .store
            .get_by_path(path)
            .await
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?
        {
            if row.state == SyncState::Present && !self.config.download_only {
                intents.push(TransferIntent::DeleteRemote {
                    drive_id: self.drive_id.clone(),
                    item_id: row.item_id,
                });
            }
        }

        Ok(intents)
    }

    // ========================================================================
    // Per-path classification
    // ========================================================================

    /// Returns whether a directory entry should be descended into
    async fn classify_entry(
        &self,
        path: &SyncPath,
        intents: &mut Vec<TransferIntent>,
        report: &mut SyncReport,
    ) -> Result<bool, EngineError> {
        let row = self
            .store
            .get_by_path(path)
            .await
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;

        let rel = self.relative_str(path)?;
        let meta = match self.local_meta(path, row.is_some()) {
            Ok(m) => m,
            Err(e) => {
                // The path raced away between the walk and the stat
                report.record_failure(path.to_string(), "filesystem", e.to_string());
                return Ok(false);
            }
        };
        let decision = self.filter.classify(&rel, &meta);
        if !decision.is_include() {
            debug!(path = %rel, ?decision, "Filtered local path");
            report.filtered += 1;
            return Ok(false);
        }

        if meta.is_directory {
            match row {
                Some(_) => Ok(true),
                None => self.handle_new_directory(path, report).await,
            }
        } else {
            match row {
                Some(row) => {
                    self.handle_known_file(path, row, intents, report).await?;
                }
                None => {
                    self.handle_new_file(path, intents).await?;
                }
            }
            Ok(false)
        }
    }

    /// A directory the cache has never seen: create it remotely, descend
    async fn handle_new_directory(
        &self,
        path: &SyncPath,
        report: &mut SyncReport,
    ) -> Result<bool, EngineError> {
        if self.config.download_only {
            // Local-only content stays local in download-only mode
            return Ok(false);
        }

        let Some(parent_row) = self.parent_row(path).await? else {
            warn!(path = %path, "No cached parent for new directory; skipping subtree");
            return Ok(false);
        };
        let name = path.file_name().unwrap_or_default().to_string();

        if self.config.dry_run {
            info!(path = %path, "dry-run: would create remote folder");
            report.folders_created += 1;
            return Ok(true);
        }

        match self
            .remote
            .create_folder(&self.drive_id, &parent_row.item_id, &name)
            .await
        {
            Ok(created) => {
                let mut new_row = CachedItem::from_remote(&created, Some(path.clone()));
                new_row.state = SyncState::Present;
                new_row.last_seen = Some(Utc::now());
                self.store
                    .upsert(&new_row)
                    .await
                    .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
                info!(path = %path, "Created remote folder");
                report.folders_created += 1;
                Ok(true)
            }
            Err(e) => {
                report.record_failure(path.to_string(), "remote-folder", e.to_string());
                Ok(false)
            }
        }
    }

    /// A file the cache has never seen: new upload
    async fn handle_new_file(
        &self,
        path: &SyncPath,
        intents: &mut Vec<TransferIntent>,
    ) -> Result<(), EngineError> {
        if self.config.download_only {
            return Ok(());
        }

        let parent_id = match self.parent_row(path).await? {
            Some(parent) => parent.item_id,
            None if self.config.dry_run => {
                ItemId::new(DRY_RUN_PARENT.to_string()).expect("static id is valid")
            }
            None => {
                warn!(path = %path, "No cached parent for new file; skipping");
                return Ok(());
            }
        };

        intents.push(TransferIntent::Upload {
            drive_id: self.drive_id.clone(),
            parent_id,
            name: path.file_name().unwrap_or_default().to_string(),
            local_path: path.clone(),
            existing: None,
        });
        Ok(())
    }

    /// A file with a cached row: detect modification or timestamp drift
    async fn handle_known_file(
        &self,
        path: &SyncPath,
        row: CachedItem,
        intents: &mut Vec<TransferIntent>,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        // Items mid-transfer belong to the delta side of the cycle
        if row.state != SyncState::Present {
            return Ok(());
        }

        let metadata = match std::fs::symlink_metadata(path.as_path()) {
            Ok(m) => m,
            Err(e) => {
                report.record_failure(path.to_string(), "filesystem", e.to_string());
                return Ok(());
            }
        };
        let local_mtime = fsops::mtime_of(path.as_path()).ok();

        // Fast path: size and mtime agree with the cache
        let mtime_agrees = match (local_mtime, row.modified) {
            (Some(local), Some(cached)) => {
                fsops::compare_seconds(local, cached) == std::cmp::Ordering::Equal
            }
            _ => false,
        };
        if metadata.len() == row.size && mtime_agrees {
            return Ok(());
        }

        // An unreadable file is a per-item failure, not a run failure
        let (local_hashes, size) = match fsops::hash_file(path.as_path()) {
            Ok(hashed) => hashed,
            Err(e) => {
                report.record_failure(path.to_string(), "filesystem", e.to_string());
                return Ok(());
            }
        };

        if local_hashes.matches(&row.hashes) == Some(true) {
            // Content unchanged; only the timestamp moved. Correct the
            // cached mtime so the fast path holds next scan.
            if let Some(local) = local_mtime {
                let mut updated = row;
                updated.modified = Some(local);
                updated.last_seen = Some(Utc::now());
                if !self.config.dry_run {
                    self.store
                        .upsert(&updated)
                        .await
                        .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
                }
                debug!(path = %path, "Corrected cached mtime without transfer");
            }
            return Ok(());
        }

        if self.config.download_only {
            return Ok(());
        }

        debug!(path = %path, size, "Local modification detected");
        let parent_id = row
            .parent_id
            .clone()
            .unwrap_or_else(|| row.item_id.clone());
        if !self.config.dry_run {
            let mut pending = row.clone();
            pending.state = SyncState::PendingUpload;
            self.store
                .upsert(&pending)
                .await
                .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
        }
        intents.push(TransferIntent::Upload {
            drive_id: self.drive_id.clone(),
            parent_id,
            name: row.name.clone(),
            local_path: path.clone(),
            existing: Some((row.item_id, row.etag)),
        });
        Ok(())
    }

    // ========================================================================
    // Local removals
    // ========================================================================

    /// Rows that are settled in the cache but gone from disk
    async fn detect_local_removals(
        &self,
        intents: &mut Vec<TransferIntent>,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        if self.config.download_only {
            // Local deletions are not propagated in download-only mode
            return Ok(());
        }

        let rows = self
            .store
            .items_in_drive(&self.drive_id)
            .await
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;

        for row in rows {
            if row.state != SyncState::Present || matches!(row.kind, ItemKind::Root) {
                continue;
            }
            let Some(ref path) = row.local_path else {
                continue;
            };
            if path.as_path().exists() {
                continue;
            }

            // Only the topmost vanished item is propagated; the remote
            // delete takes the subtree with it and the next delta
            // tombstones the descendants.
            let parent_on_disk = path
                .as_path()
                .parent()
                .map(|p| p.exists())
                .unwrap_or(false);
            if !parent_on_disk {
                continue;
            }

            debug!(path = %path, "Local removal detected");
            if self.config.dry_run {
                report.deleted_remote += 1;
                continue;
            }
            intents.push(TransferIntent::DeleteRemote {
                drive_id: self.drive_id.clone(),
                item_id: row.item_id,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    async fn parent_row(&self, path: &SyncPath) -> Result<Option<CachedItem>, EngineError> {
        let Some(parent_path) = path.as_path().parent() else {
            return Ok(None);
        };
        let parent = SyncPath::new(parent_path.to_path_buf())
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
        self.store
            .get_by_path(&parent)
            .await
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))
    }

    fn relative_str(&self, path: &SyncPath) -> Result<String, EngineError> {
        let rel = path
            .relative_to(&self.sync_root)
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
        Ok(format!("/{}", rel.to_string_lossy()))
    }

    fn local_meta(&self, path: &SyncPath, has_row: bool) -> Result<PathMeta, EngineError> {
        let lstat = std::fs::symlink_metadata(path.as_path()).map_err(|e| {
            EngineError::Other(anyhow::anyhow!("cannot stat {}: {e}", path))
        })?;
        let is_symlink = lstat.file_type().is_symlink();
        let symlink_valid = if is_symlink {
            // Valid means relative and resolving to an existing target
            let target_exists = path.as_path().exists();
            let relative = std::fs::read_link(path.as_path())
                .map(|t| t.is_relative())
                .unwrap_or(false);
            target_exists && relative
        } else {
            false
        };

        Ok(PathMeta {
            is_directory: lstat.is_dir(),
            is_symlink,
            symlink_valid,
            size: lstat.is_file().then(|| lstat.len()),
            exists_locally: true,
            has_remote: has_row,
        })
    }
}
