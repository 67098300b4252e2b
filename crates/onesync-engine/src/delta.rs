//! Delta processor: applies the remote change feed to the local mirror
//!
//! One processor instance handles one drive for one sync cycle. Pages are
//! processed in server order; within a page each item flows through
//! classification and reconciliation, producing immediate metadata effects
//! (directories created, local renames, safe backups) and deferred transfer
//! intents (downloads, tombstone application). The page's row changes are
//! committed to the store in a single transaction after the whole page has
//! been walked, so a crash mid-page replays that page; every operation here
//! is idempotent.
//!
//! ## Reconciliation rules for files
//!
//! - no local file, no cached row → download
//! - cached row matches the remote etag/hash → no-op (metadata refresh)
//! - local file with no row → hash it: equal hash adopts in place; a
//!   diverging hash is backed up and the remote version downloaded
//! - local file and row both present, remote differs → clean local file
//!   downloads over; a locally-modified file is backed up first
//! - timestamps within 2 s with equal hashes → treat as equal and silently
//!   correct the local mtime to the remote value
//!
//! Renames are recognized by an unchanged item id arriving under a new
//! `(parent, name)` and are applied as local renames without transferring
//! bytes.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use onesync_core::config::EngineConfig;
use onesync_core::domain::errors::EngineError;
use onesync_core::domain::item::{CachedItem, ItemKind, RemoteItem, SyncState};
use onesync_core::domain::newtypes::{DriveId, ItemId, SyncPath};
use onesync_core::domain::report::SyncReport;
use onesync_core::ports::item_store::ItemStore;
use onesync_core::ports::remote_drive::DeltaPage;
use onesync_filter::{PathFilter, PathMeta};

use crate::backup::safe_backup_rename;
use crate::fsops;
use crate::intent::TransferIntent;

/// Applies delta pages for one drive
pub struct DeltaProcessor<'a> {
    store: &'a dyn ItemStore,
    filter: &'a PathFilter,
    config: &'a EngineConfig,
    drive_id: DriveId,
    sync_root: SyncPath,
    /// Rows changed during this cycle, visible to later items in the same
    /// cycle before their page commits
    pending: HashMap<String, CachedItem>,
}

impl<'a> DeltaProcessor<'a> {
    /// Create a processor for one drive
    pub fn new(
        store: &'a dyn ItemStore,
        filter: &'a PathFilter,
        config: &'a EngineConfig,
        drive_id: DriveId,
        sync_root: SyncPath,
    ) -> Self {
        Self {
            store,
            filter,
            config,
            drive_id,
            sync_root,
            pending: HashMap::new(),
        }
    }

    /// Apply one page: walk items in server order, commit rows, return the
    /// transfer intents the page produced
    pub async fn process_page(
        &mut self,
        page: &DeltaPage,
        report: &mut SyncReport,
    ) -> Result<Vec<TransferIntent>, EngineError> {
        let mut upserts: Vec<CachedItem> = Vec::new();
        let mut removals: Vec<(DriveId, ItemId)> = Vec::new();
        let mut intents: Vec<TransferIntent> = Vec::new();

        for item in &page.items {
            self.process_item(item, &mut upserts, &mut removals, &mut intents, report)
                .await?;
        }

        if !self.config.dry_run {
            self.store
                .apply_page(&upserts, &removals)
                .await
                .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
        }

        debug!(
            items = page.items.len(),
            upserts = upserts.len(),
            intents = intents.len(),
            "Delta page applied"
        );
        Ok(intents)
    }

    async fn process_item(
        &mut self,
        item: &RemoteItem,
        upserts: &mut Vec<CachedItem>,
        removals: &mut Vec<(DriveId, ItemId)>,
        intents: &mut Vec<TransferIntent>,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        if item.is_deleted {
            return self.process_tombstone(item, upserts, removals, intents).await;
        }

        if item.is_root() {
            let mut row = CachedItem::from_remote(item, Some(self.sync_root.clone()));
            row.state = SyncState::Present;
            self.stage(row, upserts);
            return Ok(());
        }

        // Resolve the parent; items whose parents were excluded or never
        // seen belong to subtrees we do not mirror.
        let Some(parent) = self.resolve_parent(item).await? else {
            // Parents arrive before children in the feed, so an unknown
            // parent means the item sits inside an excluded subtree.
            debug!(item = item.item_id.as_str(), "Parent unknown; skipping item");
            report.filtered += 1;
            return Ok(());
        };
        let Some(parent_path) = parent.local_path.clone() else {
            return Ok(());
        };

        let local_path = parent_path
            .join(&item.name)
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;

        if item.kind.is_directory_like() || matches!(item.kind, ItemKind::Remote { .. }) {
            self.guard_against_cycles(item).await?;
        }

        // Client-side filter
        let rel = self.relative_str(&local_path)?;
        let meta = self.path_meta(&local_path, item);
        let decision = self.filter.classify(&rel, &meta);
        if !decision.is_include() {
            debug!(path = %rel, ?decision, "Filtered remote item");
            report.filtered += 1;
            return Ok(());
        }

        // OneDrive names are case-insensitive; the local filesystem is not.
        // Two siblings differing only in case would shadow each other, so
        // the second arrival is skipped rather than mirrored.
        if let Some(other) = self.case_collision(item).await? {
            warn!(
                path = %rel,
                existing = %other,
                "Sibling differs only in case; skipping to avoid a shadowed path"
            );
            report.record_failure(rel, "case-collision", format!("collides with {other}"));
            return Ok(());
        }

        // Rename/move: same item id arriving under a different path
        let existing = self.lookup(&item.item_id).await?;
        if let Some(ref row) = existing {
            if let Some(ref old_path) = row.local_path {
                if *old_path != local_path && !row.state.is_pending() {
                    self.apply_local_rename(row, old_path, &local_path, upserts, report)
                        .await?;
                }
            }
        }

        match &item.kind {
            ItemKind::Folder | ItemKind::Package | ItemKind::Root => {
                self.materialize_directory(item, &local_path, upserts, report)?;
            }
            ItemKind::Remote { .. } => {
                // Shared-folder pointer: hold its place as a directory; the
                // target drive syncs when it is configured as a drive.
                self.materialize_directory(item, &local_path, upserts, report)?;
            }
            ItemKind::File => {
                self.reconcile_file(item, existing, &local_path, upserts, intents, report)
                    .await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Tombstones
    // ========================================================================

    async fn process_tombstone(
        &mut self,
        item: &RemoteItem,
        upserts: &mut Vec<CachedItem>,
        removals: &mut Vec<(DriveId, ItemId)>,
        intents: &mut Vec<TransferIntent>,
    ) -> Result<(), EngineError> {
        let Some(mut row) = self.lookup(&item.item_id).await? else {
            // Never knew the item; nothing to remove
            return Ok(());
        };

        if self.config.upload_only {
            // Local is authoritative in upload-only: drop the row so the
            // scanner re-uploads the local copy as a new item.
            debug!(item = item.item_id.as_str(), "Tombstone recorded without local effect");
            self.pending.remove(item.item_id.as_str());
            removals.push((self.drive_id.clone(), item.item_id.clone()));
            return Ok(());
        }

        row.state = SyncState::Tombstoned;
        self.stage(row, upserts);
        intents.push(TransferIntent::ApplyTombstone {
            drive_id: self.drive_id.clone(),
            item_id: item.item_id.clone(),
        });
        Ok(())
    }

    // ========================================================================
    // Directories
    // ========================================================================

    fn materialize_directory(
        &mut self,
        item: &RemoteItem,
        local_path: &SyncPath,
        upserts: &mut Vec<CachedItem>,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        if !self.config.dry_run && !self.config.upload_only {
            let path = local_path.as_path();
            if path.exists() && !path.is_dir() {
                // A file sits where the directory must go
                safe_backup_rename(path)?;
                report.backed_up += 1;
            }
            if !path.exists() {
                std::fs::create_dir_all(path).map_err(|e| {
                    EngineError::Other(anyhow::anyhow!(
                        "cannot create {}: {e}",
                        path.display()
                    ))
                })?;
                report.folders_created += 1;
                debug!(path = %local_path, "Created local directory");
            }
        }

        let mut row = CachedItem::from_remote(item, Some(local_path.clone()));
        row.state = SyncState::Present;
        row.last_seen = Some(Utc::now());
        self.stage(row, upserts);
        Ok(())
    }

    // ========================================================================
    // Files
    // ========================================================================

    async fn reconcile_file(
        &mut self,
        item: &RemoteItem,
        existing: Option<CachedItem>,
        local_path: &SyncPath,
        upserts: &mut Vec<CachedItem>,
        intents: &mut Vec<TransferIntent>,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        let file_on_disk = local_path.as_path().is_file();

        // Upload-only never writes locally; keep the metadata fresh and stop.
        if self.config.upload_only {
            let mut row = CachedItem::from_remote(item, Some(local_path.clone()));
            row.state = existing.map(|e| e.state).unwrap_or(SyncState::Present);
            self.stage(row, upserts);
            return Ok(());
        }

        match (file_on_disk, existing) {
            // Nothing local: fetch it
            (false, None) => {
                self.queue_download(item, local_path, upserts, intents);
            }

            // Row exists but the file vanished locally between cycles; the
            // remote still lists it, so restore it.
            (false, Some(_)) => {
                self.queue_download(item, local_path, upserts, intents);
            }

            // First sight of a local file at this path (fresh DB or resync)
            (true, None) => {
                self.reconcile_unknown_local(item, local_path, upserts, intents, report)?;
            }

            // Both sides known
            (true, Some(row)) => {
                self.reconcile_known(item, &row, local_path, upserts, intents, report)?;
            }
        }
        Ok(())
    }

    /// Local file exists but the database has no row: adopt or conflict
    fn reconcile_unknown_local(
        &mut self,
        item: &RemoteItem,
        local_path: &SyncPath,
        upserts: &mut Vec<CachedItem>,
        intents: &mut Vec<TransferIntent>,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        let (local_hashes, _size) = fsops::hash_file(local_path.as_path()).map_err(|e| {
            EngineError::Other(anyhow::anyhow!("cannot hash {}: {e}", local_path))
        })?;

        if local_hashes.matches(&item.hashes) == Some(true) {
            // Same content: adopt in place, normalizing the timestamp
            if let Some(remote_mtime) = item.modified {
                let local_mtime = fsops::mtime_of(local_path.as_path()).ok();
                if local_mtime.map(|m| m != fsops::truncate_to_seconds(remote_mtime)) == Some(true)
                    && !self.config.dry_run
                {
                    let _ = fsops::set_mtime(local_path.as_path(), remote_mtime);
                }
            }
            let mut row = CachedItem::from_remote(item, Some(local_path.clone()));
            row.state = SyncState::Present;
            row.last_seen = Some(Utc::now());
            self.stage(row, upserts);
            info!(path = %local_path, "Adopted identical local file");
            return Ok(());
        }

        // Hashes differ: whatever the timestamps say, diverging local bytes
        // are preserved unless data protection is bypassed. The backup file
        // is picked up by the scanner and uploaded as a new item.
        self.backup_then_download(item, local_path, upserts, intents, report)
    }

    /// Both a row and a local file exist; decide what changed where
    fn reconcile_known(
        &mut self,
        item: &RemoteItem,
        row: &CachedItem,
        local_path: &SyncPath,
        upserts: &mut Vec<CachedItem>,
        intents: &mut Vec<TransferIntent>,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        let remote_unchanged =
            row.etag_matches(item) || row.hashes.matches(&item.hashes) == Some(true);

        if remote_unchanged {
            // Remote is where we left it; only the timestamp may drift
            if let (Some(remote_mtime), Ok(local_mtime)) =
                (item.modified, fsops::mtime_of(local_path.as_path()))
            {
                if local_mtime != fsops::truncate_to_seconds(remote_mtime)
                    && fsops::timestamps_close(local_mtime, remote_mtime)
                    && !self.config.dry_run
                {
                    let _ = fsops::set_mtime(local_path.as_path(), remote_mtime);
                    debug!(path = %local_path, "Corrected drifting local mtime");
                }
            }
            let mut updated = CachedItem::from_remote(item, Some(local_path.clone()));
            updated.state = row.state;
            updated.last_seen = Some(Utc::now());
            self.stage(updated, upserts);
            return Ok(());
        }

        // Remote changed. Is the local file still what the cache recorded?
        let (local_hashes, _) = fsops::hash_file(local_path.as_path()).map_err(|e| {
            EngineError::Other(anyhow::anyhow!("cannot hash {}: {e}", local_path))
        })?;

        if local_hashes.matches(&item.hashes) == Some(true) {
            // The local file already has the new content (e.g. another tool
            // wrote it); adopt the metadata.
            if let Some(remote_mtime) = item.modified {
                if !self.config.dry_run {
                    let _ = fsops::set_mtime(local_path.as_path(), remote_mtime);
                }
            }
            let mut updated = CachedItem::from_remote(item, Some(local_path.clone()));
            updated.state = SyncState::Present;
            updated.last_seen = Some(Utc::now());
            self.stage(updated, upserts);
            return Ok(());
        }

        if local_hashes.matches(&row.hashes) == Some(true) {
            // Local is clean; plain remote update
            self.queue_download(item, local_path, upserts, intents);
            return Ok(());
        }

        // Both sides changed since the cache last agreed: conflict.
        // Newer-wins with a data-protection backup of the losing copy.
        self.backup_then_download(item, local_path, upserts, intents, report)
    }

    /// Safe-backup the local file (unless bypassed), then download
    fn backup_then_download(
        &mut self,
        item: &RemoteItem,
        local_path: &SyncPath,
        upserts: &mut Vec<CachedItem>,
        intents: &mut Vec<TransferIntent>,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        if self.config.bypass_data_protection {
            warn!(path = %local_path, "Overwriting diverged local copy (data protection bypassed)");
        } else if !self.config.dry_run {
            safe_backup_rename(local_path.as_path())?;
            report.backed_up += 1;
        } else {
            report.backed_up += 1;
        }
        self.queue_download(item, local_path, upserts, intents);
        Ok(())
    }

    fn queue_download(
        &mut self,
        item: &RemoteItem,
        local_path: &SyncPath,
        upserts: &mut Vec<CachedItem>,
        intents: &mut Vec<TransferIntent>,
    ) {
        let mut row = CachedItem::from_remote(item, Some(local_path.clone()));
        row.state = SyncState::PendingDownload;
        self.stage(row, upserts);
        intents.push(TransferIntent::Download {
            drive_id: self.drive_id.clone(),
            item_id: item.item_id.clone(),
        });
    }

    // ========================================================================
    // Renames and moves
    // ========================================================================

    async fn apply_local_rename(
        &mut self,
        row: &CachedItem,
        old_path: &SyncPath,
        new_path: &SyncPath,
        upserts: &mut Vec<CachedItem>,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        if self.config.dry_run || self.config.upload_only {
            report.renamed += 1;
            return Ok(());
        }

        if old_path.as_path().exists() {
            if let Some(parent) = new_path.as_path().parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EngineError::Other(anyhow::anyhow!(
                        "cannot create {}: {e}",
                        parent.display()
                    ))
                })?;
            }
            if new_path.as_path().exists() {
                // Something already sits at the destination; keep its bytes
                safe_backup_rename(new_path.as_path())?;
                report.backed_up += 1;
            }
            std::fs::rename(old_path.as_path(), new_path.as_path()).map_err(|e| {
                EngineError::Other(anyhow::anyhow!(
                    "cannot rename {} to {}: {e}",
                    old_path,
                    new_path
                ))
            })?;
            info!(from = %old_path, to = %new_path, "Applied remote rename locally");
            report.renamed += 1;
        }

        // Descendant rows derive their paths from this one; re-derive them
        if row.is_directory_like() {
            self.repath_descendants(&row.item_id, old_path, new_path, upserts)
                .await?;
        }
        Ok(())
    }

    /// Rewrite the cached paths of everything under a moved directory
    async fn repath_descendants(
        &mut self,
        folder_id: &ItemId,
        old_prefix: &SyncPath,
        new_prefix: &SyncPath,
        upserts: &mut Vec<CachedItem>,
    ) -> Result<(), EngineError> {
        let mut queue = vec![folder_id.clone()];
        while let Some(parent_id) = queue.pop() {
            let children = self
                .store
                .children_of(&self.drive_id, &parent_id)
                .await
                .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
            for mut child in children {
                if let Some(ref child_path) = child.local_path {
                    if let Ok(rel) = child_path.relative_to(old_prefix) {
                        let moved = SyncPath::new(new_prefix.as_path().join(rel))
                            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
                        child.local_path = Some(moved);
                        if child.is_directory_like() {
                            queue.push(child.item_id.clone());
                        }
                        self.stage(child, upserts);
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    /// Reject deltas that would make an item its own ancestor
    async fn guard_against_cycles(&mut self, item: &RemoteItem) -> Result<(), EngineError> {
        let mut hops = 0;
        let mut cursor = item.parent_id.clone();
        while let Some(parent_id) = cursor {
            if parent_id == item.item_id {
                return Err(EngineError::CycleDetected(
                    item.item_id.as_str().to_string(),
                ));
            }
            hops += 1;
            if hops > 256 {
                return Err(EngineError::CycleDetected(
                    item.item_id.as_str().to_string(),
                ));
            }
            cursor = match self.lookup(&parent_id).await? {
                Some(row) => row.parent_id,
                None => None,
            };
        }
        Ok(())
    }

    /// A non-deleted sibling whose name equals this item's ignoring case
    async fn case_collision(
        &mut self,
        item: &RemoteItem,
    ) -> Result<Option<String>, EngineError> {
        let Some(ref parent_id) = item.parent_id else {
            return Ok(None);
        };
        let committed = self
            .store
            .children_of(&self.drive_id, parent_id)
            .await
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
        let collision = committed
            .iter()
            .chain(self.pending.values().filter(|row| {
                row.parent_id.as_ref() == Some(parent_id)
            }))
            .find(|row| {
                row.item_id != item.item_id
                    && row.name != item.name
                    && row.name.eq_ignore_ascii_case(&item.name)
            })
            .map(|row| row.name.clone());
        Ok(collision)
    }

    async fn resolve_parent(
        &mut self,
        item: &RemoteItem,
    ) -> Result<Option<CachedItem>, EngineError> {
        let Some(ref parent_id) = item.parent_id else {
            return Ok(None);
        };
        self.lookup(parent_id).await
    }

    /// Cycle-local overlay first, then the committed store
    async fn lookup(&mut self, item_id: &ItemId) -> Result<Option<CachedItem>, EngineError> {
        if let Some(row) = self.pending.get(item_id.as_str()) {
            return Ok(Some(row.clone()));
        }
        self.store
            .get(&self.drive_id, item_id)
            .await
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))
    }

    fn stage(&mut self, row: CachedItem, upserts: &mut Vec<CachedItem>) {
        self.pending
            .insert(row.item_id.as_str().to_string(), row.clone());
        upserts.push(row);
    }

    fn relative_str(&self, path: &SyncPath) -> Result<String, EngineError> {
        let rel = path
            .relative_to(&self.sync_root)
            .map_err(|e| EngineError::Other(anyhow::Error::new(e)))?;
        Ok(format!("/{}", rel.to_string_lossy()))
    }

    fn path_meta(&self, local_path: &SyncPath, item: &RemoteItem) -> PathMeta {
        let lstat = std::fs::symlink_metadata(local_path.as_path()).ok();
        let is_symlink = lstat.as_ref().is_some_and(|m| m.file_type().is_symlink());
        PathMeta {
            is_directory: item.kind.is_directory_like(),
            is_symlink,
            symlink_valid: is_symlink && local_path.as_path().exists(),
            size: item.size,
            exists_locally: lstat.is_some(),
            has_remote: true,
        }
    }
}

// ============================================================================
// DeltaPager
// ============================================================================

/// Lazy iteration over the pages of one delta query
///
/// ```ignore
/// let mut pager = DeltaPager::new(remote, &drive_id, stored_link.as_ref());
/// while let Some(page) = pager.next_page().await? {
///     processor.process_page(&page, &mut report).await?;
/// }
/// let new_link = pager.into_delta_link();
/// ```
pub struct DeltaPager<'a> {
    remote: &'a dyn onesync_core::ports::remote_drive::RemoteDrive,
    drive_id: &'a DriveId,
    start_link: Option<&'a onesync_core::domain::newtypes::DeltaLink>,
    state: PagerState,
}

enum PagerState {
    NotStarted,
    Following(String),
    Finished(Option<onesync_core::domain::newtypes::DeltaLink>),
}

impl<'a> DeltaPager<'a> {
    /// Create a pager resuming from `start_link` (or enumerating fully)
    pub fn new(
        remote: &'a dyn onesync_core::ports::remote_drive::RemoteDrive,
        drive_id: &'a DriveId,
        start_link: Option<&'a onesync_core::domain::newtypes::DeltaLink>,
    ) -> Self {
        Self {
            remote,
            drive_id,
            start_link,
            state: PagerState::NotStarted,
        }
    }

    /// Fetch the next page, or `None` once the feed is drained
    pub async fn next_page(
        &mut self,
    ) -> Result<Option<DeltaPage>, onesync_core::ports::remote_drive::RemoteError> {
        let page = match &self.state {
            PagerState::NotStarted => {
                self.remote
                    .delta_page_initial(self.drive_id, self.start_link)
                    .await?
            }
            PagerState::Following(link) => self.remote.delta_page_next(link).await?,
            PagerState::Finished(_) => return Ok(None),
        };

        self.state = match (&page.next_link, &page.delta_link) {
            (Some(next), _) => PagerState::Following(next.clone()),
            (None, final_link) => PagerState::Finished(final_link.clone()),
        };

        Ok(Some(page))
    }

    /// The delta link of the final page, once the feed is drained
    pub fn into_delta_link(self) -> Option<onesync_core::domain::newtypes::DeltaLink> {
        match self.state {
            PagerState::Finished(link) => link,
            _ => None,
        }
    }
}
