//! Transfer intents
//!
//! The delta processor and the local scanner never touch the network for
//! content; they emit intents that the transfer scheduler executes. Each
//! intent names an item by key; volatile details (paths, hashes, etags) are
//! re-read from the store at execution time so a late-running intent acts
//! on current state.

use onesync_core::domain::newtypes::{DriveId, ItemId, SyncPath};

/// A unit of work for the transfer scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferIntent {
    /// Fetch remote content into the cached item's local path
    Download {
        /// Drive of the item
        drive_id: DriveId,
        /// Item to download
        item_id: ItemId,
    },

    /// Send local content to the remote, creating or replacing an item
    Upload {
        /// Target drive
        drive_id: DriveId,
        /// Remote parent folder
        parent_id: ItemId,
        /// Name within the parent
        name: String,
        /// Local source file
        local_path: SyncPath,
        /// Item being replaced, with its cached etag for If-Match
        existing: Option<(ItemId, Option<String>)>,
    },

    /// Apply a remote tombstone to the local tree
    ApplyTombstone {
        /// Drive of the item
        drive_id: DriveId,
        /// Tombstoned item
        item_id: ItemId,
    },

    /// Propagate a local removal to the remote (with safe-delete check)
    DeleteRemote {
        /// Drive of the item
        drive_id: DriveId,
        /// Item to delete remotely
        item_id: ItemId,
    },
}

impl TransferIntent {
    /// The deduplication key: one in-flight transfer per `(drive, item)`
    ///
    /// New uploads have no item id yet and dedupe on their target path
    /// instead.
    pub fn flight_key(&self) -> String {
        match self {
            TransferIntent::Download { drive_id, item_id }
            | TransferIntent::ApplyTombstone { drive_id, item_id }
            | TransferIntent::DeleteRemote { drive_id, item_id } => {
                format!("{}:{}", drive_id.as_str(), item_id.as_str())
            }
            TransferIntent::Upload {
                drive_id,
                existing: Some((item_id, _)),
                ..
            } => format!("{}:{}", drive_id.as_str(), item_id.as_str()),
            TransferIntent::Upload {
                drive_id,
                local_path,
                ..
            } => format!("{}:path:{}", drive_id.as_str(), local_path),
        }
    }

    /// Downloads (and tombstones) drain from the download queue; the rest
    /// from the upload queue
    pub fn is_download_side(&self) -> bool {
        matches!(
            self,
            TransferIntent::Download { .. } | TransferIntent::ApplyTombstone { .. }
        )
    }

    /// Short tag for logs
    pub fn kind_str(&self) -> &'static str {
        match self {
            TransferIntent::Download { .. } => "download",
            TransferIntent::Upload { .. } => "upload",
            TransferIntent::ApplyTombstone { .. } => "tombstone",
            TransferIntent::DeleteRemote { .. } => "delete-remote",
        }
    }

    /// A path or key that identifies the item in reports
    pub fn describe(&self) -> String {
        match self {
            TransferIntent::Upload { local_path, .. } => local_path.to_string(),
            other => other.flight_key(),
        }
    }
}
