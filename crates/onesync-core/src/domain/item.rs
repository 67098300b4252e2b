//! The item model: remote view, cached view, and sync state
//!
//! Two views of the same logical item exist in the engine:
//!
//! - [`RemoteItem`] — what a change-feed page or an item endpoint said about
//!   an item. Produced by the Graph adapter, consumed by the delta processor.
//! - [`CachedItem`] — the database row: the remote fields plus the derived
//!   local path, the last time the item was observed on disk, and its
//!   [`SyncState`].
//!
//! The database is the authority on "what we believe is where"; the
//! filesystem and the change feed are reconciled against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::newtypes::{DriveId, ItemId, SyncPath};

// ============================================================================
// ItemKind
// ============================================================================

/// Tagged classification of a drive item
///
/// `Remote` carries the pointer target for shared-folder items: a reference
/// into another drive's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ItemKind {
    /// An ordinary file with content and hashes
    File,
    /// A folder
    Folder,
    /// The root folder of a drive
    Root,
    /// A OneNote package or similar opaque bundle; treated as a folder
    /// that is never content-hashed
    Package,
    /// A shared-folder pointer into another drive
    Remote {
        /// Drive the pointer resolves into
        drive_id: DriveId,
        /// Item the pointer resolves to
        item_id: ItemId,
    },
}

impl ItemKind {
    /// Returns true for kinds that materialize as local directories
    pub fn is_directory_like(&self) -> bool {
        matches!(self, ItemKind::Folder | ItemKind::Root | ItemKind::Package)
    }

    /// Returns true for plain files
    pub fn is_file(&self) -> bool {
        matches!(self, ItemKind::File)
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::File => write!(f, "file"),
            ItemKind::Folder => write!(f, "folder"),
            ItemKind::Root => write!(f, "root"),
            ItemKind::Package => write!(f, "package"),
            ItemKind::Remote { .. } => write!(f, "remote"),
        }
    }
}

// ============================================================================
// ContentHashes
// ============================================================================

/// The content hashes a drive item may carry
///
/// Personal drives report `quickXorHash`; business drives and SharePoint
/// report `sha1Hash`/`sha256Hash`. Comparison uses the strongest pair both
/// sides share.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHashes {
    /// Base64-encoded quickXorHash (personal drives)
    pub quick_xor: Option<String>,
    /// Uppercase hex sha1Hash
    pub sha1: Option<String>,
    /// Uppercase hex sha256Hash
    pub sha256: Option<String>,
}

impl ContentHashes {
    /// An empty hash set (folders, tombstones)
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Construct with only a quickXorHash
    #[must_use]
    pub fn from_quick_xor(hash: impl Into<String>) -> Self {
        Self {
            quick_xor: Some(hash.into()),
            ..Self::default()
        }
    }

    /// Returns true if no hash of any kind is present
    pub fn is_empty(&self) -> bool {
        self.quick_xor.is_none() && self.sha1.is_none() && self.sha256.is_none()
    }

    /// Compare against another hash set
    ///
    /// Returns `Some(true)`/`Some(false)` when at least one algorithm is
    /// present on both sides, preferring quickXor, then sha256, then sha1.
    /// Returns `None` when the sets share no algorithm and are therefore
    /// incomparable.
    pub fn matches(&self, other: &ContentHashes) -> Option<bool> {
        if let (Some(a), Some(b)) = (&self.quick_xor, &other.quick_xor) {
            return Some(a == b);
        }
        if let (Some(a), Some(b)) = (&self.sha256, &other.sha256) {
            return Some(a.eq_ignore_ascii_case(b));
        }
        if let (Some(a), Some(b)) = (&self.sha1, &other.sha1) {
            return Some(a.eq_ignore_ascii_case(b));
        }
        None
    }

    /// Merge, preferring values present in `newer`
    #[must_use]
    pub fn merged_with(&self, newer: &ContentHashes) -> Self {
        Self {
            quick_xor: newer.quick_xor.clone().or_else(|| self.quick_xor.clone()),
            sha1: newer.sha1.clone().or_else(|| self.sha1.clone()),
            sha256: newer.sha256.clone().or_else(|| self.sha256.clone()),
        }
    }
}

// ============================================================================
// RemoteItem
// ============================================================================

/// A drive item as described by the change feed or an item endpoint
///
/// This is an adapter-level DTO: the Graph crate parses wire JSON into it
/// and the engine never sees raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Drive the item belongs to
    pub drive_id: DriveId,
    /// Item identifier, stable across renames and moves
    pub item_id: ItemId,
    /// Parent item identifier (None only for roots and tombstones)
    pub parent_id: Option<ItemId>,
    /// Item name within its parent
    pub name: String,
    /// Item classification
    pub kind: ItemKind,
    /// Size in bytes (files only)
    pub size: Option<u64>,
    /// ETag; changes on any item mutation including metadata
    pub etag: Option<String>,
    /// CTag; changes only when file content changes
    pub ctag: Option<String>,
    /// Content hashes (files only)
    pub hashes: ContentHashes,
    /// Last modified time in UTC
    pub modified: Option<DateTime<Utc>>,
    /// True when the `deleted` facet was present
    pub is_deleted: bool,
}

impl RemoteItem {
    /// Returns true for the drive root
    pub fn is_root(&self) -> bool {
        matches!(self.kind, ItemKind::Root)
    }
}

// ============================================================================
// SyncState
// ============================================================================

/// Where an item stands relative to a consistent sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Local bytes match the cached hashes; nothing to do
    #[default]
    Present,
    /// Remote is newer; a download intent exists or is queued
    PendingDownload,
    /// Local is newer; an upload intent exists or is queued
    PendingUpload,
    /// The remote reported the item deleted; local removal not yet applied
    Tombstoned,
}

impl SyncState {
    /// Returns true if the item is consistent and requires no transfer
    pub fn is_settled(&self) -> bool {
        matches!(self, SyncState::Present)
    }

    /// Returns true if a transfer intent exists for the item
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncState::PendingDownload | SyncState::PendingUpload)
    }

    /// Stable string form used by the database layer
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Present => "present",
            SyncState::PendingDownload => "pending_download",
            SyncState::PendingUpload => "pending_upload",
            SyncState::Tombstoned => "tombstoned",
        }
    }

    /// Parse the database string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(SyncState::Present),
            "pending_download" => Some(SyncState::PendingDownload),
            "pending_upload" => Some(SyncState::PendingUpload),
            "tombstoned" => Some(SyncState::Tombstoned),
            _ => None,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// CachedItem
// ============================================================================

/// A database row: the remote fields plus local bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedItem {
    /// Drive the item belongs to
    pub drive_id: DriveId,
    /// Item identifier
    pub item_id: ItemId,
    /// Parent item identifier (None only for roots)
    pub parent_id: Option<ItemId>,
    /// Item name within its parent
    pub name: String,
    /// Item classification
    pub kind: ItemKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// ETag as of the last delta that mentioned the item
    pub etag: Option<String>,
    /// CTag as of the last delta that mentioned the item
    pub ctag: Option<String>,
    /// Content hashes as of the last verified transfer or delta
    pub hashes: ContentHashes,
    /// Remote last-modified time
    pub modified: Option<DateTime<Utc>>,
    /// Absolute local path derived from the parent chain
    pub local_path: Option<SyncPath>,
    /// When the engine last observed the item on disk
    pub last_seen: Option<DateTime<Utc>>,
    /// Sync state
    pub state: SyncState,
}

impl CachedItem {
    /// Build a cached row from a remote item and its derived local path
    #[must_use]
    pub fn from_remote(remote: &RemoteItem, local_path: Option<SyncPath>) -> Self {
        Self {
            drive_id: remote.drive_id.clone(),
            item_id: remote.item_id.clone(),
            parent_id: remote.parent_id.clone(),
            name: remote.name.clone(),
            kind: remote.kind.clone(),
            size: remote.size.unwrap_or(0),
            etag: remote.etag.clone(),
            ctag: remote.ctag.clone(),
            hashes: remote.hashes.clone(),
            modified: remote.modified,
            local_path,
            last_seen: None,
            state: SyncState::Present,
        }
    }

    /// Returns true for kinds that materialize as local directories
    pub fn is_directory_like(&self) -> bool {
        self.kind.is_directory_like()
    }

    /// Returns true for plain files
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if the cached etag matches the remote's
    pub fn etag_matches(&self, remote: &RemoteItem) -> bool {
        match (&self.etag, &remote.etag) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_item() -> RemoteItem {
        RemoteItem {
            drive_id: DriveId::new("drive-1".to_string()).unwrap(),
            item_id: ItemId::new("item-1".to_string()).unwrap(),
            parent_id: Some(ItemId::new("root-1".to_string()).unwrap()),
            name: "report.pdf".to_string(),
            kind: ItemKind::File,
            size: Some(4096),
            etag: Some("\"e1\"".to_string()),
            ctag: Some("\"c1\"".to_string()),
            hashes: ContentHashes::from_quick_xor("AAAAAAAAAAAAAAAAAAAAAAAAAAA="),
            modified: Some("2026-03-01T08:00:00Z".parse().unwrap()),
            is_deleted: false,
        }
    }

    mod item_kind_tests {
        use super::*;

        #[test]
        fn test_directory_like() {
            assert!(ItemKind::Folder.is_directory_like());
            assert!(ItemKind::Root.is_directory_like());
            assert!(ItemKind::Package.is_directory_like());
            assert!(!ItemKind::File.is_directory_like());
        }

        #[test]
        fn test_display() {
            assert_eq!(ItemKind::File.to_string(), "file");
            let remote = ItemKind::Remote {
                drive_id: DriveId::new("d2".to_string()).unwrap(),
                item_id: ItemId::new("i2".to_string()).unwrap(),
            };
            assert_eq!(remote.to_string(), "remote");
        }

        #[test]
        fn test_serde_roundtrip() {
            let kind = ItemKind::Remote {
                drive_id: DriveId::new("d2".to_string()).unwrap(),
                item_id: ItemId::new("i2".to_string()).unwrap(),
            };
            let json = serde_json::to_string(&kind).unwrap();
            let parsed: ItemKind = serde_json::from_str(&json).unwrap();
            assert_eq!(kind, parsed);
        }
    }

    mod content_hashes_tests {
        use super::*;

        #[test]
        fn test_quick_xor_comparison() {
            let a = ContentHashes::from_quick_xor("AAAA");
            let b = ContentHashes::from_quick_xor("AAAA");
            let c = ContentHashes::from_quick_xor("BBBB");
            assert_eq!(a.matches(&b), Some(true));
            assert_eq!(a.matches(&c), Some(false));
        }

        #[test]
        fn test_incomparable_sets() {
            let a = ContentHashes::from_quick_xor("AAAA");
            let b = ContentHashes {
                sha1: Some("ABCD".to_string()),
                ..Default::default()
            };
            assert_eq!(a.matches(&b), None);
        }

        #[test]
        fn test_sha_comparison_case_insensitive() {
            let a = ContentHashes {
                sha256: Some("abcd12".to_string()),
                ..Default::default()
            };
            let b = ContentHashes {
                sha256: Some("ABCD12".to_string()),
                ..Default::default()
            };
            assert_eq!(a.matches(&b), Some(true));
        }

        #[test]
        fn test_quick_xor_preferred_over_sha() {
            // quickXor disagrees, sha agrees: quickXor wins the comparison
            let a = ContentHashes {
                quick_xor: Some("X1".to_string()),
                sha256: Some("SAME".to_string()),
                sha1: None,
            };
            let b = ContentHashes {
                quick_xor: Some("X2".to_string()),
                sha256: Some("SAME".to_string()),
                sha1: None,
            };
            assert_eq!(a.matches(&b), Some(false));
        }

        #[test]
        fn test_merge_prefers_newer() {
            let old = ContentHashes {
                quick_xor: Some("old".to_string()),
                sha1: Some("keep".to_string()),
                sha256: None,
            };
            let new = ContentHashes::from_quick_xor("new");
            let merged = old.merged_with(&new);
            assert_eq!(merged.quick_xor.as_deref(), Some("new"));
            assert_eq!(merged.sha1.as_deref(), Some("keep"));
        }
    }

    mod sync_state_tests {
        use super::*;

        #[test]
        fn test_string_roundtrip() {
            for state in [
                SyncState::Present,
                SyncState::PendingDownload,
                SyncState::PendingUpload,
                SyncState::Tombstoned,
            ] {
                assert_eq!(SyncState::parse(state.as_str()), Some(state));
            }
            assert_eq!(SyncState::parse("bogus"), None);
        }

        #[test]
        fn test_predicates() {
            assert!(SyncState::Present.is_settled());
            assert!(SyncState::PendingUpload.is_pending());
            assert!(SyncState::PendingDownload.is_pending());
            assert!(!SyncState::Tombstoned.is_pending());
        }
    }

    mod cached_item_tests {
        use super::*;

        #[test]
        fn test_from_remote() {
            let remote = file_item();
            let path = SyncPath::new("/sync/report.pdf".into()).unwrap();
            let cached = CachedItem::from_remote(&remote, Some(path));

            assert_eq!(cached.item_id, remote.item_id);
            assert_eq!(cached.size, 4096);
            assert_eq!(cached.state, SyncState::Present);
            assert!(cached.is_file());
            assert!(cached.etag_matches(&remote));
        }

        #[test]
        fn test_etag_mismatch() {
            let remote = file_item();
            let mut cached = CachedItem::from_remote(&remote, None);
            cached.etag = Some("\"stale\"".to_string());
            assert!(!cached.etag_matches(&remote));
        }

        #[test]
        fn test_missing_etag_never_matches() {
            let remote = file_item();
            let mut cached = CachedItem::from_remote(&remote, None);
            cached.etag = None;
            assert!(!cached.etag_matches(&remote));
        }
    }
}
