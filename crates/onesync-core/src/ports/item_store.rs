//! Item store port (driven/secondary port)
//!
//! The persistent database of known items, keyed by `(drive_id, item_id)`
//! with secondary lookups by parent and by absolute local path. One adapter
//! exists (`onesync-store`, SQLite); tests use in-memory fakes.
//!
//! Transactionality contract: [`ItemStore::apply_page`] commits a whole
//! delta page or none of it. The coordinator persists the page's delta link
//! only after `apply_page` returns, which gives the crash guarantee that a
//! persisted delta link implies a durably applied page.

use thiserror::Error;

use crate::domain::item::CachedItem;
use crate::domain::newtypes::{DriveId, ItemId, SyncPath};

/// Failures of the item store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened or the connection died
    #[error("store connection failed: {0}")]
    Connection(String),

    /// The on-disk schema is ahead of this binary
    #[error("store schema version {found} not supported (max {supported})")]
    SchemaIncompatible {
        /// Version found on disk
        found: i64,
        /// Highest supported version
        supported: i64,
    },

    /// Schema migration failed partway
    #[error("store migration failed: {0}")]
    Migration(String),

    /// A row could not be decoded into domain types
    #[error("store row corrupt: {0}")]
    Corrupt(String),

    /// Any other query failure
    #[error("store query failed: {0}")]
    Query(String),
}

/// Port trait over the persistent item database
#[async_trait::async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert or replace one item by `(drive_id, item_id)`
    async fn upsert(&self, item: &CachedItem) -> Result<(), StoreError>;

    /// Look up one item by `(drive_id, item_id)`
    async fn get(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
    ) -> Result<Option<CachedItem>, StoreError>;

    /// All non-deleted children of a parent item
    async fn children_of(
        &self,
        drive_id: &DriveId,
        parent_id: &ItemId,
    ) -> Result<Vec<CachedItem>, StoreError>;

    /// Look up an item by its absolute local path
    async fn get_by_path(&self, path: &SyncPath) -> Result<Option<CachedItem>, StoreError>;

    /// Delete one row
    async fn remove(&self, drive_id: &DriveId, item_id: &ItemId) -> Result<(), StoreError>;

    /// Apply one delta page in a single transaction
    ///
    /// `upserts` and `removals` are applied in order; either everything
    /// commits or nothing does.
    async fn apply_page(
        &self,
        upserts: &[CachedItem],
        removals: &[(DriveId, ItemId)],
    ) -> Result<(), StoreError>;

    /// Every row belonging to a drive
    async fn items_in_drive(&self, drive_id: &DriveId) -> Result<Vec<CachedItem>, StoreError>;

    /// All tombstoned rows of a drive awaiting local deletion
    async fn tombstones(&self, drive_id: &DriveId) -> Result<Vec<CachedItem>, StoreError>;

    /// Rows whose parent id does not exist in the same drive
    ///
    /// Non-empty output means the cache is inconsistent and the drive must
    /// be reseeded from an empty delta token.
    async fn orphans(&self) -> Result<Vec<CachedItem>, StoreError>;

    /// Drop every row of a drive (used by resync/reseed)
    async fn clear_drive(&self, drive_id: &DriveId) -> Result<(), StoreError>;
}
