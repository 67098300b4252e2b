//! SQLite implementation of the ItemStore port
//!
//! Handles domain-type serialization and SQL construction. All queries go
//! through one connection pool; `apply_page` wraps a whole delta page in a
//! single transaction so a crash mid-page leaves the previous state intact.
//!
//! ## Type mapping
//!
//! | Domain type      | SQL type | Strategy                              |
//! |------------------|----------|---------------------------------------|
//! | DriveId, ItemId  | TEXT     | string via `as_str()` / `new()`       |
//! | ItemKind         | TEXT     | `file` / `folder` / `root` / `package` / `remote:<drive>:<item>` |
//! | SyncState        | TEXT     | `SyncState::as_str()` / `parse()`     |
//! | SyncPath         | TEXT     | path string                           |
//! | DateTime<Utc>    | TEXT     | RFC 3339                              |

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use onesync_core::domain::item::{CachedItem, ContentHashes, ItemKind, SyncState};
use onesync_core::domain::newtypes::{DriveId, ItemId, SyncPath};
use onesync_core::ports::item_store::{ItemStore, StoreError};

use crate::pool::DatabasePool;

/// SQLite-backed item store
pub struct SqliteItemStore {
    pool: SqlitePool,
}

impl SqliteItemStore {
    /// Create a store over an opened pool
    #[must_use]
    pub fn new(db: &DatabasePool) -> Self {
        Self {
            pool: db.inner().clone(),
        }
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

/// Serialize an ItemKind for storage
fn kind_to_string(kind: &ItemKind) -> String {
    match kind {
        ItemKind::File => "file".to_string(),
        ItemKind::Folder => "folder".to_string(),
        ItemKind::Root => "root".to_string(),
        ItemKind::Package => "package".to_string(),
        ItemKind::Remote { drive_id, item_id } => {
            format!("remote:{}:{}", drive_id.as_str(), item_id.as_str())
        }
    }
}

/// Deserialize an ItemKind from its stored form
fn kind_from_string(s: &str) -> Result<ItemKind, StoreError> {
    match s {
        "file" => Ok(ItemKind::File),
        "folder" => Ok(ItemKind::Folder),
        "root" => Ok(ItemKind::Root),
        "package" => Ok(ItemKind::Package),
        s if s.starts_with("remote:") => {
            let rest = &s["remote:".len()..];
            let (drive, item) = rest.split_once(':').ok_or_else(|| {
                StoreError::Corrupt(format!("malformed remote kind: {s}"))
            })?;
            Ok(ItemKind::Remote {
                drive_id: DriveId::new(drive.to_string())
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                item_id: ItemId::new(item.to_string())
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            })
        }
        other => Err(StoreError::Corrupt(format!("unknown item kind: {other}"))),
    }
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    match s {
        Some(ref v) if !v.is_empty() => DateTime::parse_from_rfc3339(v)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| StoreError::Corrupt(format!("bad datetime '{v}': {e}"))),
        _ => Ok(None),
    }
}

/// Reconstruct a CachedItem from a database row
fn item_from_row(row: &SqliteRow) -> Result<CachedItem, StoreError> {
    let corrupt = |e: onesync_core::DomainError| StoreError::Corrupt(e.to_string());

    let drive_id = DriveId::new(row.get::<String, _>("drive_id")).map_err(corrupt)?;
    let item_id = ItemId::new(row.get::<String, _>("item_id")).map_err(corrupt)?;
    let parent_id = row
        .get::<Option<String>, _>("parent_id")
        .map(ItemId::new)
        .transpose()
        .map_err(corrupt)?;
    let kind = kind_from_string(&row.get::<String, _>("kind"))?;
    let local_path = row
        .get::<Option<String>, _>("local_path")
        .map(|p| SyncPath::new(p.into()))
        .transpose()
        .map_err(corrupt)?;
    let state_str: String = row.get("state");
    let state = SyncState::parse(&state_str)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown sync state: {state_str}")))?;

    Ok(CachedItem {
        drive_id,
        item_id,
        parent_id,
        name: row.get("name"),
        kind,
        size: row.get::<i64, _>("size") as u64,
        etag: row.get("etag"),
        ctag: row.get("ctag"),
        hashes: ContentHashes {
            quick_xor: row.get("quick_xor_hash"),
            sha1: row.get("sha1_hash"),
            sha256: row.get("sha256_hash"),
        },
        modified: parse_optional_datetime(row.get("modified"))?,
        local_path,
        last_seen: parse_optional_datetime(row.get("last_seen"))?,
        state,
    })
}

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

/// Shared upsert statement; `E` is either the pool or a transaction
const UPSERT_SQL: &str = r#"
INSERT INTO items (
    drive_id, item_id, parent_id, name, kind, size, etag, ctag,
    quick_xor_hash, sha1_hash, sha256_hash, modified, local_path,
    last_seen, state
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (drive_id, item_id) DO UPDATE SET
    parent_id = excluded.parent_id,
    name = excluded.name,
    kind = excluded.kind,
    size = excluded.size,
    etag = excluded.etag,
    ctag = excluded.ctag,
    quick_xor_hash = excluded.quick_xor_hash,
    sha1_hash = excluded.sha1_hash,
    sha256_hash = excluded.sha256_hash,
    modified = excluded.modified,
    local_path = excluded.local_path,
    last_seen = excluded.last_seen,
    state = excluded.state
"#;

fn bind_upsert(item: &CachedItem) -> sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    sqlx::query(UPSERT_SQL)
        .bind(item.drive_id.as_str())
        .bind(item.item_id.as_str())
        .bind(item.parent_id.as_ref().map(|p| p.as_str().to_string()))
        .bind(&item.name)
        .bind(kind_to_string(&item.kind))
        .bind(item.size as i64)
        .bind(&item.etag)
        .bind(&item.ctag)
        .bind(&item.hashes.quick_xor)
        .bind(&item.hashes.sha1)
        .bind(&item.hashes.sha256)
        .bind(item.modified.map(|m| m.to_rfc3339()))
        .bind(
            item.local_path
                .as_ref()
                .map(|p| p.as_path().to_string_lossy().into_owned()),
        )
        .bind(item.last_seen.map(|t| t.to_rfc3339()))
        .bind(item.state.as_str())
}

// ============================================================================
// ItemStore implementation
// ============================================================================

#[async_trait::async_trait]
impl ItemStore for SqliteItemStore {
    async fn upsert(&self, item: &CachedItem) -> Result<(), StoreError> {
        bind_upsert(item)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
    ) -> Result<Option<CachedItem>, StoreError> {
        let row = sqlx::query("SELECT * FROM items WHERE drive_id = ? AND item_id = ?")
            .bind(drive_id.as_str())
            .bind(item_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn children_of(
        &self,
        drive_id: &DriveId,
        parent_id: &ItemId,
    ) -> Result<Vec<CachedItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM items WHERE drive_id = ? AND parent_id = ? ORDER BY name",
        )
        .bind(drive_id.as_str())
        .bind(parent_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter().map(item_from_row).collect()
    }

    async fn get_by_path(&self, path: &SyncPath) -> Result<Option<CachedItem>, StoreError> {
        let row = sqlx::query("SELECT * FROM items WHERE local_path = ?")
            .bind(path.as_path().to_string_lossy().into_owned())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn remove(&self, drive_id: &DriveId, item_id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM items WHERE drive_id = ? AND item_id = ?")
            .bind(drive_id.as_str())
            .bind(item_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn apply_page(
        &self,
        upserts: &[CachedItem],
        removals: &[(DriveId, ItemId)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        for item in upserts {
            bind_upsert(item)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }
        for (drive_id, item_id) in removals {
            sqlx::query("DELETE FROM items WHERE drive_id = ? AND item_id = ?")
                .bind(drive_id.as_str())
                .bind(item_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        debug!(
            upserts = upserts.len(),
            removals = removals.len(),
            "Delta page committed"
        );
        Ok(())
    }

    async fn items_in_drive(&self, drive_id: &DriveId) -> Result<Vec<CachedItem>, StoreError> {
        let rows = sqlx::query("SELECT * FROM items WHERE drive_id = ? ORDER BY local_path")
            .bind(drive_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(query_err)?;

        rows.iter().map(item_from_row).collect()
    }

    async fn tombstones(&self, drive_id: &DriveId) -> Result<Vec<CachedItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM items WHERE drive_id = ? AND state = 'tombstoned'",
        )
        .bind(drive_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter().map(item_from_row).collect()
    }

    async fn orphans(&self) -> Result<Vec<CachedItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT child.* FROM items child
            LEFT JOIN items parent
                ON parent.drive_id = child.drive_id
                AND parent.item_id = child.parent_id
            WHERE child.parent_id IS NOT NULL
                AND parent.item_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter().map(item_from_row).collect()
    }

    async fn clear_drive(&self, drive_id: &DriveId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM items WHERE drive_id = ?")
            .bind(drive_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }
}
