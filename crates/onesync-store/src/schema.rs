//! Versioned schema with forward-only migration
//!
//! On startup the stored version is compared with [`SCHEMA_VERSION`]:
//! older databases migrate forward step by step; a newer database aborts
//! with `SchemaIncompatible` (never write into state a future binary owns).

use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use onesync_core::ports::item_store::StoreError;

/// Schema version this binary writes
pub const SCHEMA_VERSION: i64 = 1;

/// Create-or-migrate the schema
pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
    )
    .execute(pool)
    .await
    .map_err(migration_err)?;

    let found = current_version(pool).await?;

    if found > SCHEMA_VERSION {
        return Err(StoreError::SchemaIncompatible {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    if found == SCHEMA_VERSION {
        debug!(version = found, "Schema up to date");
        return Ok(());
    }

    let mut version = found;
    while version < SCHEMA_VERSION {
        version += 1;
        apply_migration(pool, version).await?;
        info!(version, "Applied schema migration");
    }

    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await
        .map_err(migration_err)?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await
        .map_err(migration_err)?;

    Ok(())
}

/// Read the stored version; 0 means a fresh database
pub async fn current_version(pool: &SqlitePool) -> Result<i64, StoreError> {
    let row = sqlx::query("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(migration_err)?;

    Ok(row.map(|r| r.get::<i64, _>("version")).unwrap_or(0))
}

async fn apply_migration(pool: &SqlitePool, version: i64) -> Result<(), StoreError> {
    match version {
        1 => {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS items (
                    drive_id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    parent_id TEXT,
                    name TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    size INTEGER NOT NULL DEFAULT 0,
                    etag TEXT,
                    ctag TEXT,
                    quick_xor_hash TEXT,
                    sha1_hash TEXT,
                    sha256_hash TEXT,
                    modified TEXT,
                    local_path TEXT,
                    last_seen TEXT,
                    state TEXT NOT NULL DEFAULT 'present',
                    PRIMARY KEY (drive_id, item_id)
                )
                "#,
            )
            .execute(pool)
            .await
            .map_err(migration_err)?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_items_parent \
                 ON items (drive_id, parent_id)",
            )
            .execute(pool)
            .await
            .map_err(migration_err)?;

            sqlx::query(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_items_local_path \
                 ON items (local_path)",
            )
            .execute(pool)
            .await
            .map_err(migration_err)?;

            Ok(())
        }
        other => Err(StoreError::Migration(format!(
            "no migration defined for version {other}"
        ))),
    }
}

fn migration_err(e: sqlx::Error) -> StoreError {
    StoreError::Migration(e.to_string())
}
