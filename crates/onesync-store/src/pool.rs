//! Database connection pool management
//!
//! Wraps SQLx's `SqlitePool` with:
//! - automatic directory creation for database files
//! - WAL journal mode for concurrent reads under a single writer
//! - schema migration on first connection
//! - an in-memory mode for tests

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use onesync_core::ports::item_store::StoreError;

use crate::schema;

/// A pool of SQLite connections over the item database
///
/// File-backed pools allow 5 connections (readers tolerate stale views
/// within a phase; writes serialize in SQLite itself). In-memory pools are
/// pinned to a single connection so the data survives between queries.
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if missing) the database at `db_path` and migrate it
    ///
    /// # Errors
    /// `StoreError::Connection` if the file cannot be opened,
    /// `StoreError::SchemaIncompatible` / `StoreError::Migration` from the
    /// schema check.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!(
                    "failed to create {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(format!("failed to open database: {e}")))?;

        schema::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an in-memory database (tests)
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().filename(":memory:");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(format!("failed to open memory db: {e}")))?;

        schema::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying SQLx pool
    pub fn inner(&self) -> &SqlitePool {
        &self.pool
    }
}
