//! Persistent item database for onesync
//!
//! SQLite-backed implementation of the engine's
//! [`ItemStore`](onesync_core::ports::ItemStore) port, plus the file-based
//! pieces of the persistent state layout (per-drive delta links and upload
//! resume markers).
//!
//! - [`pool`] — connection pool setup (WAL, busy timeout, in-memory mode)
//! - [`schema`] — versioned schema with forward-only migration
//! - [`repository`] — the `ItemStore` implementation
//! - [`state`] — delta-link and resume-marker files

pub mod pool;
pub mod repository;
pub mod schema;
pub mod state;

pub use pool::DatabasePool;
pub use repository::SqliteItemStore;
pub use state::{ResumeMarker, StateFiles};
