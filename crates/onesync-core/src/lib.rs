//! Core domain model and ports for onesync
//!
//! This crate holds everything the synchronization engine agrees on but no
//! adapter owns: validated identifier newtypes, the remote/cached item model,
//! content hashing (including Microsoft's quickXorHash), the engine
//! configuration, and the port traits that the Graph adapter, the item store,
//! and the filesystem monitor implement.
//!
//! The crate is deliberately free of I/O. Adapters live in `onesync-graph`,
//! `onesync-store`, and `onesync-engine`.

pub mod config;
pub mod domain;
pub mod hash;
pub mod ports;

pub use config::EngineConfig;
pub use domain::errors::{DomainError, EngineError};
pub use domain::item::{CachedItem, ContentHashes, ItemKind, RemoteItem, SyncState};
pub use domain::newtypes::{DeltaLink, DriveId, ItemId, RemotePath, SyncPath};
pub use domain::report::SyncReport;
