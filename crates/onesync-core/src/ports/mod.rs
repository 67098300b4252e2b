//! Ports: the traits adapters implement for the engine
//!
//! - [`remote_drive`] — the consumed Graph surface (delta feed, content
//!   transfer, item mutation)
//! - [`item_store`] — the persistent item database
//! - [`change_sink`] — the callback a filesystem monitor feeds

pub mod change_sink;
pub mod item_store;
pub mod remote_drive;

pub use change_sink::{ChangeSink, PathChangeKind};
pub use item_store::{ItemStore, StoreError};
pub use remote_drive::{
    ByteStream, ChunkOutcome, DeltaPage, DriveInfo, FixedBudget, RemoteDrive, RemoteError,
    TransferBudget, UploadSession,
};
