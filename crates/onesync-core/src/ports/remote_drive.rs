//! Remote drive port (driven/secondary port)
//!
//! The surface of the Microsoft Graph API the engine consumes, expressed as
//! a provider-shaped trait so the engine and its tests never touch HTTP.
//! The adapter in `onesync-graph` owns retry, rate limiting, and the token
//! lifecycle; errors crossing this boundary are already post-retry and carry
//! the category the scheduler needs for its own re-enqueue decisions.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::domain::item::RemoteItem;
use crate::domain::newtypes::{DeltaLink, DriveId, ItemId};

// ============================================================================
// RemoteError
// ============================================================================

/// Categorized failure of a remote operation
///
/// The retry policy inside the Graph adapter has already run by the time one
/// of these surfaces; `Transient`/`Server`/`Network` here mean "retries
/// exhausted". `RateLimited` carries the server-provided delay so the
/// scheduler can park the intent instead of burning a worker.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Retried transient failure that never succeeded
    #[error("transient failure: {0}")]
    Transient(String),

    /// HTTP 429 with the server-provided delay
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited {
        /// Value of the `Retry-After` header
        retry_after: Duration,
    },

    /// Final 4xx failure; not retryable
    #[error("client error {status}: {code}: {message}")]
    Client {
        /// HTTP status code
        status: u16,
        /// Graph error code (e.g. `itemNotFound`, `nameAlreadyExists`)
        code: String,
        /// Human-readable message from the error body
        message: String,
    },

    /// Bearer token rejected twice in a row
    #[error("authorization expired")]
    AuthExpired,

    /// 5xx that outlived all retries
    #[error("server error {status}")]
    Server {
        /// HTTP status code
        status: u16,
    },

    /// Transport-level failure (DNS, connect, TLS, reset)
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 410 on a delta request: the token is gone, reseed from scratch
    #[error("delta token no longer valid; full reseed required")]
    DeltaReset,
}

impl RemoteError {
    /// Returns true if the scheduler should re-enqueue the intent
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Transient(_)
                | RemoteError::RateLimited { .. }
                | RemoteError::Server { .. }
                | RemoteError::Network(_)
        )
    }

    /// Returns true for the etag-mismatch statuses that route an upload
    /// into the conflict path
    pub fn is_etag_conflict(&self) -> bool {
        matches!(self, RemoteError::Client { status: 409 | 412, .. })
    }

    /// Returns true for item-not-found
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Client { status: 404, .. })
    }
}

// ============================================================================
// Wire-shaped DTOs
// ============================================================================

/// One page of the change feed
///
/// Exactly one of `next_link` / `delta_link` is present on a well-formed
/// page; the processor applies `items` in server order before following
/// either.
#[derive(Debug, Clone)]
pub struct DeltaPage {
    /// Changed items in server order
    pub items: Vec<RemoteItem>,
    /// Absolute URL of the next page, when more pages follow
    pub next_link: Option<String>,
    /// The resumption token, present only on the final page
    pub delta_link: Option<DeltaLink>,
}

impl DeltaPage {
    /// Returns true when this is the final page of the feed
    pub fn is_final(&self) -> bool {
        self.delta_link.is_some()
    }
}

/// Summary of one drive visible to the signed-in account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveInfo {
    /// Drive identifier
    pub id: DriveId,
    /// Drive type: `personal`, `business`, or `documentLibrary`
    pub drive_type: String,
    /// Owner display name, when reported
    pub owner: Option<String>,
    /// Quota used in bytes
    pub quota_used: Option<u64>,
    /// Quota total in bytes
    pub quota_total: Option<u64>,
}

/// A resumable upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Opaque session URL all chunk PUTs target
    pub upload_url: String,
    /// Server-side expiry of the session
    pub expires: Option<DateTime<Utc>>,
}

/// Outcome of uploading one chunk within a session
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// The server accepted the chunk and expects more, starting at `next_offset`
    More {
        /// First byte offset of the next expected range
        next_offset: u64,
    },
    /// The final chunk completed the upload; the new item is returned
    Done(Box<RemoteItem>),
}

/// Streaming download body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RemoteError>> + Send>>;

/// Source of the transfer scheduler's concurrency budget
///
/// The Graph adapter's adaptive governor implements this; it shrinks the
/// budget under throttling and grows it back after clean windows. The
/// scheduler polls it before starting each transfer.
pub trait TransferBudget: Send + Sync {
    /// Transfers allowed to run right now (at least 1)
    fn current_budget(&self) -> usize;
}

/// A constant budget, for tests and non-adaptive setups
pub struct FixedBudget(pub usize);

impl TransferBudget for FixedBudget {
    fn current_budget(&self) -> usize {
        self.0.max(1)
    }
}

// ============================================================================
// RemoteDrive trait
// ============================================================================

/// Port trait over the consumed Graph surface
///
/// Implementations must be safe to share across the transfer workers
/// (`Send + Sync`); the engine holds one instance behind an `Arc`.
#[async_trait::async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Enumerate the drives visible to the signed-in account
    async fn list_drives(&self) -> Result<Vec<DriveInfo>, RemoteError>;

    /// Fetch the first page of a delta query
    ///
    /// With `link` present, resumes from that point in the feed; with
    /// `None`, starts a full enumeration. A 410 surfaces as
    /// [`RemoteError::DeltaReset`].
    async fn delta_page_initial(
        &self,
        drive_id: &DriveId,
        link: Option<&DeltaLink>,
    ) -> Result<DeltaPage, RemoteError>;

    /// Fetch a subsequent page at an absolute `@odata.nextLink` URL
    async fn delta_page_next(&self, next_link: &str) -> Result<DeltaPage, RemoteError>;

    /// Fetch a single item's current metadata
    async fn get_item(&self, drive_id: &DriveId, item_id: &ItemId)
        -> Result<RemoteItem, RemoteError>;

    /// List the children of a folder
    ///
    /// Used for spot-checks outside the delta flow (status displays,
    /// targeted verification); bulk enumeration always goes through delta.
    async fn list_children(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
    ) -> Result<Vec<RemoteItem>, RemoteError>;

    /// Stream a file's content starting at `offset`
    ///
    /// `offset > 0` issues a `Range: bytes=offset-` request so an
    /// interrupted download can resume into its partial file.
    async fn download(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
        offset: u64,
    ) -> Result<ByteStream, RemoteError>;

    /// Upload a small file (at most the simple-upload limit) in one PUT
    ///
    /// `if_match` carries the cached etag for optimistic concurrency; a 412
    /// from a concurrent remote change surfaces via
    /// [`RemoteError::is_etag_conflict`].
    async fn upload_small(
        &self,
        drive_id: &DriveId,
        parent_id: &ItemId,
        name: &str,
        data: Vec<u8>,
        if_match: Option<&str>,
    ) -> Result<RemoteItem, RemoteError>;

    /// Open a resumable upload session for a large file
    async fn create_upload_session(
        &self,
        drive_id: &DriveId,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<UploadSession, RemoteError>;

    /// Upload one chunk within a session
    ///
    /// `range` is the inclusive byte range of this chunk and `total` the
    /// full file size, forming the `Content-Range` header.
    async fn upload_chunk(
        &self,
        session: &UploadSession,
        chunk: Vec<u8>,
        range: (u64, u64),
        total: u64,
    ) -> Result<ChunkOutcome, RemoteError>;

    /// Query a session for the ranges the server still expects
    ///
    /// Used to resume an interrupted session at the right offset.
    async fn upload_session_status(&self, session: &UploadSession)
        -> Result<u64, RemoteError>;

    /// Create a folder under `parent_id`
    async fn create_folder(
        &self,
        drive_id: &DriveId,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<RemoteItem, RemoteError>;

    /// Rename and/or move an item
    async fn rename_item(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
        new_parent_id: Option<&ItemId>,
        new_name: Option<&str>,
    ) -> Result<RemoteItem, RemoteError>;

    /// Delete an item
    async fn delete_item(&self, drive_id: &DriveId, item_id: &ItemId)
        -> Result<(), RemoteError>;
}
