//! Upload operations: simple PUT and resumable sessions
//!
//! Files at or below the simple-upload limit go up in a single
//! `PUT …:/content`. Anything larger opens an upload session and streams
//! 10 MiB chunks (a multiple of the required 320 KiB alignment) with
//! `Content-Range` headers, honoring `nextExpectedRanges` for resume.
//!
//! ## Microsoft Graph API references
//!
//! - <https://learn.microsoft.com/en-us/graph/api/driveitem-put-content>
//! - <https://learn.microsoft.com/en-us/graph/api/driveitem-createuploadsession>

use serde_json::json;
use tracing::{debug, info};

use onesync_core::config::{UPLOAD_CHUNK_ALIGNMENT, UPLOAD_CHUNK_SIZE};
use onesync_core::domain::item::RemoteItem;
use onesync_core::domain::newtypes::{DriveId, ItemId};
use onesync_core::ports::remote_drive::{ChunkOutcome, RemoteError, UploadSession};

use crate::client::GraphClient;
use crate::wire::{self, WireDriveItem, WireUploadSession, WireUploadStatus};

/// Build the item-by-path URL `/drives/{d}/items/{parent}:/{name}:/{suffix}`
fn child_path(drive_id: &DriveId, parent_id: &ItemId, name: &str, suffix: &str) -> String {
    format!(
        "/drives/{}/items/{}:/{}:/{}",
        drive_id.as_str(),
        parent_id.as_str(),
        name,
        suffix
    )
}

/// Upload a small file in one request
///
/// `if_match` carries the cached etag; the server answers 412 when the
/// remote item changed underneath us, which the caller routes into the
/// conflict path.
pub async fn upload_small(
    client: &GraphClient,
    drive_id: &DriveId,
    parent_id: &ItemId,
    name: &str,
    data: Vec<u8>,
    if_match: Option<&str>,
) -> Result<RemoteItem, RemoteError> {
    let url = client.url(&child_path(drive_id, parent_id, name, "content"));
    debug!(name, bytes = data.len(), "Uploading small file");

    let if_match = if_match.map(str::to_string);
    let item: WireDriveItem = client
        .execute_json("upload_small", |http| {
            let builder = http
                .put(&url)
                .header("Content-Type", "application/octet-stream")
                .body(data.clone());
            match &if_match {
                Some(etag) => builder.header("If-Match", etag.clone()),
                None => builder,
            }
        })
        .await?;

    info!(name, id = %item.id, "Small upload complete");
    wire::parse_drive_item(item, drive_id)
}

/// Open a resumable upload session
pub async fn create_session(
    client: &GraphClient,
    drive_id: &DriveId,
    parent_id: &ItemId,
    name: &str,
) -> Result<UploadSession, RemoteError> {
    let url = client.url(&child_path(drive_id, parent_id, name, "createUploadSession"));
    let body = json!({
        "item": {
            "@microsoft.graph.conflictBehavior": "replace",
            "name": name,
        }
    });

    let session: WireUploadSession = client
        .execute_json("create_upload_session", |http| http.post(&url).json(&body))
        .await?;

    debug!(name, "Upload session created");
    Ok(UploadSession {
        upload_url: session.upload_url,
        expires: session.expiration_date_time,
    })
}

/// Upload one chunk within a session
///
/// `range` is inclusive. A 202 means the server expects more and reports
/// where to continue; 200/201 on the final chunk returns the new item.
pub async fn upload_chunk(
    client: &GraphClient,
    session: &UploadSession,
    chunk: Vec<u8>,
    range: (u64, u64),
    total: u64,
) -> Result<ChunkOutcome, RemoteError> {
    let (start, end) = range;
    let content_range = format!("bytes {start}-{end}/{total}");
    debug!(%content_range, "Uploading chunk");

    let url = session.upload_url.clone();
    let response = client
        .execute("upload_chunk", |http| {
            http.put(&url)
                .header("Content-Range", content_range.clone())
                .header("Content-Length", chunk.len())
                .body(chunk.clone())
        })
        .await?;

    if response.status() == reqwest::StatusCode::ACCEPTED {
        let status: WireUploadStatus = response
            .json()
            .await
            .map_err(|e| RemoteError::Transient(format!("bad chunk response: {e}")))?;
        let next_offset = status.next_offset().unwrap_or(end + 1);
        return Ok(ChunkOutcome::More { next_offset });
    }

    // Final chunk: the completed item comes back
    let item: WireDriveItem = response
        .json()
        .await
        .map_err(|e| RemoteError::Transient(format!("bad completion response: {e}")))?;

    // The drive id inside the response is authoritative; the fallback is
    // only used when the parent reference is missing entirely.
    let fallback = DriveId::new("unknown".to_string()).expect("static id is valid");
    let parsed = wire::parse_drive_item(item, &fallback)?;
    info!(name = %parsed.name, "Session upload complete");
    Ok(ChunkOutcome::Done(Box::new(parsed)))
}

/// Query where an interrupted session expects the next byte
pub async fn session_status(
    client: &GraphClient,
    session: &UploadSession,
) -> Result<u64, RemoteError> {
    let url = session.upload_url.clone();
    let status: WireUploadStatus = client
        .execute_json("upload_session_status", |http| http.get(&url))
        .await?;
    Ok(status.next_offset().unwrap_or(0))
}

// ============================================================================
// Chunk math
// ============================================================================

/// Inclusive byte ranges for a session upload of `total` bytes
///
/// Every chunk except the last is exactly [`UPLOAD_CHUNK_SIZE`] long; the
/// chunk size is a multiple of the 320 KiB alignment the service requires.
pub fn chunk_ranges(total: u64) -> Vec<(u64, u64)> {
    chunk_ranges_from(0, total)
}

/// Inclusive byte ranges starting at `offset` (resume case)
pub fn chunk_ranges_from(offset: u64, total: u64) -> Vec<(u64, u64)> {
    debug_assert_eq!(UPLOAD_CHUNK_SIZE % UPLOAD_CHUNK_ALIGNMENT, 0);

    let mut ranges = Vec::new();
    let mut start = offset;
    while start < total {
        let end = (start + UPLOAD_CHUNK_SIZE - 1).min(total - 1);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_path() {
        let drive = DriveId::new("d1".to_string()).unwrap();
        let parent = ItemId::new("p1".to_string()).unwrap();
        assert_eq!(
            child_path(&drive, &parent, "file.txt", "content"),
            "/drives/d1/items/p1:/file.txt:/content"
        );
    }

    #[test]
    fn test_chunk_size_alignment() {
        assert_eq!(UPLOAD_CHUNK_SIZE % UPLOAD_CHUNK_ALIGNMENT, 0);
        assert_eq!(UPLOAD_CHUNK_SIZE, 32 * UPLOAD_CHUNK_ALIGNMENT);
    }

    #[test]
    fn test_chunk_ranges_exact_multiple() {
        let total = UPLOAD_CHUNK_SIZE * 3;
        let ranges = chunk_ranges(total);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], (0, UPLOAD_CHUNK_SIZE - 1));
        assert_eq!(ranges[2], (2 * UPLOAD_CHUNK_SIZE, total - 1));
    }

    #[test]
    fn test_chunk_ranges_with_tail() {
        let total = UPLOAD_CHUNK_SIZE + 5;
        let ranges = chunk_ranges(total);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1], (UPLOAD_CHUNK_SIZE, total - 1));
        // The tail is exactly 5 bytes
        assert_eq!(ranges[1].1 - ranges[1].0 + 1, 5);
    }

    #[test]
    fn test_chunk_ranges_small_file() {
        let ranges = chunk_ranges(10);
        assert_eq!(ranges, vec![(0, 9)]);
    }

    #[test]
    fn test_chunk_ranges_empty_file() {
        assert!(chunk_ranges(0).is_empty());
    }

    #[test]
    fn test_chunk_ranges_resume_from_offset() {
        let total = UPLOAD_CHUNK_SIZE * 2 + 100;
        let ranges = chunk_ranges_from(UPLOAD_CHUNK_SIZE, total);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], (UPLOAD_CHUNK_SIZE, 2 * UPLOAD_CHUNK_SIZE - 1));
        assert_eq!(ranges[1], (2 * UPLOAD_CHUNK_SIZE, total - 1));
    }

    #[test]
    fn test_ranges_cover_everything_contiguously() {
        let total = 3 * UPLOAD_CHUNK_SIZE + 12_345;
        let ranges = chunk_ranges(total);
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges.last().unwrap().1, total - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
    }
}
