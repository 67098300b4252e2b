//! File-based persistent state: delta links and upload resume markers
//!
//! The state layout keeps two kinds of small files next to the database:
//!
//! - `delta_link_<driveId>` — the last fully-applied delta link per drive.
//!   Written atomically (temp file + rename) *after* the corresponding page
//!   transaction commits, which is what makes "link present ⇒ page durably
//!   applied" hold across crashes.
//! - `resume_upload_<itemId>` — session URL and next offset of an
//!   interrupted upload session, JSON-encoded.

use serde::{Deserialize, Serialize};
use tracing::debug;

use onesync_core::config::StateLayout;
use onesync_core::domain::newtypes::{DeltaLink, DriveId, ItemId};
use onesync_core::ports::item_store::StoreError;

/// A persisted upload session: where to continue an interrupted upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeMarker {
    /// The session URL all chunk PUTs target
    pub upload_url: String,
    /// First byte offset of the next chunk
    pub next_offset: u64,
    /// Total file size the session was opened for
    pub total_size: u64,
}

/// Reader/writer over the file-based state layout
#[derive(Debug, Clone)]
pub struct StateFiles {
    layout: StateLayout,
}

impl StateFiles {
    /// Create over a state layout
    #[must_use]
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    /// Load the persisted delta link for a drive
    pub fn delta_link(&self, drive_id: &DriveId) -> Result<Option<DeltaLink>, StoreError> {
        let path = self.layout.delta_link_path(drive_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                DeltaLink::new(trimmed.to_string())
                    .map(Some)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Query(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Persist the delta link for a drive (atomic replace)
    pub fn set_delta_link(
        &self,
        drive_id: &DriveId,
        link: &DeltaLink,
    ) -> Result<(), StoreError> {
        let path = self.layout.delta_link_path(drive_id);
        write_atomically(&path, link.as_str().as_bytes())?;
        debug!(drive = drive_id.as_str(), "Persisted delta link");
        Ok(())
    }

    /// Discard the delta link for a drive (resync/reseed)
    pub fn clear_delta_link(&self, drive_id: &DriveId) -> Result<(), StoreError> {
        remove_if_exists(&self.layout.delta_link_path(drive_id))
    }

    /// Load the resume marker for an interrupted upload
    pub fn resume_marker(&self, item_id: &ItemId) -> Result<Option<ResumeMarker>, StoreError> {
        let path = self.layout.resume_upload_path(item_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("bad resume marker: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Query(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Persist a resume marker (atomic replace)
    pub fn save_resume_marker(
        &self,
        item_id: &ItemId,
        marker: &ResumeMarker,
    ) -> Result<(), StoreError> {
        let path = self.layout.resume_upload_path(item_id);
        let json = serde_json::to_string(marker)
            .map_err(|e| StoreError::Query(format!("cannot encode resume marker: {e}")))?;
        write_atomically(&path, json.as_bytes())?;
        debug!(item = item_id.as_str(), offset = marker.next_offset, "Saved resume marker");
        Ok(())
    }

    /// Remove a resume marker once the upload completes or restarts
    pub fn clear_resume_marker(&self, item_id: &ItemId) -> Result<(), StoreError> {
        remove_if_exists(&self.layout.resume_upload_path(item_id))
    }
}

/// Write via a temp file and rename so readers never see a torn file
fn write_atomically(path: &std::path::Path, content: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().ok_or_else(|| {
        StoreError::Query(format!("no parent directory for {}", path.display()))
    })?;
    std::fs::create_dir_all(parent)
        .map_err(|e| StoreError::Query(format!("cannot create {}: {e}", parent.display())))?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)
        .map_err(|e| StoreError::Query(format!("cannot write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| StoreError::Query(format!("cannot replace {}: {e}", path.display())))?;
    Ok(())
}

fn remove_if_exists(path: &std::path::Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Query(format!(
            "cannot remove {}: {e}",
            path.display()
        ))),
    }
}
