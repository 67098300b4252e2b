//! Serde mappings of the Microsoft Graph JSON surface
//!
//! Raw wire structs deserialized from Graph responses, plus the conversion
//! into the engine's [`RemoteItem`] model. Field names are camelCase on the
//! wire; the structs rename accordingly.
//!
//! See: <https://learn.microsoft.com/en-us/graph/api/resources/driveitem>

use chrono::{DateTime, Utc};
use serde::Deserialize;

use onesync_core::domain::item::{ContentHashes, ItemKind, RemoteItem};
use onesync_core::domain::newtypes::{DriveId, ItemId};
use onesync_core::ports::remote_drive::RemoteError;

// ============================================================================
// DriveItem and facets
// ============================================================================

/// A drive item as returned by item endpoints and the delta feed
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDriveItem {
    /// Item identifier within the drive
    pub id: String,

    /// Item name (may be absent on tombstones)
    #[serde(default)]
    pub name: String,

    /// Size in bytes (files)
    pub size: Option<u64>,

    /// ETag; changes on any mutation
    pub e_tag: Option<String>,

    /// CTag; changes only with content
    pub c_tag: Option<String>,

    /// Reference to the parent item
    pub parent_reference: Option<WireParentReference>,

    /// Present iff the item is a file
    pub file: Option<WireFileFacet>,

    /// Present iff the item is a folder
    pub folder: Option<WireFolderFacet>,

    /// Present iff the item is the drive root
    pub root: Option<serde_json::Value>,

    /// Present iff the item is a package (OneNote notebook etc.)
    pub package: Option<serde_json::Value>,

    /// Present iff the item is a shared-folder pointer
    pub remote_item: Option<WireRemoteItemFacet>,

    /// Present iff the item has been deleted
    pub deleted: Option<WireDeletedFacet>,

    /// Filesystem timestamps as the client reported them
    pub file_system_info: Option<WireFileSystemInfo>,

    /// Fallback modification timestamp
    pub last_modified_date_time: Option<DateTime<Utc>>,
}

/// Parent reference information
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireParentReference {
    /// Drive the parent belongs to
    pub drive_id: Option<String>,
    /// Parent item identifier
    pub id: Option<String>,
    /// Drive-relative parent path, e.g. `/drive/root:/Documents`
    pub path: Option<String>,
}

/// File facet with content hashes
#[derive(Debug, Clone, Deserialize)]
pub struct WireFileFacet {
    /// Content hashes, when the service has computed them
    pub hashes: Option<WireHashes>,
}

/// Hash values attached to a file facet
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireHashes {
    /// Base64 quickXorHash (personal drives)
    pub quick_xor_hash: Option<String>,
    /// Hex sha1Hash (business drives)
    pub sha1_hash: Option<String>,
    /// Hex sha256Hash (business drives)
    pub sha256_hash: Option<String>,
}

/// Folder facet; presence is what matters
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFolderFacet {
    /// Number of immediate children
    #[allow(dead_code)]
    pub child_count: Option<u64>,
}

/// Shared-folder pointer facet
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRemoteItemFacet {
    /// Identifier of the target item in the owning drive
    pub id: Option<String>,
    /// Reference to the owning drive
    pub parent_reference: Option<WireParentReference>,
}

/// Deleted facet; presence is what matters
#[derive(Debug, Clone, Deserialize)]
pub struct WireDeletedFacet {
    /// Deletion state, usually absent
    #[allow(dead_code)]
    pub state: Option<String>,
}

/// Client-reported filesystem timestamps
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFileSystemInfo {
    /// Last modification time as the writing client saw it
    pub last_modified_date_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Delta page / drive list / upload session / error envelopes
// ============================================================================

/// Envelope of one delta page
#[derive(Debug, Deserialize)]
pub struct WireDeltaPage {
    /// Changed items in server order
    #[serde(default)]
    pub value: Vec<WireDriveItem>,

    /// URL of the next page, when more pages exist
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,

    /// The delta link, present only on the final page
    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

/// Envelope of a children listing
#[derive(Debug, Deserialize)]
pub struct WireChildrenPage {
    /// Child items
    #[serde(default)]
    pub value: Vec<WireDriveItem>,

    /// URL of the next page for large folders
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

/// Envelope of `GET /me/drives`
#[derive(Debug, Deserialize)]
pub struct WireDriveList {
    /// Drives visible to the signed-in account
    #[serde(default)]
    pub value: Vec<WireDrive>,
}

/// One drive summary
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDrive {
    /// Drive identifier
    pub id: String,
    /// `personal`, `business`, or `documentLibrary`
    pub drive_type: Option<String>,
    /// Owner information
    pub owner: Option<WireIdentitySet>,
    /// Quota block
    pub quota: Option<WireQuota>,
}

/// Identity wrapper (owner.user.displayName)
#[derive(Debug, Deserialize)]
pub struct WireIdentitySet {
    /// Owning user, when present
    pub user: Option<WireIdentity>,
}

/// A single identity
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireIdentity {
    /// Display name
    pub display_name: Option<String>,
}

/// Quota block on a drive
#[derive(Debug, Deserialize)]
pub struct WireQuota {
    /// Bytes used
    pub used: Option<u64>,
    /// Bytes total
    pub total: Option<u64>,
}

/// Response to `createUploadSession`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUploadSession {
    /// URL all chunk PUTs target
    pub upload_url: String,
    /// Session expiry
    pub expiration_date_time: Option<DateTime<Utc>>,
}

/// Progress response to a non-final chunk PUT or a session status GET
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUploadStatus {
    /// Byte ranges the server still expects, e.g. `["26214400-"]`
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

impl WireUploadStatus {
    /// The first byte offset the server expects next
    ///
    /// Graph reports ranges like `"26214400-"` or `"26214400-39321599"`;
    /// the smallest start across all ranges is where resumption continues.
    pub fn next_offset(&self) -> Option<u64> {
        self.next_expected_ranges
            .iter()
            .filter_map(|r| r.split('-').next()?.parse::<u64>().ok())
            .min()
    }
}

/// Graph error envelope: `{"error": {"code": ..., "message": ...}}`
#[derive(Debug, Deserialize)]
pub struct WireErrorEnvelope {
    /// The error body
    pub error: Option<WireErrorBody>,
}

/// Inner error body
#[derive(Debug, Deserialize)]
pub struct WireErrorBody {
    /// Machine-readable code, e.g. `itemNotFound`
    pub code: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
}

// ============================================================================
// Conversion to the engine model
// ============================================================================

/// Convert a wire item into the engine's [`RemoteItem`]
///
/// `fallback_drive_id` names the drive the request targeted; items normally
/// carry their own drive id in the parent reference, but tombstones may not.
pub fn parse_drive_item(
    item: WireDriveItem,
    fallback_drive_id: &DriveId,
) -> Result<RemoteItem, RemoteError> {
    let corrupt = |what: &str, detail: String| RemoteError::Client {
        status: 0,
        code: "malformedItem".to_string(),
        message: format!("{what}: {detail}"),
    };

    let drive_id = item
        .parent_reference
        .as_ref()
        .and_then(|pr| pr.drive_id.clone())
        .map(DriveId::new)
        .transpose()
        .map_err(|e| corrupt("bad parent drive id", e.to_string()))?
        .unwrap_or_else(|| fallback_drive_id.clone());

    let item_id =
        ItemId::new(item.id.clone()).map_err(|e| corrupt("bad item id", e.to_string()))?;

    let parent_id = item
        .parent_reference
        .as_ref()
        .and_then(|pr| pr.id.clone())
        .map(ItemId::new)
        .transpose()
        .map_err(|e| corrupt("bad parent id", e.to_string()))?;

    let kind = if let Some(remote) = &item.remote_item {
        let target_drive = remote
            .parent_reference
            .as_ref()
            .and_then(|pr| pr.drive_id.clone())
            .map(DriveId::new)
            .transpose()
            .map_err(|e| corrupt("bad remote drive id", e.to_string()))?
            .unwrap_or_else(|| drive_id.clone());
        let target_item = remote
            .id
            .clone()
            .map(ItemId::new)
            .transpose()
            .map_err(|e| corrupt("bad remote item id", e.to_string()))?
            .unwrap_or_else(|| item_id.clone());
        ItemKind::Remote {
            drive_id: target_drive,
            item_id: target_item,
        }
    } else if item.root.is_some() {
        ItemKind::Root
    } else if item.package.is_some() {
        ItemKind::Package
    } else if item.folder.is_some() {
        ItemKind::Folder
    } else {
        ItemKind::File
    };

    let hashes = item
        .file
        .as_ref()
        .and_then(|f| f.hashes.as_ref())
        .map(|h| ContentHashes {
            quick_xor: h.quick_xor_hash.clone(),
            sha1: h.sha1_hash.clone(),
            sha256: h.sha256_hash.clone(),
        })
        .unwrap_or_default();

    // Prefer the client-reported timestamp; it survives server-side copies
    let modified = item
        .file_system_info
        .as_ref()
        .and_then(|fsi| fsi.last_modified_date_time)
        .or(item.last_modified_date_time);

    Ok(RemoteItem {
        drive_id,
        item_id,
        parent_id,
        name: item.name,
        kind,
        size: item.size,
        etag: item.e_tag,
        ctag: item.c_tag,
        hashes,
        modified,
        is_deleted: item.deleted.is_some(),
    })
}

/// Pull the code/message out of an error body, tolerating junk
pub fn parse_error_body(body: &str) -> (String, String) {
    match serde_json::from_str::<WireErrorEnvelope>(body) {
        Ok(env) => {
            let err = env.error;
            (
                err.as_ref()
                    .and_then(|e| e.code.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
                err.and_then(|e| e.message)
                    .unwrap_or_else(|| "no message".to_string()),
            )
        }
        Err(_) => ("unknown".to_string(), body.chars().take(200).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive() -> DriveId {
        DriveId::new("drive-1".to_string()).unwrap()
    }

    #[test]
    fn test_deserialize_file_item() {
        let json = r#"{
            "id": "item-001",
            "name": "document.docx",
            "size": 12345,
            "eTag": "\"e-1\"",
            "cTag": "\"c-1\"",
            "lastModifiedDateTime": "2026-06-15T10:30:00Z",
            "parentReference": {
                "driveId": "drive-1",
                "id": "parent-001",
                "path": "/drive/root:/Documents"
            },
            "file": {
                "hashes": {
                    "quickXorHash": "AAAAAAAAAAAAAAAAAAAAAAAAAAA=",
                    "sha256Hash": "BA7816BF"
                }
            },
            "fileSystemInfo": {
                "lastModifiedDateTime": "2026-06-15T10:29:58Z"
            }
        }"#;

        let wire: WireDriveItem = serde_json::from_str(json).unwrap();
        let item = parse_drive_item(wire, &drive()).unwrap();

        assert_eq!(item.item_id.as_str(), "item-001");
        assert_eq!(item.name, "document.docx");
        assert_eq!(item.kind, ItemKind::File);
        assert_eq!(item.size, Some(12345));
        assert_eq!(item.etag.as_deref(), Some("\"e-1\""));
        assert_eq!(
            item.hashes.quick_xor.as_deref(),
            Some("AAAAAAAAAAAAAAAAAAAAAAAAAAA=")
        );
        assert_eq!(item.hashes.sha256.as_deref(), Some("BA7816BF"));
        // fileSystemInfo timestamp preferred over lastModifiedDateTime
        assert_eq!(
            item.modified.unwrap().to_rfc3339(),
            "2026-06-15T10:29:58+00:00"
        );
        assert!(!item.is_deleted);
    }

    #[test]
    fn test_deserialize_folder_item() {
        let json = r#"{
            "id": "folder-001",
            "name": "Documents",
            "parentReference": { "driveId": "drive-1", "id": "root-id" },
            "folder": { "childCount": 5 }
        }"#;

        let wire: WireDriveItem = serde_json::from_str(json).unwrap();
        let item = parse_drive_item(wire, &drive()).unwrap();
        assert_eq!(item.kind, ItemKind::Folder);
        assert!(item.hashes.is_empty());
    }

    #[test]
    fn test_deserialize_root_item() {
        let json = r#"{
            "id": "root-001",
            "name": "root",
            "root": {},
            "folder": { "childCount": 12 }
        }"#;

        let wire: WireDriveItem = serde_json::from_str(json).unwrap();
        let item = parse_drive_item(wire, &drive()).unwrap();
        assert_eq!(item.kind, ItemKind::Root);
    }

    #[test]
    fn test_deserialize_package_item() {
        let json = r#"{
            "id": "pkg-001",
            "name": "Notebook",
            "package": { "type": "oneNote" },
            "parentReference": { "driveId": "drive-1", "id": "root-id" }
        }"#;

        let wire: WireDriveItem = serde_json::from_str(json).unwrap();
        let item = parse_drive_item(wire, &drive()).unwrap();
        assert_eq!(item.kind, ItemKind::Package);
        assert!(item.kind.is_directory_like());
    }

    #[test]
    fn test_deserialize_deleted_item() {
        let json = r#"{
            "id": "gone-001",
            "name": "old.txt",
            "deleted": { "state": "deleted" }
        }"#;

        let wire: WireDriveItem = serde_json::from_str(json).unwrap();
        let item = parse_drive_item(wire, &drive()).unwrap();
        assert!(item.is_deleted);
        // Tombstones fall back to the requested drive
        assert_eq!(item.drive_id.as_str(), "drive-1");
        assert!(item.parent_id.is_none());
    }

    #[test]
    fn test_deserialize_remote_item() {
        let json = r#"{
            "id": "link-001",
            "name": "Shared stuff",
            "parentReference": { "driveId": "drive-1", "id": "root-id" },
            "remoteItem": {
                "id": "target-item",
                "parentReference": { "driveId": "drive-other" }
            }
        }"#;

        let wire: WireDriveItem = serde_json::from_str(json).unwrap();
        let item = parse_drive_item(wire, &drive()).unwrap();
        match item.kind {
            ItemKind::Remote { drive_id, item_id } => {
                assert_eq!(drive_id.as_str(), "drive-other");
                assert_eq!(item_id.as_str(), "target-item");
            }
            other => panic!("expected remote kind, got {other:?}"),
        }
    }

    #[test]
    fn test_delta_page_envelope() {
        let json = r#"{
            "value": [ { "id": "a", "name": "x" } ],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/drives/d/root/delta?$skiptoken=p2"
        }"#;
        let page: WireDeltaPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.value.len(), 1);
        assert!(page.next_link.is_some());
        assert!(page.delta_link.is_none());
    }

    #[test]
    fn test_drive_list_envelope() {
        let json = r#"{
            "value": [
                {
                    "id": "drive-a",
                    "driveType": "personal",
                    "owner": { "user": { "displayName": "Kim" } },
                    "quota": { "used": 10, "total": 100 }
                }
            ]
        }"#;
        let list: WireDriveList = serde_json::from_str(json).unwrap();
        assert_eq!(list.value.len(), 1);
        assert_eq!(list.value[0].drive_type.as_deref(), Some("personal"));
    }

    #[test]
    fn test_upload_status_next_offset() {
        let status: WireUploadStatus = serde_json::from_str(
            r#"{ "nextExpectedRanges": ["26214400-39321599", "52428800-"] }"#,
        )
        .unwrap();
        assert_eq!(status.next_offset(), Some(26214400));

        let empty: WireUploadStatus = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(empty.next_offset(), None);
    }

    #[test]
    fn test_parse_error_body() {
        let (code, message) = parse_error_body(
            r#"{"error": {"code": "itemNotFound", "message": "The resource could not be found."}}"#,
        );
        assert_eq!(code, "itemNotFound");
        assert!(message.contains("could not be found"));

        let (code, _) = parse_error_body("not json at all");
        assert_eq!(code, "unknown");
    }
}
