//! Integration tests for download and upload operations

use futures_util::StreamExt;
use wiremock::matchers::{body_bytes, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use onesync_core::domain::newtypes::{DriveId, ItemId};
use onesync_core::ports::remote_drive::{ChunkOutcome, RemoteDrive, RemoteError, UploadSession};

use crate::common;

fn drive() -> DriveId {
    DriveId::new("drive-1".to_string()).unwrap()
}

fn parent() -> ItemId {
    ItemId::new("root-id".to_string()).unwrap()
}

#[tokio::test]
async fn test_download_streams_content() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/file-1/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
        .mount(&server)
        .await;

    let item = ItemId::new("file-1".to_string()).unwrap();
    let mut stream = client.download(&drive(), &item, 0).await.unwrap();

    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, b"hello world");
}

#[tokio::test]
async fn test_download_resume_sends_range_header() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/file-1/content"))
        .and(header("Range", "bytes=6-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"world".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let item = ItemId::new("file-1".to_string()).unwrap();
    let mut stream = client.download(&drive(), &item, 6).await.unwrap();

    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, b"world");
}

#[tokio::test]
async fn test_upload_small_roundtrip() {
    let (server, client) = common::setup().await;

    Mock::given(method("PUT"))
        .and(path("/drives/drive-1/items/root-id:/new.txt:/content"))
        .and(body_bytes(b"file body".to_vec()))
        .respond_with(ResponseTemplate::new(201).set_body_json(common::file_item_json(
            "uploaded-1",
            "new.txt",
            9,
            "AAAAAAAAAAAAAAAAAAAAAAAAAAA=",
        )))
        .mount(&server)
        .await;

    let item = client
        .upload_small(&drive(), &parent(), "new.txt", b"file body".to_vec(), None)
        .await
        .unwrap();

    assert_eq!(item.item_id.as_str(), "uploaded-1");
    assert_eq!(item.size, Some(9));
}

#[tokio::test]
async fn test_upload_small_etag_conflict() {
    let (server, client) = common::setup().await;

    Mock::given(method("PUT"))
        .and(path("/drives/drive-1/items/root-id:/new.txt:/content"))
        .and(header("If-Match", "\"stale-etag\""))
        .respond_with(ResponseTemplate::new(412).set_body_json(serde_json::json!({
            "error": { "code": "resourceModified", "message": "ETag does not match." }
        })))
        .mount(&server)
        .await;

    let result = client
        .upload_small(
            &drive(),
            &parent(),
            "new.txt",
            b"x".to_vec(),
            Some("\"stale-etag\""),
        )
        .await;

    match result {
        Err(e) => assert!(e.is_etag_conflict()),
        Ok(_) => panic!("expected etag conflict"),
    }
}

#[tokio::test]
async fn test_upload_session_chunks_to_completion() {
    let (server, client) = common::setup().await;

    Mock::given(method("POST"))
        .and(path("/drives/drive-1/items/root-id:/big.bin:/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadUrl": format!("{}/upload-session/abc", server.uri()),
            "expirationDateTime": "2026-05-02T00:00:00Z"
        })))
        .mount(&server)
        .await;

    // First chunk: accepted, more expected
    Mock::given(method("PUT"))
        .and(path("/upload-session/abc"))
        .and(header("Content-Range", "bytes 0-4/10"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
            "nextExpectedRanges": ["5-"]
        })))
        .mount(&server)
        .await;

    // Final chunk: item returned
    Mock::given(method("PUT"))
        .and(path("/upload-session/abc"))
        .and(header("Content-Range", "bytes 5-9/10"))
        .respond_with(ResponseTemplate::new(201).set_body_json(common::file_item_json(
            "big-1",
            "big.bin",
            10,
            "AAAAAAAAAAAAAAAAAAAAAAAAAAA=",
        )))
        .mount(&server)
        .await;

    let session = client
        .create_upload_session(&drive(), &parent(), "big.bin")
        .await
        .unwrap();
    assert!(session.upload_url.contains("/upload-session/abc"));

    let outcome = client
        .upload_chunk(&session, b"01234".to_vec(), (0, 4), 10)
        .await
        .unwrap();
    match outcome {
        ChunkOutcome::More { next_offset } => assert_eq!(next_offset, 5),
        other => panic!("expected More, got {other:?}"),
    }

    let outcome = client
        .upload_chunk(&session, b"56789".to_vec(), (5, 9), 10)
        .await
        .unwrap();
    match outcome {
        ChunkOutcome::Done(item) => {
            assert_eq!(item.item_id.as_str(), "big-1");
            assert_eq!(item.size, Some(10));
        }
        other => panic!("expected Done, got {other:?}"),
    }
}

#[tokio::test]
async fn test_upload_session_status_reports_next_offset() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/upload-session/resume"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "nextExpectedRanges": ["26214400-"]
        })))
        .mount(&server)
        .await;

    let session = UploadSession {
        upload_url: format!("{}/upload-session/resume", server.uri()),
        expires: None,
    };
    let offset = client.upload_session_status(&session).await.unwrap();
    assert_eq!(offset, 26214400);
}

#[tokio::test]
async fn test_create_folder() {
    let (server, client) = common::setup().await;

    Mock::given(method("POST"))
        .and(path("/drives/drive-1/items/root-id/children"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(common::folder_item_json("new-folder-1", "Photos")),
        )
        .mount(&server)
        .await;

    let item = client
        .create_folder(&drive(), &parent(), "Photos")
        .await
        .unwrap();
    assert_eq!(item.item_id.as_str(), "new-folder-1");
    assert!(item.kind.is_directory_like());
}

#[tokio::test]
async fn test_rename_item() {
    let (server, client) = common::setup().await;

    Mock::given(method("PATCH"))
        .and(path("/drives/drive-1/items/item-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::file_item_json(
            "item-9",
            "renamed.txt",
            7,
            "AAAAAAAAAAAAAAAAAAAAAAAAAAA=",
        )))
        .mount(&server)
        .await;

    let item_id = ItemId::new("item-9".to_string()).unwrap();
    let item = client
        .rename_item(&drive(), &item_id, None, Some("renamed.txt"))
        .await
        .unwrap();
    assert_eq!(item.name, "renamed.txt");
}

#[tokio::test]
async fn test_delete_item() {
    let (server, client) = common::setup().await;

    Mock::given(method("DELETE"))
        .and(path("/drives/drive-1/items/item-9"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let item_id = ItemId::new("item-9".to_string()).unwrap();
    client.delete_item(&drive(), &item_id).await.unwrap();
}

#[tokio::test]
async fn test_list_drives() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drives"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                {
                    "id": "drive-1",
                    "driveType": "personal",
                    "owner": { "user": { "displayName": "Kim" } },
                    "quota": { "used": 1024, "total": 5368709120u64 }
                },
                {
                    "id": "drive-2",
                    "driveType": "business"
                }
            ]
        })))
        .mount(&server)
        .await;

    let drives = client.list_drives().await.unwrap();
    assert_eq!(drives.len(), 2);
    assert_eq!(drives[0].id.as_str(), "drive-1");
    assert_eq!(drives[0].owner.as_deref(), Some("Kim"));
    assert_eq!(drives[1].drive_type, "business");
}

#[tokio::test]
async fn test_list_children_follows_pagination() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/folder-1/children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                common::file_item_json("c1", "a.txt", 1, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            ],
            "@odata.nextLink": format!(
                "{}/drives/drive-1/items/folder-1/children?$skiptoken=p2",
                server.uri()
            )
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/folder-1/children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                common::folder_item_json("c2", "Sub")
            ]
        })))
        .mount(&server)
        .await;

    let folder = ItemId::new("folder-1".to_string()).unwrap();
    let children = client.list_children(&drive(), &folder).await.unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].name, "a.txt");
    assert_eq!(children[1].name, "Sub");
}

#[tokio::test]
async fn test_download_error_is_categorized() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/missing/content"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "error": { "code": "itemNotFound", "message": "gone" }
        })))
        .mount(&server)
        .await;

    let item = ItemId::new("missing".to_string()).unwrap();
    let result = client.download(&drive(), &item, 0).await;
    assert!(matches!(
        result,
        Err(RemoteError::Client { status: 404, .. })
    ));
}
