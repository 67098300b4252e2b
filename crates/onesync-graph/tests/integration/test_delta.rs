//! Integration tests for the change-feed pager
//!
//! Verifies single-page and paginated delta queries, item classification,
//! and the 410-Gone reseed signal against a mock Graph server.

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use onesync_core::domain::item::ItemKind;
use onesync_core::domain::newtypes::{DeltaLink, DriveId};
use onesync_core::ports::remote_drive::{RemoteDrive, RemoteError};

use crate::common;

fn drive() -> DriveId {
    DriveId::new("drive-1".to_string()).unwrap()
}

#[tokio::test]
async fn test_initial_delta_single_page() {
    let (server, client) = common::setup().await;

    let items = serde_json::json!([
        common::file_item_json("file-001", "document.txt", 1024, "AAAAAAAAAAAAAAAAAAAAAAAAAAA="),
        common::folder_item_json("folder-001", "Documents"),
    ]);
    common::mount_delta_single_page(&server, items, "token-final").await;

    let page = client.delta_page_initial(&drive(), None).await.unwrap();

    assert_eq!(page.items.len(), 2);
    assert!(page.next_link.is_none());
    assert!(page.is_final());
    assert!(page
        .delta_link
        .as_ref()
        .unwrap()
        .as_str()
        .contains("token=token-final"));

    let file = &page.items[0];
    assert_eq!(file.item_id.as_str(), "file-001");
    assert_eq!(file.kind, ItemKind::File);
    assert_eq!(file.size, Some(1024));
    assert_eq!(file.drive_id.as_str(), "drive-1");
    assert_eq!(
        file.hashes.quick_xor.as_deref(),
        Some("AAAAAAAAAAAAAAAAAAAAAAAAAAA=")
    );

    let folder = &page.items[1];
    assert_eq!(folder.kind, ItemKind::Folder);
    assert!(folder.hashes.is_empty());
}

#[tokio::test]
async fn test_delta_resume_uses_stored_link() {
    let (server, client) = common::setup().await;

    // The stored link is requested verbatim (it is an absolute URL)
    Mock::given(method("GET"))
        .and(path("/drives/drive-1/root/delta"))
        .and(query_param("token", "stored-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [],
            "@odata.deltaLink": format!(
                "{}/drives/drive-1/root/delta?token=advanced",
                server.uri()
            )
        })))
        .mount(&server)
        .await;

    let link = DeltaLink::new(format!(
        "{}/drives/drive-1/root/delta?token=stored-token",
        server.uri()
    ))
    .unwrap();

    let page = client.delta_page_initial(&drive(), Some(&link)).await.unwrap();
    assert!(page.items.is_empty());
    assert!(page
        .delta_link
        .unwrap()
        .as_str()
        .contains("token=advanced"));
}

#[tokio::test]
async fn test_pager_follows_pagination() {
    let (server, client) = common::setup().await;

    // Page 1: has a nextLink
    Mock::given(method("GET"))
        .and(path("/drives/drive-1/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                common::file_item_json("p1-file", "a.txt", 10, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            ],
            "@odata.nextLink": format!(
                "{}/drives/drive-1/root/delta?$skiptoken=page2",
                server.uri()
            )
        })))
        .mount(&server)
        .await;

    // Page 2: final
    Mock::given(method("GET"))
        .and(path("/drives/drive-1/root/delta"))
        .and(query_param("$skiptoken", "page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                common::file_item_json("p2-file", "b.txt", 20, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            ],
            "@odata.deltaLink": format!(
                "{}/drives/drive-1/root/delta?token=done",
                server.uri()
            )
        })))
        .mount(&server)
        .await;

    let page1 = client.delta_page_initial(&drive(), None).await.unwrap();
    assert_eq!(page1.items[0].item_id.as_str(), "p1-file");
    assert!(!page1.is_final());

    let page2 = client
        .delta_page_next(page1.next_link.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(page2.items[0].item_id.as_str(), "p2-file");
    assert!(page2.is_final());
    assert!(page2
        .delta_link
        .unwrap()
        .as_str()
        .contains("token=done"));
}

#[tokio::test]
async fn test_delta_gone_surfaces_reset() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/root/delta"))
        .respond_with(ResponseTemplate::new(410).set_body_json(serde_json::json!({
            "error": { "code": "resyncRequired", "message": "The delta token is no longer valid." }
        })))
        .mount(&server)
        .await;

    let result = client.delta_page_initial(&drive(), None).await;
    assert!(matches!(result, Err(RemoteError::DeltaReset)));
}

#[tokio::test]
async fn test_delta_classifies_deleted_and_remote_items() {
    let (server, client) = common::setup().await;

    let items = serde_json::json!([
        {
            "id": "gone-1",
            "name": "old.txt",
            "deleted": {}
        },
        {
            "id": "shared-1",
            "name": "Team folder",
            "parentReference": { "driveId": "drive-1", "id": "root-id" },
            "remoteItem": {
                "id": "target-9",
                "parentReference": { "driveId": "drive-other" }
            }
        }
    ]);
    common::mount_delta_single_page(&server, items, "t").await;

    let page = client.delta_page_initial(&drive(), None).await.unwrap();
    assert_eq!(page.items.len(), 2);

    let tombstone = &page.items[0];
    assert!(tombstone.is_deleted);
    // Tombstones inherit the polled drive
    assert_eq!(tombstone.drive_id.as_str(), "drive-1");

    match &page.items[1].kind {
        ItemKind::Remote { drive_id, item_id } => {
            assert_eq!(drive_id.as_str(), "drive-other");
            assert_eq!(item_id.as_str(), "target-9");
        }
        other => panic!("expected remote kind, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_item_is_skipped_not_fatal() {
    let (server, client) = common::setup().await;

    let items = serde_json::json!([
        { "id": "has space in id", "name": "bad" },
        common::file_item_json("good-1", "ok.txt", 5, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")
    ]);
    common::mount_delta_single_page(&server, items, "t").await;

    let page = client.delta_page_initial(&drive(), None).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].item_id.as_str(), "good-1");
}
