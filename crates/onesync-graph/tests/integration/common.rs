//! Shared helpers for Graph adapter integration tests
//!
//! Provides wiremock-based mock server setup plus JSON builders for the
//! drive-item payloads the tests exercise.

use std::sync::Arc;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use onesync_graph::client::StaticToken;
use onesync_graph::{GraphClient, ThrottleGovernor};

/// Start a mock server and a client pointed at it
pub async fn setup() -> (MockServer, GraphClient) {
    let server = MockServer::start().await;
    let client = GraphClient::with_base_url(
        Arc::new(StaticToken("test-access-token".to_string())),
        Arc::new(ThrottleGovernor::new(8)),
        server.uri(),
    );
    (server, client)
}

/// Like [`setup`] but with a shrunken retry budget for failure tests
pub async fn setup_with_attempts(attempts: u32) -> (MockServer, GraphClient) {
    let server = MockServer::start().await;
    let client = GraphClient::with_base_url(
        Arc::new(StaticToken("test-access-token".to_string())),
        Arc::new(ThrottleGovernor::new(8)),
        server.uri(),
    )
    .with_max_attempts(attempts);
    (server, client)
}

/// JSON for a plain file item
pub fn file_item_json(id: &str, name: &str, size: u64, quick_xor: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "size": size,
        "eTag": format!("\"etag-{id}\""),
        "cTag": format!("\"ctag-{id}\""),
        "lastModifiedDateTime": "2026-05-01T12:00:00Z",
        "parentReference": {
            "driveId": "drive-1",
            "id": "root-id",
            "path": "/drives/drive-1/root:"
        },
        "file": {
            "hashes": { "quickXorHash": quick_xor }
        },
        "fileSystemInfo": {
            "lastModifiedDateTime": "2026-05-01T12:00:00Z"
        }
    })
}

/// JSON for a folder item
pub fn folder_item_json(id: &str, name: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "parentReference": {
            "driveId": "drive-1",
            "id": "root-id"
        },
        "folder": { "childCount": 0 }
    })
}

/// Mount a delta endpoint returning a single final page
pub async fn mount_delta_single_page(
    server: &MockServer,
    items: serde_json::Value,
    delta_token: &str,
) {
    Mock::given(method("GET"))
        .and(path("/drives/drive-1/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": items,
            "@odata.deltaLink": format!(
                "{}/drives/drive-1/root/delta?token={}",
                server.uri(),
                delta_token
            )
        })))
        .mount(server)
        .await;
}
