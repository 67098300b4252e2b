//! Integration tests for the retry policy
//!
//! Exercises 429 Retry-After handling, 5xx backoff, 401 handling, final
//! client errors, and the throttle governor's reaction to a 429 storm.

use std::time::Instant;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use onesync_core::domain::newtypes::{DriveId, ItemId};
use onesync_core::ports::remote_drive::{RemoteDrive, RemoteError};

use crate::common;

fn drive() -> DriveId {
    DriveId::new("drive-1".to_string()).unwrap()
}

fn item() -> ItemId {
    ItemId::new("item-1".to_string()).unwrap()
}

fn item_json() -> serde_json::Value {
    common::file_item_json("item-1", "a.txt", 3, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")
}

#[tokio::test]
async fn test_429_sleeps_retry_after_then_succeeds() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/item-1"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "1")
                .set_body_json(serde_json::json!({
                    "error": { "code": "activityLimitReached", "message": "throttled" }
                })),
        )
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/item-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(item_json()))
        .mount(&server)
        .await;

    let started = Instant::now();
    let result = client.get_item(&drive(), &item()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.item_id.as_str(), "item-1");
    // Two 429s at Retry-After: 1 each means at least ~2 s of sleeping
    assert!(
        elapsed.as_millis() >= 1900,
        "expected Retry-After sleeps, elapsed only {elapsed:?}"
    );
}

#[tokio::test]
async fn test_429_storm_exhausts_and_reports_rate_limited() {
    let (server, client) = common::setup_with_attempts(2).await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/item-1"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "1")
                .set_body_json(serde_json::json!({
                    "error": { "code": "activityLimitReached", "message": "throttled" }
                })),
        )
        .mount(&server)
        .await;

    let result = client.get_item(&drive(), &item()).await;
    match result {
        Err(RemoteError::RateLimited { retry_after }) => {
            assert_eq!(retry_after.as_secs(), 1);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn test_5xx_retries_then_succeeds() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/item-1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/item-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(item_json()))
        .mount(&server)
        .await;

    let result = client.get_item(&drive(), &item()).await.unwrap();
    assert_eq!(result.name, "a.txt");
}

#[tokio::test]
async fn test_5xx_exhaustion_surfaces_server_error() {
    let (server, client) = common::setup_with_attempts(2).await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/item-1"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let result = client.get_item(&drive(), &item()).await;
    assert!(matches!(result, Err(RemoteError::Server { status: 502 })));
}

#[tokio::test]
async fn test_401_with_unrefreshable_token_is_auth_expired() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/item-1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    // StaticToken cannot refresh, so the one-shot refresh itself fails
    let result = client.get_item(&drive(), &item()).await;
    assert!(matches!(result, Err(RemoteError::AuthExpired)));
}

#[tokio::test]
async fn test_404_is_final_client_error() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/item-1"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "error": { "code": "itemNotFound", "message": "The resource could not be found." }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = client.get_item(&drive(), &item()).await;
    match result {
        Err(e @ RemoteError::Client { status: 404, .. }) => {
            assert!(e.is_not_found());
            assert!(!e.is_retryable());
        }
        other => panic!("expected 404 client error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_throttle_governor_reacts_to_429_storm() {
    let (server, client) = common::setup_with_attempts(4).await;

    Mock::given(method("GET"))
        .and(path("/drives/drive-1/items/item-1"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "0")
                .set_body_json(serde_json::json!({
                    "error": { "code": "activityLimitReached", "message": "throttled" }
                })),
        )
        .mount(&server)
        .await;

    assert_eq!(client.governor().current_budget(), 8);
    let _ = client.get_item(&drive(), &item()).await;
    // Three consecutive throttles within the window halve the budget
    assert!(client.governor().current_budget() <= 4);
}
