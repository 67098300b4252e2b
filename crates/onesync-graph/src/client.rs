//! Typed Microsoft Graph client
//!
//! [`GraphClient`] wraps `reqwest::Client` with bearer authentication, the
//! retry policy, and error categorization, and implements the engine's
//! [`RemoteDrive`] port.
//!
//! ## Retry policy
//!
//! Owned here, not by callers:
//! - network errors, timeouts, and 5xx retry with exponential backoff
//!   (base 2 seconds, ±20 % jitter) up to the attempt cap;
//! - 429 sleeps the server-provided `Retry-After` before the next attempt
//!   and feeds the [`ThrottleGovernor`];
//! - a 401 triggers exactly one token refresh; a second consecutive 401
//!   surfaces as [`RemoteError::AuthExpired`];
//! - other 4xx are final and carry the Graph error code and message.

use std::sync::Arc;
use std::time::Duration;

use futures_util::TryStreamExt;
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::json;
use tracing::{debug, info, warn};

use onesync_core::domain::item::RemoteItem;
use onesync_core::domain::newtypes::{DeltaLink, DriveId, ItemId};
use onesync_core::ports::remote_drive::{
    ByteStream, ChunkOutcome, DeltaPage, DriveInfo, RemoteDrive, RemoteError, UploadSession,
};

use crate::auth::AuthManager;
use crate::throttle::ThrottleGovernor;
use crate::{delta, upload, wire};

/// Base URL for Microsoft Graph API v1.0
const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Fallback when a 429 lacks a Retry-After header
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Attempt cap for retryable failures
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Base unit of the exponential backoff
const BACKOFF_BASE: Duration = Duration::from_secs(1);

// ============================================================================
// TokenSource
// ============================================================================

/// Supplier of bearer tokens to the client
///
/// Production uses [`AuthManager`]; tests inject a static token.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// The current bearer token
    async fn bearer_token(&self) -> Result<String, RemoteError>;

    /// Discard the cached token and obtain a fresh one (401 recovery)
    async fn force_refresh(&self) -> Result<String, RemoteError>;
}

#[async_trait::async_trait]
impl TokenSource for AuthManager {
    async fn bearer_token(&self) -> Result<String, RemoteError> {
        AuthManager::bearer_token(self).await
    }

    async fn force_refresh(&self) -> Result<String, RemoteError> {
        AuthManager::force_refresh(self).await
    }
}

/// Fixed token for tests and pre-authorized scenarios
pub struct StaticToken(pub String);

#[async_trait::async_trait]
impl TokenSource for StaticToken {
    async fn bearer_token(&self) -> Result<String, RemoteError> {
        Ok(self.0.clone())
    }

    async fn force_refresh(&self) -> Result<String, RemoteError> {
        // A static token cannot be refreshed; a 401 on it is fatal
        Err(RemoteError::AuthExpired)
    }
}

// ============================================================================
// GraphClient
// ============================================================================

/// HTTP client for the consumed Graph surface
pub struct GraphClient {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    governor: Arc<ThrottleGovernor>,
    max_attempts: u32,
}

impl GraphClient {
    /// Create a client over the production Graph endpoint
    ///
    /// `max_concurrency` sizes the connection pool at twice the transfer
    /// worker count.
    pub fn new(
        tokens: Arc<dyn TokenSource>,
        governor: Arc<ThrottleGovernor>,
        max_concurrency: usize,
    ) -> Self {
        let http = Client::builder()
            .pool_max_idle_per_host(2 * max_concurrency.max(1))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: GRAPH_BASE_URL.to_string(),
            tokens,
            governor,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Create a client against a custom base URL (tests)
    pub fn with_base_url(
        tokens: Arc<dyn TokenSource>,
        governor: Arc<ThrottleGovernor>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            tokens,
            governor,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the retry attempt cap (tests shrink it)
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// The base URL requests are built against
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The shared throttle governor
    pub fn governor(&self) -> &Arc<ThrottleGovernor> {
        &self.governor
    }

    /// The underlying HTTP client, for absolute-URL requests
    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Resolve a path against the base URL
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ========================================================================
    // Request execution with retry
    // ========================================================================

    /// Execute a request with the full retry policy
    ///
    /// `build` constructs a fresh request for each attempt; the bearer token
    /// is stamped here so a mid-flight refresh takes effect on the retry.
    pub(crate) async fn execute<F>(&self, what: &str, build: F) -> Result<Response, RemoteError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt: u32 = 0;
        let mut refreshed_after_401 = false;

        loop {
            let token = self.tokens.bearer_token().await?;
            let result = build(&self.http).bearer_auth(&token).send().await;

            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    let err = categorize_transport_error(&e);
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(what, attempts = attempt, error = %e, "Transport failure; retries exhausted");
                        return Err(err);
                    }
                    let delay = backoff_delay(attempt);
                    debug!(what, attempt, delay_ms = delay.as_millis() as u64, "Transport failure; backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();

            if status.is_success() {
                self.governor.record_success();
                if attempt > 0 {
                    info!(what, attempt, "Request succeeded after retry");
                }
                return Ok(response);
            }

            if status == StatusCode::UNAUTHORIZED {
                if refreshed_after_401 {
                    warn!(what, "Second consecutive 401; authorization expired");
                    return Err(RemoteError::AuthExpired);
                }
                refreshed_after_401 = true;
                debug!(what, "401 received; refreshing token once");
                self.tokens.force_refresh().await?;
                continue;
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                self.governor.record_throttle();
                let retry_after = parse_retry_after(&response).unwrap_or(DEFAULT_RETRY_AFTER);
                attempt += 1;
                if attempt >= self.max_attempts {
                    warn!(what, attempts = attempt, "429 retries exhausted");
                    return Err(RemoteError::RateLimited { retry_after });
                }
                info!(
                    what,
                    attempt,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "429 received; honoring Retry-After"
                );
                tokio::time::sleep(retry_after).await;
                continue;
            }

            if status.is_server_error() {
                self.governor.record_throttle();
                attempt += 1;
                if attempt >= self.max_attempts {
                    warn!(what, attempts = attempt, status = status.as_u16(), "5xx retries exhausted");
                    return Err(RemoteError::Server {
                        status: status.as_u16(),
                    });
                }
                let delay = backoff_delay(attempt);
                debug!(what, attempt, status = status.as_u16(), "5xx; backing off");
                tokio::time::sleep(delay).await;
                continue;
            }

            // Remaining 4xx are final
            let body = response.text().await.unwrap_or_default();
            let (code, message) = wire::parse_error_body(&body);
            debug!(what, status = status.as_u16(), code, "Client error");
            return Err(RemoteError::Client {
                status: status.as_u16(),
                code,
                message,
            });
        }
    }

    /// Execute and deserialize a JSON body
    pub(crate) async fn execute_json<T, F>(&self, what: &str, build: F) -> Result<T, RemoteError>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        self.execute(what, build)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Transient(format!("{what}: bad response body: {e}")))
    }
}

// ============================================================================
// RemoteDrive implementation
// ============================================================================

#[async_trait::async_trait]
impl RemoteDrive for GraphClient {
    async fn list_drives(&self) -> Result<Vec<DriveInfo>, RemoteError> {
        let url = self.url("/me/drives");
        let list: wire::WireDriveList = self
            .execute_json("list_drives", |http| http.get(&url))
            .await?;

        let mut drives = Vec::with_capacity(list.value.len());
        for drive in list.value {
            let id = DriveId::new(drive.id).map_err(|e| RemoteError::Client {
                status: 0,
                code: "malformedDrive".to_string(),
                message: e.to_string(),
            })?;
            drives.push(DriveInfo {
                id,
                drive_type: drive.drive_type.unwrap_or_else(|| "personal".to_string()),
                owner: drive.owner.and_then(|o| o.user).and_then(|u| u.display_name),
                quota_used: drive.quota.as_ref().and_then(|q| q.used),
                quota_total: drive.quota.as_ref().and_then(|q| q.total),
            });
        }
        debug!(count = drives.len(), "Enumerated drives");
        Ok(drives)
    }

    async fn delta_page_initial(
        &self,
        drive_id: &DriveId,
        link: Option<&DeltaLink>,
    ) -> Result<DeltaPage, RemoteError> {
        delta::fetch_initial(self, drive_id, link).await
    }

    async fn delta_page_next(&self, next_link: &str) -> Result<DeltaPage, RemoteError> {
        delta::fetch_next(self, next_link).await
    }

    async fn get_item(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
    ) -> Result<RemoteItem, RemoteError> {
        let url = self.url(&format!(
            "/drives/{}/items/{}",
            drive_id.as_str(),
            item_id.as_str()
        ));
        let item: wire::WireDriveItem = self
            .execute_json("get_item", |http| http.get(&url))
            .await?;
        wire::parse_drive_item(item, drive_id)
    }

    async fn list_children(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        // One page covers the spot-check use cases; follow @odata.nextLink
        // for folders larger than the server page size.
        let mut url = self.url(&format!(
            "/drives/{}/items/{}/children",
            drive_id.as_str(),
            item_id.as_str()
        ));
        let mut children = Vec::new();
        loop {
            let page: wire::WireChildrenPage = self
                .execute_json("list_children", |http| http.get(&url))
                .await?;
            for wire_item in page.value {
                children.push(wire::parse_drive_item(wire_item, drive_id)?);
            }
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(children)
    }

    async fn download(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
        offset: u64,
    ) -> Result<ByteStream, RemoteError> {
        let url = self.url(&format!(
            "/drives/{}/items/{}/content",
            drive_id.as_str(),
            item_id.as_str()
        ));

        let response = self
            .execute("download", |http| {
                let builder = http.get(&url);
                if offset > 0 {
                    builder.header("Range", format!("bytes={offset}-"))
                } else {
                    builder
                }
            })
            .await?;

        debug!(
            item = item_id.as_str(),
            offset,
            length = response.content_length().unwrap_or(0),
            "Download stream opened"
        );

        let stream = response
            .bytes_stream()
            .map_err(|e| RemoteError::Network(format!("download stream: {e}")));
        Ok(Box::pin(stream))
    }

    async fn upload_small(
        &self,
        drive_id: &DriveId,
        parent_id: &ItemId,
        name: &str,
        data: Vec<u8>,
        if_match: Option<&str>,
    ) -> Result<RemoteItem, RemoteError> {
        upload::upload_small(self, drive_id, parent_id, name, data, if_match).await
    }

    async fn create_upload_session(
        &self,
        drive_id: &DriveId,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<UploadSession, RemoteError> {
        upload::create_session(self, drive_id, parent_id, name).await
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        chunk: Vec<u8>,
        range: (u64, u64),
        total: u64,
    ) -> Result<ChunkOutcome, RemoteError> {
        upload::upload_chunk(self, session, chunk, range, total).await
    }

    async fn upload_session_status(
        &self,
        session: &UploadSession,
    ) -> Result<u64, RemoteError> {
        upload::session_status(self, session).await
    }

    async fn create_folder(
        &self,
        drive_id: &DriveId,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<RemoteItem, RemoteError> {
        let url = self.url(&format!(
            "/drives/{}/items/{}/children",
            drive_id.as_str(),
            parent_id.as_str()
        ));
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });

        let item: wire::WireDriveItem = self
            .execute_json("create_folder", |http| http.post(&url).json(&body))
            .await?;
        info!(name, parent = parent_id.as_str(), "Created remote folder");
        wire::parse_drive_item(item, drive_id)
    }

    async fn rename_item(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
        new_parent_id: Option<&ItemId>,
        new_name: Option<&str>,
    ) -> Result<RemoteItem, RemoteError> {
        let url = self.url(&format!(
            "/drives/{}/items/{}",
            drive_id.as_str(),
            item_id.as_str()
        ));

        let mut body = serde_json::Map::new();
        if let Some(name) = new_name {
            body.insert("name".to_string(), json!(name));
        }
        if let Some(parent) = new_parent_id {
            body.insert("parentReference".to_string(), json!({ "id": parent.as_str() }));
        }
        let body = serde_json::Value::Object(body);

        let item: wire::WireDriveItem = self
            .execute_json("rename_item", |http| http.patch(&url).json(&body))
            .await?;
        wire::parse_drive_item(item, drive_id)
    }

    async fn delete_item(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
    ) -> Result<(), RemoteError> {
        let url = self.url(&format!(
            "/drives/{}/items/{}",
            drive_id.as_str(),
            item_id.as_str()
        ));
        self.execute("delete_item", |http| http.delete(&url)).await?;
        info!(item = item_id.as_str(), "Deleted remote item");
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Classify a reqwest transport error
fn categorize_transport_error(e: &reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Transient(format!("timeout: {e}"))
    } else {
        RemoteError::Network(e.to_string())
    }
}

/// Parse the Retry-After header (delta-seconds form)
fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Exponential backoff with ±20 % jitter: base 2^attempt seconds
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    let base_ms = BACKOFF_BASE.as_millis() as u64 * (1u64 << exp);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base_ms as f64 * jitter) as u64)
}
