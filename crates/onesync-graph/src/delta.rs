//! Page-at-a-time access to the change feed
//!
//! The delta processor applies and persists each page before fetching the
//! next, so unlike a collect-everything helper this module exposes single
//! pages; the engine follows `next_link` itself.
//!
//! A 410 Gone from any delta request means the presented token is no longer
//! valid; it surfaces as [`RemoteError::DeltaReset`] and the caller restarts
//! from an empty token (full reseed).
//!
//! See: <https://learn.microsoft.com/en-us/graph/api/driveitem-delta>

use tracing::{debug, warn};

use onesync_core::domain::newtypes::{DeltaLink, DriveId};
use onesync_core::ports::remote_drive::{DeltaPage, RemoteError};

use crate::client::GraphClient;
use crate::wire::{self, WireDeltaPage};

/// Fetch the first page of a delta query
///
/// With `link`, resumes the feed from that point (the link is an absolute
/// URL and is requested as-is). Without it, starts a full enumeration at
/// `/drives/{id}/root/delta`.
pub async fn fetch_initial(
    client: &GraphClient,
    drive_id: &DriveId,
    link: Option<&DeltaLink>,
) -> Result<DeltaPage, RemoteError> {
    let url = match link {
        Some(l) => l.as_str().to_string(),
        None => client.url(&format!("/drives/{}/root/delta", drive_id.as_str())),
    };

    debug!(
        drive = drive_id.as_str(),
        resuming = link.is_some(),
        "Fetching initial delta page"
    );
    fetch_page(client, drive_id, &url).await
}

/// Fetch a subsequent page at an absolute `@odata.nextLink` URL
pub async fn fetch_next(client: &GraphClient, next_link: &str) -> Result<DeltaPage, RemoteError> {
    // The drive id inside a nextLink is authoritative per item; the
    // fallback only fills tombstones, which always belong to the polled
    // drive. Extract it from the URL when possible.
    let drive_id = drive_id_from_url(next_link)
        .unwrap_or_else(|| DriveId::new("unknown".to_string()).expect("static id is valid"));
    fetch_page(client, &drive_id, next_link).await
}

async fn fetch_page(
    client: &GraphClient,
    drive_id: &DriveId,
    url: &str,
) -> Result<DeltaPage, RemoteError> {
    let result = client
        .execute_json::<WireDeltaPage, _>("delta_page", |http| http.get(url))
        .await;

    let raw = match result {
        Ok(page) => page,
        // 410 Gone: the token has expired server-side; reseed required
        Err(RemoteError::Client { status: 410, .. }) => return Err(RemoteError::DeltaReset),
        Err(e) => return Err(e),
    };

    let mut items = Vec::with_capacity(raw.value.len());
    for wire_item in raw.value {
        match wire::parse_drive_item(wire_item, drive_id) {
            Ok(item) => items.push(item),
            Err(e) => {
                // One malformed entry must not wedge the whole feed
                warn!(error = %e, "Skipping malformed delta item");
            }
        }
    }

    let delta_link = raw
        .delta_link
        .map(DeltaLink::new)
        .transpose()
        .map_err(|e| RemoteError::Transient(format!("bad deltaLink: {e}")))?;

    debug!(
        items = items.len(),
        has_next = raw.next_link.is_some(),
        is_final = delta_link.is_some(),
        "Delta page fetched"
    );

    Ok(DeltaPage {
        items,
        next_link: raw.next_link,
        delta_link,
    })
}

/// Extract the `/drives/{id}/` segment from a delta URL
fn drive_id_from_url(url: &str) -> Option<DriveId> {
    let parsed = url::Url::parse(url).ok()?;
    let mut segments = parsed.path_segments()?;
    while let Some(seg) = segments.next() {
        if seg == "drives" {
            return DriveId::new(segments.next()?.to_string()).ok();
        }
    }
    None
}
