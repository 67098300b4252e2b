//! Microsoft Graph adapter for onesync
//!
//! Everything that talks HTTP lives here:
//!
//! - [`auth`] — OAuth2 PKCE login, refresh-token persistence, proactive
//!   token refresh with a safety margin
//! - [`client`] — the typed Graph client implementing the engine's
//!   [`RemoteDrive`](onesync_core::ports::RemoteDrive) port, including the
//!   retry policy and error categorization
//! - [`delta`] — page-at-a-time change-feed access
//! - [`upload`] — simple and resumable uploads
//! - [`throttle`] — the adaptive governor consulted by every Graph call
//! - [`wire`] — serde mappings of the Graph JSON surface

pub mod auth;
pub mod client;
pub mod delta;
pub mod throttle;
pub mod upload;
pub mod wire;

pub use auth::{AuthManager, OAuth2Config, TokenFile, Tokens};
pub use client::GraphClient;
pub use throttle::ThrottleGovernor;
