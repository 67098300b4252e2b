//! OAuth2 token lifecycle for the Microsoft identity platform
//!
//! Implements the Authorization Code flow with PKCE (RFC 7636) for native
//! applications, plus the ongoing token lifecycle every Graph call depends
//! on:
//!
//! - [`OAuth2Config`] — endpoints, app id, scopes
//! - [`TokenFile`] — refresh-token persistence in a mode-0600 file
//! - [`PkceFlow`] — challenge generation, code exchange, refresh
//! - [`LoopbackServer`] — one-shot HTTP listener for the redirect
//! - [`AuthManager`] — the engine-facing surface: `bearer_token()` with
//!   proactive refresh and `force_refresh()` for 401 recovery

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, CsrfToken, EndpointNotSet,
    EndpointSet, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, Scope,
    TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use onesync_core::ports::remote_drive::RemoteError;

/// Microsoft OAuth2 authorization endpoint (common tenant)
const AUTH_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";

/// Microsoft OAuth2 token endpoint (common tenant)
const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Default redirect URI for the loopback listener
const REDIRECT_URI: &str = "http://127.0.0.1:8400/callback";

/// Scopes required for full read/write sync with offline refresh
const DEFAULT_SCOPES: &[&str] = &["Files.ReadWrite.All", "offline_access"];

/// Refresh this long before actual expiry
const EXPIRY_MARGIN_SECS: i64 = 120;

// ============================================================================
// OAuth2Config
// ============================================================================

/// Configuration for the OAuth2 PKCE flow
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    /// Application (client) ID from the Azure AD app registration
    pub app_id: String,
    /// Redirect URI for receiving the authorization code
    pub redirect_uri: String,
    /// OAuth scopes to request
    pub scopes: Vec<String>,
}

impl OAuth2Config {
    /// Create a config with the default redirect and scopes
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            redirect_uri: REDIRECT_URI.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Override the redirect URI
    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uri = uri.into();
        self
    }
}

// ============================================================================
// Tokens
// ============================================================================

/// An access/refresh token pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    /// Bearer token stamped on every request
    pub access_token: String,
    /// Refresh credential (requires the `offline_access` scope)
    pub refresh_token: Option<String>,
    /// Access token expiry
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Returns true when the access token is inside the refresh margin
    pub fn needs_refresh(&self) -> bool {
        Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

// ============================================================================
// TokenFile
// ============================================================================

/// Persists the refresh token in a protected file
///
/// The file is created with mode 0600; only the refresh token is stored,
/// never the short-lived access token.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    /// Create a token file handle at `path`
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store the refresh token, creating the file with mode 0600
    pub fn store(&self, refresh_token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;

            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)
                .with_context(|| format!("Failed to open {}", self.path.display()))?;
            file.write_all(refresh_token.as_bytes())
                .context("Failed to write refresh token")?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&self.path, refresh_token)
                .with_context(|| format!("Failed to write {}", self.path.display()))?;
        }

        debug!(path = %self.path.display(), "Stored refresh token");
        Ok(())
    }

    /// Load the refresh token, if present
    pub fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(token) => {
                let token = token.trim().to_string();
                if token.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(token))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to read {}", self.path.display()))),
        }
    }

    /// Remove the stored refresh token
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Cleared refresh token");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to remove {}", self.path.display()))),
        }
    }
}

// ============================================================================
// PkceFlow
// ============================================================================

/// PKCE challenge/exchange logic over the `oauth2` crate
pub struct PkceFlow {
    client: BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>,
    scopes: Vec<String>,
}

impl PkceFlow {
    /// Build a flow from the configuration
    pub fn new(config: &OAuth2Config) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(config.app_id.clone()))
            .set_auth_uri(AuthUrl::new(AUTH_URL.to_string()).context("Invalid authorize URL")?)
            .set_token_uri(TokenUrl::new(TOKEN_URL.to_string()).context("Invalid token URL")?)
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_uri.clone()).context("Invalid redirect URI")?,
            );

        Ok(Self {
            client,
            scopes: config.scopes.clone(),
        })
    }

    /// Generate the authorization URL and its PKCE verifier
    ///
    /// The verifier must be retained until the code exchange.
    pub fn generate_auth_url(&self) -> (String, CsrfToken, PkceCodeVerifier) {
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request = self.client.authorize_url(CsrfToken::new_random);
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }

        let (url, csrf) = request.set_pkce_challenge(challenge).url();
        debug!("Generated authorization URL");
        (url.to_string(), csrf, verifier)
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(
        &self,
        code: String,
        verifier: PkceCodeVerifier,
    ) -> Result<Tokens> {
        info!("Exchanging authorization code for tokens");

        let http_client = reqwest::Client::new();
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(verifier)
            .request_async(&http_client)
            .await
            .context("Failed to exchange authorization code")?;

        Ok(Self::to_tokens(&response, None))
    }

    /// Refresh an access token
    ///
    /// # Errors
    /// Returns [`RemoteError::AuthExpired`] when the server rejects the
    /// refresh token as `invalid_grant` (revoked or expired); any other
    /// failure maps to [`RemoteError::Network`].
    pub async fn refresh(&self, refresh_token: &str) -> Result<Tokens, RemoteError> {
        debug!("Refreshing access token");

        let http_client = reqwest::Client::new();
        let result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&http_client)
            .await;

        match result {
            Ok(response) => Ok(Self::to_tokens(&response, Some(refresh_token))),
            Err(oauth2::RequestTokenError::ServerResponse(body)) => {
                let code = body.error().to_string();
                if code == "invalid_grant" {
                    warn!("Refresh token rejected as invalid_grant");
                    Err(RemoteError::AuthExpired)
                } else {
                    Err(RemoteError::Network(format!("token refresh failed: {code}")))
                }
            }
            Err(e) => Err(RemoteError::Network(format!("token refresh failed: {e}"))),
        }
    }

    fn to_tokens(
        response: &oauth2::basic::BasicTokenResponse,
        previous_refresh: Option<&str>,
    ) -> Tokens {
        let expires_at = response
            .expires_in()
            .map(|d| Utc::now() + Duration::seconds(d.as_secs() as i64))
            .unwrap_or_else(|| Utc::now() + Duration::hours(1));

        Tokens {
            access_token: response.access_token().secret().to_string(),
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().to_string())
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at,
        }
    }
}

// ============================================================================
// LoopbackServer
// ============================================================================

/// Parameters extracted from the redirect
#[derive(Debug)]
pub struct CallbackParams {
    /// The authorization code
    pub code: String,
    /// The CSRF state parameter
    pub state: String,
}

/// One-shot HTTP listener for the OAuth redirect
pub struct LoopbackServer;

impl LoopbackServer {
    /// Bind `127.0.0.1:8400`, wait for the redirect, return its parameters
    pub async fn wait_for_callback() -> Result<CallbackParams> {
        use http_body_util::Full;
        use hyper::body::Bytes;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper::{Request, Response, StatusCode};
        use hyper_util::rt::TokioIo;
        use tokio::net::TcpListener;
        use tokio::sync::oneshot;

        info!("Waiting for OAuth callback on 127.0.0.1:8400");

        let listener = TcpListener::bind("127.0.0.1:8400")
            .await
            .context("Failed to bind OAuth callback listener")?;

        let (tx, rx) = oneshot::channel::<CallbackParams>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let (stream, _addr) = listener
            .accept()
            .await
            .context("Failed to accept OAuth callback connection")?;

        let io = TokioIo::new(stream);
        let tx_clone = tx.clone();

        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let tx_inner = tx_clone.clone();
            async move {
                let uri = req.uri().to_string();
                debug!(%uri, "Callback listener received request");

                match parse_callback_params(&uri) {
                    Some(params) => {
                        if let Some(sender) = tx_inner.lock().await.take() {
                            let _ = sender.send(params);
                        }
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", "text/html; charset=utf-8")
                                .body(Full::new(Bytes::from(result_html(
                                    "Authentication complete",
                                    "You can close this window and return to onesync.",
                                ))))
                                .unwrap(),
                        )
                    }
                    None => Ok(Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .header("Content-Type", "text/html; charset=utf-8")
                        .body(Full::new(Bytes::from(result_html(
                            "Authentication failed",
                            "The redirect did not carry an authorization code.",
                        ))))
                        .unwrap()),
                }
            }
        });

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                warn!("OAuth callback connection error: {e}");
            }
        });

        let params = rx
            .await
            .context("Callback listener closed without receiving parameters")?;

        info!("Received OAuth callback");
        Ok(params)
    }
}

/// Extract `code` and `state` from a redirect URI or full URL
pub fn parse_callback_params(uri: &str) -> Option<CallbackParams> {
    let url = if uri.starts_with("http://") || uri.starts_with("https://") {
        url::Url::parse(uri).ok()?
    } else {
        url::Url::parse(&format!("http://localhost{uri}")).ok()?
    };

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.to_string()),
            "state" => state = Some(value.to_string()),
            _ => {}
        }
    }

    Some(CallbackParams {
        code: code?,
        state: state.unwrap_or_default(),
    })
}

fn result_html(title: &str, detail: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>onesync - {title}</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 50px;">
    <h1>{title}</h1>
    <p>{detail}</p>
</body>
</html>"#
    )
}

// ============================================================================
// AuthManager
// ============================================================================

/// The engine-facing token authority
///
/// Holds the current token pair behind a mutex, refreshing proactively when
/// the access token is inside the 120 s margin and on demand after a 401.
/// A refresh rejected as `invalid_grant` wipes the stored refresh token so
/// the next run forces reauthorization.
pub struct AuthManager {
    flow: PkceFlow,
    token_file: TokenFile,
    tokens: Mutex<Option<Tokens>>,
}

impl AuthManager {
    /// Create a manager from config and the refresh-token file path
    pub fn new(config: OAuth2Config, token_path: PathBuf) -> Result<Self> {
        Ok(Self {
            flow: PkceFlow::new(&config)?,
            token_file: TokenFile::new(token_path),
            tokens: Mutex::new(None),
        })
    }

    /// Returns true if a refresh token is on disk
    pub fn has_stored_credentials(&self) -> bool {
        matches!(self.token_file.load(), Ok(Some(_)))
    }

    /// Run the interactive login flow: browser, loopback listener, exchange
    ///
    /// Persists the refresh token on success.
    pub async fn login(&self) -> Result<()> {
        info!("Starting OAuth2 PKCE login");

        let (auth_url, _csrf, verifier) = self.flow.generate_auth_url();

        info!("Opening browser for sign-in");
        if webbrowser::open(&auth_url).is_err() {
            // Headless host: the operator visits the URL themselves
            info!("Could not open a browser; visit this URL to sign in: {auth_url}");
        }

        let callback = LoopbackServer::wait_for_callback().await?;
        let tokens = self.flow.exchange_code(callback.code, verifier).await?;
        self.install(tokens).await?;

        info!("Login complete");
        Ok(())
    }

    /// Complete login from an operator-pasted redirect URL
    ///
    /// Alternative to the loopback listener for machines where the browser
    /// runs elsewhere. The PKCE verifier must come from the same
    /// [`PkceFlow::generate_auth_url`] call that produced the URL the
    /// operator visited.
    pub async fn login_with_redirect(
        &self,
        redirect_url: &str,
        verifier: PkceCodeVerifier,
    ) -> Result<()> {
        let params = parse_callback_params(redirect_url)
            .context("Redirect URL does not contain an authorization code")?;
        let tokens = self.flow.exchange_code(params.code, verifier).await?;
        self.install(tokens).await?;
        Ok(())
    }

    /// Expose the flow for the paste-redirect login path
    pub fn flow(&self) -> &PkceFlow {
        &self.flow
    }

    /// Current bearer token, refreshing proactively inside the margin
    ///
    /// # Errors
    /// [`RemoteError::AuthExpired`] when no usable credentials exist.
    pub async fn bearer_token(&self) -> Result<String, RemoteError> {
        let mut guard = self.tokens.lock().await;

        if let Some(tokens) = guard.as_ref() {
            if !tokens.needs_refresh() {
                return Ok(tokens.access_token.clone());
            }
            debug!("Access token inside expiry margin; refreshing");
        }

        let refreshed = self.refresh_locked(&mut guard).await?;
        Ok(refreshed)
    }

    /// Drop the cached access token and refresh now
    ///
    /// Called by the client after a 401. A second consecutive failure
    /// surfaces as [`RemoteError::AuthExpired`].
    pub async fn force_refresh(&self) -> Result<String, RemoteError> {
        let mut guard = self.tokens.lock().await;
        if let Some(tokens) = guard.as_mut() {
            tokens.access_token.clear();
        }
        self.refresh_locked(&mut guard).await
    }

    /// The `Authorization` header value
    pub async fn authorization_header(&self) -> Result<String, RemoteError> {
        Ok(format!("Bearer {}", self.bearer_token().await?))
    }

    async fn refresh_locked(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, Option<Tokens>>,
    ) -> Result<String, RemoteError> {
        let refresh_token = match guard.as_ref().and_then(|t| t.refresh_token.clone()) {
            Some(t) => t,
            None => self
                .token_file
                .load()
                .map_err(|e| RemoteError::Transient(e.to_string()))?
                .ok_or(RemoteError::AuthExpired)?,
        };

        match self.flow.refresh(&refresh_token).await {
            Ok(tokens) => {
                let access = tokens.access_token.clone();
                if let Some(ref rt) = tokens.refresh_token {
                    if rt != &refresh_token {
                        // Rotated by the server; persist the replacement
                        if let Err(e) = self.token_file.store(rt) {
                            warn!("Failed to persist rotated refresh token: {e:#}");
                        }
                    }
                }
                **guard = Some(tokens);
                Ok(access)
            }
            Err(RemoteError::AuthExpired) => {
                // invalid_grant: the stored credential is dead
                if let Err(e) = self.token_file.clear() {
                    warn!("Failed to clear rejected refresh token: {e:#}");
                }
                **guard = None;
                Err(RemoteError::AuthExpired)
            }
            Err(e) => Err(e),
        }
    }

    async fn install(&self, tokens: Tokens) -> Result<()> {
        if let Some(ref rt) = tokens.refresh_token {
            self.token_file.store(rt)?;
        }
        *self.tokens.lock().await = Some(tokens);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OAuth2Config::new("app-123");
        assert_eq!(config.redirect_uri, REDIRECT_URI);
        assert!(config.scopes.contains(&"Files.ReadWrite.All".to_string()));
        assert!(config.scopes.contains(&"offline_access".to_string()));
    }

    #[test]
    fn test_tokens_refresh_margin() {
        let fresh = Tokens {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::hours(1),
        };
        assert!(!fresh.needs_refresh());

        let near_expiry = Tokens {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::seconds(60),
        };
        assert!(near_expiry.needs_refresh());

        let expired = Tokens {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: Utc::now() - Duration::seconds(1),
        };
        assert!(expired.needs_refresh());
    }

    #[test]
    fn test_token_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let file = TokenFile::new(tmp.path().join("refresh_token"));

        assert!(file.load().unwrap().is_none());

        file.store("secret-refresh-token").unwrap();
        assert_eq!(
            file.load().unwrap().as_deref(),
            Some("secret-refresh-token")
        );

        file.clear().unwrap();
        assert!(file.load().unwrap().is_none());
        // Clearing twice is fine
        file.clear().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_mode_0600() {
        use std::os::unix::fs::MetadataExt;

        let tmp = tempfile::tempdir().unwrap();
        let file = TokenFile::new(tmp.path().join("refresh_token"));
        file.store("tok").unwrap();

        let mode = std::fs::metadata(tmp.path().join("refresh_token"))
            .unwrap()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_pkce_flow_generates_url() {
        let config = OAuth2Config::new("app-123");
        let flow = PkceFlow::new(&config).unwrap();
        let (url, _csrf, _verifier) = flow.generate_auth_url();

        assert!(url.contains("login.microsoftonline.com"));
        assert!(url.contains("app-123"));
        assert!(url.contains("code_challenge"));
        assert!(url.contains("Files.ReadWrite.All"));
    }

    #[test]
    fn test_parse_callback_params_path_form() {
        let params = parse_callback_params("/callback?code=M.ABC123&state=xyz").unwrap();
        assert_eq!(params.code, "M.ABC123");
        assert_eq!(params.state, "xyz");
    }

    #[test]
    fn test_parse_callback_params_full_url() {
        let params =
            parse_callback_params("http://127.0.0.1:8400/callback?code=C0DE&state=s").unwrap();
        assert_eq!(params.code, "C0DE");
    }

    #[test]
    fn test_parse_callback_params_missing_code() {
        assert!(parse_callback_params("/callback?state=only").is_none());
    }

    #[test]
    fn test_result_html_mentions_title() {
        let html = result_html("Authentication complete", "detail text");
        assert!(html.contains("Authentication complete"));
        assert!(html.contains("detail text"));
    }
}
