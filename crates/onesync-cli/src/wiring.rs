//! Adapter wiring shared by the commands
//!
//! Builds the component graph the engine expects: auth manager, Graph
//! client with the throttle governor, SQLite store, state files, and the
//! coordinator. No engine logic lives here.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use onesync_core::config::EngineConfig;
use onesync_engine::SyncCoordinator;
use onesync_graph::{AuthManager, GraphClient, OAuth2Config, ThrottleGovernor};
use onesync_store::{DatabasePool, SqliteItemStore, StateFiles};

/// Configuration plus the lazily-built adapters
pub struct CliContext {
    pub config: EngineConfig,
    app_id: Option<String>,
}

impl CliContext {
    /// Load configuration and remember the app id for auth flows
    pub fn new(config_path: Option<&str>, app_id: Option<String>) -> Result<Self> {
        let config = match config_path {
            Some(path) => EngineConfig::load(Path::new(path))
                .map_err(|e| anyhow::anyhow!(e.to_string()))?,
            None => EngineConfig::load_or_default(&EngineConfig::default_path()),
        };
        Ok(Self { config, app_id })
    }

    /// A copy of this context with per-invocation flag overrides applied
    pub fn with_config(&self, config: EngineConfig) -> Self {
        Self {
            config,
            app_id: self.app_id.clone(),
        }
    }

    /// The OAuth manager over the persisted refresh token
    pub fn auth_manager(&self) -> Result<Arc<AuthManager>> {
        let app_id = self
            .app_id
            .clone()
            .context("an application id is required; pass --app-id or set ONESYNC_APP_ID")?;
        let token_path = self.config.state_layout().refresh_token_path();
        Ok(Arc::new(AuthManager::new(
            OAuth2Config::new(app_id),
            token_path,
        )?))
    }

    /// The full coordinator: Graph client, store, governor, state files
    pub async fn coordinator(&self) -> Result<(SyncCoordinator, Arc<ThrottleGovernor>)> {
        let auth = self.auth_manager()?;
        let governor = Arc::new(ThrottleGovernor::new(self.config.max_concurrency));
        let client = Arc::new(GraphClient::new(
            auth,
            governor.clone(),
            self.config.max_concurrency,
        ));

        let layout = self.config.state_layout();
        let db = DatabasePool::open(&layout.database_path())
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let store = Arc::new(SqliteItemStore::new(&db));
        let state_files = StateFiles::new(layout);

        let coordinator = SyncCoordinator::new(
            client,
            store,
            state_files,
            governor.clone(),
            self.config.clone(),
        )
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        Ok((coordinator, governor))
    }

    /// A bare Graph client for metadata-only commands
    pub fn graph_client(&self) -> Result<Arc<GraphClient>> {
        let auth = self.auth_manager()?;
        let governor = Arc::new(ThrottleGovernor::new(self.config.max_concurrency));
        Ok(Arc::new(GraphClient::new(
            auth,
            governor,
            self.config.max_concurrency,
        )))
    }
}
