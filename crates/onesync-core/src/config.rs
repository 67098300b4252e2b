//! Engine configuration
//!
//! [`EngineConfig`] is the typed option struct handed to the engine by the
//! outer CLI/config loader. It carries the sync root, the client-side filter
//! inputs, the transfer tuning knobs, and the run-mode switches. The YAML
//! file format mirrors the struct directly.
//!
//! [`StateLayout`] maps the persistent-state files under the config
//! directory: the refresh token, the item database, per-drive delta links,
//! and per-item upload resume markers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::errors::EngineError;
use crate::domain::newtypes::{DriveId, ItemId};

/// Small-upload cutoff: files at or below this size go up in one PUT
pub const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;

/// Upload session chunk size: 10 MiB, a multiple of the required 320 KiB
pub const UPLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Required alignment for upload session chunks
pub const UPLOAD_CHUNK_ALIGNMENT: u64 = 320 * 1024;

/// Typed options consumed by the engine
///
/// Field names match the configuration file one to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local directory the engine owns and mirrors
    pub sync_dir: PathBuf,
    /// Directory for persistent state (token, database, delta links)
    pub config_dir: PathBuf,
    /// Drive ids to mirror; empty means the account's first drive
    pub drives: Vec<String>,
    /// Glob patterns for files to skip
    pub skip_file: Vec<String>,
    /// Glob patterns for directories to skip
    pub skip_dir: Vec<String>,
    /// Ordered `+pattern` / `-pattern` selection rules
    pub sync_list: Vec<String>,
    /// Skip anything whose basename starts with `.`
    pub skip_dotfiles: bool,
    /// Skip symlinks entirely (otherwise valid relative links are followed)
    pub skip_symlinks: bool,
    /// Honor `.nosync` marker files in directories
    pub check_nosync: bool,
    /// Skip files larger than this many bytes
    pub skip_size: Option<u64>,
    /// Evaluate skip globs case-insensitively
    pub case_insensitive_globs: bool,
    /// Never upload or delete remotely; the remote is read-only
    pub download_only: bool,
    /// Never download or delete locally; the local tree is read-only
    pub upload_only: bool,
    /// Compute and log intents without executing any transfer
    pub dry_run: bool,
    /// Discard the stored delta links and reingest the full remote state
    pub resync: bool,
    /// Allow destructive overwrites without safe-backup copies
    pub bypass_data_protection: bool,
    /// Transfer worker count
    pub max_concurrency: usize,
    /// Optional transfer bandwidth cap in bytes per second
    pub rate_limit_bps: Option<u64>,
    /// Weighted fairness between the download and upload queues
    pub download_weight: u32,
    /// See `download_weight`
    pub upload_weight: u32,
    /// Retry cap for hard transfer errors
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("OneDrive"),
            config_dir: default_config_dir(),
            drives: Vec::new(),
            skip_file: vec![
                "~*".to_string(),
                ".~*".to_string(),
                "*.tmp".to_string(),
                "*.swp".to_string(),
                "*.partial".to_string(),
            ],
            skip_dir: Vec::new(),
            sync_list: Vec::new(),
            skip_dotfiles: false,
            skip_symlinks: false,
            check_nosync: false,
            skip_size: None,
            case_insensitive_globs: false,
            download_only: false,
            upload_only: false,
            dry_run: false,
            resync: false,
            bypass_data_protection: false,
            max_concurrency: 8,
            rate_limit_bps: None,
            download_weight: 3,
            upload_weight: 1,
            max_retries: 3,
        }
    }
}

/// Platform default for the state directory
///
/// Typically `$XDG_CONFIG_HOME/onesync` on Linux.
fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("onesync")
}

impl EngineConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns `ConfigInvalid` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            EngineError::ConfigInvalid(format!("cannot parse {}: {e}", path.display()))
        })
    }

    /// Try to load from `path`; fall back to defaults on any error
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file
    pub fn default_path() -> PathBuf {
        default_config_dir().join("config.yaml")
    }

    /// Validate the option combination and the sync root
    ///
    /// # Errors
    /// Returns the startup-fatal variants of [`EngineError`].
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.download_only && self.upload_only {
            return Err(EngineError::ConfigInvalid(
                "download_only and upload_only are mutually exclusive".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(EngineError::ConfigInvalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.download_weight == 0 && self.upload_weight == 0 {
            return Err(EngineError::ConfigInvalid(
                "at least one transfer queue weight must be non-zero".to_string(),
            ));
        }
        for rule in &self.sync_list {
            if !rule.starts_with('+') && !rule.starts_with('-') {
                return Err(EngineError::ConfigInvalid(format!(
                    "sync_list rule must start with '+' or '-': {rule}"
                )));
            }
        }
        if !self.sync_dir.is_dir() {
            return Err(EngineError::SyncRootMissing(self.sync_dir.clone()));
        }
        Ok(())
    }

    /// The persistent-state layout under the configured state directory
    #[must_use]
    pub fn state_layout(&self) -> StateLayout {
        StateLayout {
            config_dir: self.config_dir.clone(),
        }
    }
}

// ============================================================================
// StateLayout
// ============================================================================

/// Paths of the persistent-state files under the config directory
#[derive(Debug, Clone)]
pub struct StateLayout {
    config_dir: PathBuf,
}

impl StateLayout {
    /// Create a layout rooted at `config_dir`
    #[must_use]
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    /// The state directory itself
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// The OAuth refresh token file (created mode 0600)
    #[must_use]
    pub fn refresh_token_path(&self) -> PathBuf {
        self.config_dir.join("refresh_token")
    }

    /// The item database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.config_dir.join("items.db")
    }

    /// The persisted delta link for one drive
    #[must_use]
    pub fn delta_link_path(&self, drive_id: &DriveId) -> PathBuf {
        self.config_dir
            .join(format!("delta_link_{}", sanitize(drive_id.as_str())))
    }

    /// The resume marker for an interrupted upload session
    #[must_use]
    pub fn resume_upload_path(&self, item_id: &ItemId) -> PathBuf {
        self.config_dir
            .join(format!("resume_upload_{}", sanitize(item_id.as_str())))
    }
}

/// Drive and item ids may contain `!` and `%`; keep file names tame
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
