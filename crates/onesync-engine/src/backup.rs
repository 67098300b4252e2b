//! Safe-backup naming and renames
//!
//! Before any destructive operation on a file whose content diverges from
//! what the cache expects, the local copy is renamed aside using the suffix
//! `-<hostname>-safe-backup-<UTC timestamp>`. Backups stay inside the sync
//! root and are later picked up by the scanner as new items, so divergent
//! bytes are never lost.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::info;

use onesync_core::domain::errors::EngineError;

/// The marker between the original name and the timestamp
const BACKUP_TAG: &str = "safe-backup";

/// This machine's hostname, sanitized for use inside a file name
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Build the backup name for `name`
///
/// `report.pdf` becomes `report.pdf-myhost-safe-backup-20260301-081500`.
/// The suffix goes after the full name (extension included) so the original
/// name is recoverable by stripping the suffix.
pub fn safe_backup_name(name: &str, host: &str, when: DateTime<Utc>) -> String {
    format!(
        "{name}-{host}-{BACKUP_TAG}-{}",
        when.format("%Y%m%d-%H%M%S")
    )
}

/// Rename `path` aside to its safe-backup name, returning the backup path
///
/// On a (same-second) collision a numeric suffix disambiguates.
pub fn safe_backup_rename(path: &Path) -> Result<PathBuf, EngineError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!(
                "cannot back up a path without a file name: {}",
                path.display()
            ))
        })?;
    let parent = path.parent().unwrap_or_else(|| Path::new("/"));

    let base = safe_backup_name(name, &local_hostname(), Utc::now());
    let mut candidate = parent.join(&base);
    let mut counter = 1;
    while candidate.exists() {
        counter += 1;
        candidate = parent.join(format!("{base}-{counter}"));
    }

    std::fs::rename(path, &candidate).map_err(|e| {
        EngineError::Other(anyhow::anyhow!(
            "failed to back up {}: {e}",
            path.display()
        ))
    })?;

    info!(
        original = %path.display(),
        backup = %candidate.display(),
        "Renamed diverging local copy to safe backup"
    );
    Ok(candidate)
}
