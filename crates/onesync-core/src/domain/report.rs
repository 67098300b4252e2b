//! Aggregate summary of a synchronization run
//!
//! Per-item failures never abort a run; they are accumulated here and the
//! coordinator logs the totals at the end.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One captured per-item failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Local or remote path of the item, whichever identifies it best
    pub path: String,
    /// Short category tag (e.g. "filesystem", "integrity", "transfer")
    pub category: String,
    /// Human-readable message
    pub message: String,
}

/// Summary of a completed (or aborted) synchronization run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Files downloaded from the remote
    pub downloaded: u64,
    /// Files uploaded to the remote
    pub uploaded: u64,
    /// Local directories created
    pub folders_created: u64,
    /// Items deleted locally in response to remote tombstones
    pub deleted_local: u64,
    /// Items deleted remotely in response to local removals
    pub deleted_remote: u64,
    /// Local renames applied without transferring bytes
    pub renamed: u64,
    /// Safe-backup copies made before a destructive operation
    pub backed_up: u64,
    /// Items excluded by the client-side filter
    pub filtered: u64,
    /// Items skipped after exhausting retries
    pub skipped: u64,
    /// Per-item failures captured during the run
    pub failures: Vec<ItemFailure>,
    /// Wall-clock duration of the run in milliseconds
    pub duration_ms: u64,
}

impl SyncReport {
    /// Record a per-item failure
    pub fn record_failure(
        &mut self,
        path: impl Into<String>,
        category: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.failures.push(ItemFailure {
            path: path.into(),
            category: category.into(),
            message: message.into(),
        });
    }

    /// Returns true if nothing went wrong
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total number of items that changed on either side
    pub fn total_changes(&self) -> u64 {
        self.downloaded
            + self.uploaded
            + self.folders_created
            + self.deleted_local
            + self.deleted_remote
            + self.renamed
    }

    /// Fold another report (e.g. from a second drive) into this one
    pub fn absorb(&mut self, other: SyncReport) {
        self.downloaded += other.downloaded;
        self.uploaded += other.uploaded;
        self.folders_created += other.folders_created;
        self.deleted_local += other.deleted_local;
        self.deleted_remote += other.deleted_remote;
        self.renamed += other.renamed;
        self.backed_up += other.backed_up;
        self.filtered += other.filtered;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
        self.duration_ms += other.duration_ms;
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} down, {} up, {} folders, {} renamed, {} deleted locally, \
             {} deleted remotely, {} backed up, {} filtered, {} skipped, \
             {} failures in {} ms",
            self.downloaded,
            self.uploaded,
            self.folders_created,
            self.renamed,
            self.deleted_local,
            self.deleted_remote,
            self.backed_up,
            self.filtered,
            self.skipped,
            self.failures.len(),
            self.duration_ms
        )
    }
}
