//! Transfer scheduler: bounded workers draining the intent queues
//!
//! Two FIFO queues (downloads and uploads) are drained by a pool of workers
//! with weighted fairness between the queues. The adaptive budget from the
//! Graph throttle governor caps how many transfers run at once, on top of
//! the worker count itself.
//!
//! Scheduling invariants:
//! - exactly one in-flight transfer per `(drive, item)`; a second intent
//!   for the same key waits in its queue
//! - failed intents re-enter their queue with an attempt count and a
//!   backoff timestamp; rate-limited intents honor the server delay
//! - three hash mismatches on the same download surface as an integrity
//!   failure and the item is skipped
//! - cancellation is observed between chunks; partial temp files stay on
//!   disk for resume
//!
//! Downloads write `.<name>.<itemId>.partial` next to their target and
//! rename atomically after size and hash verification. Large uploads run
//! through resumable sessions whose progress is persisted as resume
//! markers, so an interrupted upload continues where the server says.

use std::collections::{HashSet, VecDeque};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onesync_core::config::{EngineConfig, SIMPLE_UPLOAD_LIMIT, UPLOAD_CHUNK_SIZE};
use onesync_core::domain::errors::EngineError;
use onesync_core::domain::item::{CachedItem, RemoteItem, SyncState};
use onesync_core::domain::newtypes::{DriveId, ItemId, SyncPath};
use onesync_core::domain::report::SyncReport;
use onesync_core::ports::item_store::ItemStore;
use onesync_core::ports::remote_drive::{
    ChunkOutcome, RemoteDrive, RemoteError, TransferBudget, UploadSession,
};
use onesync_store::{ResumeMarker, StateFiles};

use crate::backup::safe_backup_rename;
use crate::fsops;
use crate::intent::TransferIntent;

/// Hash mismatches tolerated per download before the item is skipped
const MAX_HASH_MISMATCHES: u32 = 3;

/// Attempt cap for rate-limited intents ("unlimited with cap")
const RATE_LIMITED_ATTEMPT_CAP: u32 = 30;

/// Idle poll interval while waiting for in-flight work or backoffs
const IDLE_WAIT: Duration = Duration::from_millis(50);

// ============================================================================
// Scheduler
// ============================================================================

/// Bounded-concurrency executor for transfer intents
pub struct TransferScheduler {
    shared: Arc<Shared>,
}

struct Shared {
    remote: Arc<dyn RemoteDrive>,
    store: Arc<dyn ItemStore>,
    state_files: StateFiles,
    budget: Arc<dyn TransferBudget>,
    config: EngineConfig,
    cancel: CancellationToken,
    queue: Mutex<QueueState>,
    notify: Notify,
    report: Mutex<SyncReport>,
    fatal: Mutex<Option<EngineError>>,
}

struct QueueState {
    downloads: VecDeque<Pending>,
    uploads: VecDeque<Pending>,
    in_flight: HashSet<String>,
    active: usize,
    download_credits: u32,
    upload_credits: u32,
}

#[derive(Debug)]
struct Pending {
    intent: TransferIntent,
    attempts: u32,
    hash_mismatches: u32,
    not_before: Option<Instant>,
}

impl Pending {
    fn new(intent: TransferIntent) -> Self {
        Self {
            intent,
            attempts: 0,
            hash_mismatches: 0,
            not_before: None,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.not_before.map(|t| t <= now).unwrap_or(true)
    }
}

enum Action {
    Execute(Pending),
    Wait(Duration),
    Done,
}

enum ExecOutcome {
    /// Finished; counters were updated by the executor
    Done,
    /// Transient failure; re-enqueue with backoff
    RetryBackoff(String),
    /// Rate limited; re-enqueue after the server delay
    RetryAfter(Duration),
    /// Download bytes did not verify; delete temp and retry
    HashMismatch,
    /// Replace this intent with another (conflict fallback)
    Switch(TransferIntent),
    /// Final per-item failure
    Fail {
        category: &'static str,
        message: String,
    },
    /// Cancellation observed mid-transfer
    Cancelled,
    /// Run-level failure; stop the whole drain
    Fatal(EngineError),
}

impl TransferScheduler {
    /// Create a scheduler over the shared adapters
    pub fn new(
        remote: Arc<dyn RemoteDrive>,
        store: Arc<dyn ItemStore>,
        state_files: StateFiles,
        budget: Arc<dyn TransferBudget>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (download_credits, upload_credits) = (config.download_weight, config.upload_weight);
        Self {
            shared: Arc::new(Shared {
                remote,
                store,
                state_files,
                budget,
                config,
                cancel,
                queue: Mutex::new(QueueState {
                    downloads: VecDeque::new(),
                    uploads: VecDeque::new(),
                    in_flight: HashSet::new(),
                    active: 0,
                    download_credits,
                    upload_credits,
                }),
                notify: Notify::new(),
                report: Mutex::new(SyncReport::default()),
                fatal: Mutex::new(None),
            }),
        }
    }

    /// Execute a batch of intents to completion and fold the results into
    /// `report`
    ///
    /// Returns `Cancelled` if the token fired, or the run-level error if a
    /// worker hit one (auth expiry). Per-item failures live in the report.
    pub async fn drain(
        &self,
        intents: Vec<TransferIntent>,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        if intents.is_empty() {
            return Ok(());
        }

        if self.shared.config.dry_run {
            for intent in &intents {
                info!(kind = intent.kind_str(), what = %intent.describe(), "dry-run: would transfer");
            }
            return Ok(());
        }

        {
            let mut queue = self.shared.queue.lock().unwrap();
            for intent in intents {
                let pending = Pending::new(intent);
                if pending.intent.is_download_side() {
                    queue.downloads.push_back(pending);
                } else {
                    queue.uploads.push_back(pending);
                }
            }
        }

        let worker_count = self.shared.config.max_concurrency.max(1);
        debug!(workers = worker_count, "Starting transfer drain");

        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let shared = self.shared.clone();
            handles.push(tokio::spawn(worker_loop(shared, id)));
        }
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(fatal) = self.shared.fatal.lock().unwrap().take() {
            return Err(fatal);
        }
        if self.shared.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let drained = std::mem::take(&mut *self.shared.report.lock().unwrap());
        report.absorb(drained);
        Ok(())
    }
}

// ============================================================================
// Worker loop and queue policy
// ============================================================================

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    loop {
        if shared.cancel.is_cancelled() || shared.fatal.lock().unwrap().is_some() {
            return;
        }

        match shared.next_action() {
            Action::Done => return,
            Action::Wait(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.notify.notified() => {}
                    _ = shared.cancel.cancelled() => return,
                }
            }
            Action::Execute(pending) => {
                debug!(
                    worker = worker_id,
                    kind = pending.intent.kind_str(),
                    what = %pending.intent.describe(),
                    attempt = pending.attempts,
                    "Executing transfer"
                );
                let outcome = execute(&shared, &pending).await;
                shared.complete(pending, outcome);
                shared.notify.notify_waiters();
            }
        }
    }
}

impl Shared {
    fn next_action(&self) -> Action {
        let now = Instant::now();
        let mut guard = self.queue.lock().unwrap();
        let queue = &mut *guard;

        if queue.downloads.is_empty() && queue.uploads.is_empty() {
            return if queue.active == 0 {
                Action::Done
            } else {
                Action::Wait(IDLE_WAIT)
            };
        }

        if queue.active >= self.budget.current_budget() {
            return Action::Wait(IDLE_WAIT);
        }

        // Weighted fairness: spend download credits, then upload credits,
        // refilling when both run out. An empty queue yields its turn.
        if queue.download_credits == 0 && queue.upload_credits == 0 {
            queue.download_credits = self.config.download_weight;
            queue.upload_credits = self.config.upload_weight;
        }
        let prefer_downloads = if queue.downloads.is_empty() {
            false
        } else if queue.uploads.is_empty() {
            true
        } else {
            queue.download_credits > 0
        };

        let mut picked = None;
        let order = if prefer_downloads {
            [true, false]
        } else {
            [false, true]
        };
        for from_downloads in order {
            if picked.is_some() {
                break;
            }
            if from_downloads {
                picked = pop_eligible(&mut queue.downloads, &queue.in_flight, now);
                if picked.is_some() {
                    queue.download_credits = queue.download_credits.saturating_sub(1);
                }
            } else {
                picked = pop_eligible(&mut queue.uploads, &queue.in_flight, now);
                if picked.is_some() {
                    queue.upload_credits = queue.upload_credits.saturating_sub(1);
                }
            }
        }

        match picked {
            Some(pending) => {
                queue.in_flight.insert(pending.intent.flight_key());
                queue.active += 1;
                Action::Execute(pending)
            }
            None => {
                // Everything queued is either parked for backoff or blocked
                // behind an in-flight twin
                let earliest = queue
                    .downloads
                    .iter()
                    .chain(queue.uploads.iter())
                    .filter_map(|p| p.not_before)
                    .min();
                let wait = earliest
                    .map(|t| t.saturating_duration_since(now))
                    .filter(|d| !d.is_zero())
                    .unwrap_or(IDLE_WAIT);
                Action::Wait(wait.min(Duration::from_secs(5)))
            }
        }
    }

    fn complete(&self, mut pending: Pending, outcome: ExecOutcome) {
        let mut queue = self.queue.lock().unwrap();
        queue.in_flight.remove(&pending.intent.flight_key());
        queue.active -= 1;

        match outcome {
            ExecOutcome::Done => {}
            ExecOutcome::Cancelled => {}
            ExecOutcome::Fatal(err) => {
                *self.fatal.lock().unwrap() = Some(err);
            }
            ExecOutcome::Switch(intent) => {
                let replacement = Pending::new(intent);
                if replacement.intent.is_download_side() {
                    queue.downloads.push_back(replacement);
                } else {
                    queue.uploads.push_back(replacement);
                }
            }
            ExecOutcome::RetryAfter(delay) => {
                pending.attempts += 1;
                if pending.attempts >= RATE_LIMITED_ATTEMPT_CAP {
                    self.record_skip(&pending, "rate-limit", "retry cap exhausted");
                } else {
                    pending.not_before = Some(Instant::now() + delay);
                    requeue(&mut queue, pending);
                }
            }
            ExecOutcome::RetryBackoff(message) => {
                pending.attempts += 1;
                if pending.attempts > self.config.max_retries {
                    self.record_skip(&pending, "transfer", &message);
                } else {
                    let delay = backoff_delay(pending.attempts);
                    pending.not_before = Some(Instant::now() + delay);
                    requeue(&mut queue, pending);
                }
            }
            ExecOutcome::HashMismatch => {
                pending.hash_mismatches += 1;
                if pending.hash_mismatches >= MAX_HASH_MISMATCHES {
                    self.record_skip(
                        &pending,
                        "integrity",
                        "hash verification failed after repeated attempts",
                    );
                } else {
                    requeue(&mut queue, pending);
                }
            }
            ExecOutcome::Fail { category, message } => {
                self.record_skip(&pending, category, &message);
            }
        }
    }

    fn record_skip(&self, pending: &Pending, category: &str, message: &str) {
        warn!(
            kind = pending.intent.kind_str(),
            what = %pending.intent.describe(),
            category,
            message,
            "Transfer skipped"
        );
        let mut report = self.report.lock().unwrap();
        report.skipped += 1;
        report.record_failure(pending.intent.describe(), category, message);
    }
}

fn requeue(queue: &mut QueueState, pending: Pending) {
    if pending.intent.is_download_side() {
        queue.downloads.push_back(pending);
    } else {
        queue.uploads.push_back(pending);
    }
}

/// Pop the first item that is past its backoff and not already in flight
fn pop_eligible(
    deque: &mut VecDeque<Pending>,
    in_flight: &HashSet<String>,
    now: Instant,
) -> Option<Pending> {
    let position = deque
        .iter()
        .position(|p| p.ready(now) && !in_flight.contains(&p.intent.flight_key()))?;
    deque.remove(position)
}

/// Scheduler-level backoff: base 2 seconds, capped at one minute
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs((1u64 << attempt.min(6)).min(60))
}

// ============================================================================
// Execution
// ============================================================================

async fn execute(shared: &Shared, pending: &Pending) -> ExecOutcome {
    let result = match &pending.intent {
        TransferIntent::Download { drive_id, item_id } => {
            exec_download(shared, drive_id, item_id).await
        }
        TransferIntent::Upload {
            drive_id,
            parent_id,
            name,
            local_path,
            existing,
        } => exec_upload(shared, drive_id, parent_id, name, local_path, existing).await,
        TransferIntent::ApplyTombstone { drive_id, item_id } => {
            exec_tombstone(shared, drive_id, item_id).await
        }
        TransferIntent::DeleteRemote { drive_id, item_id } => {
            exec_delete_remote(shared, drive_id, item_id).await
        }
    };

    match result {
        Ok(outcome) => outcome,
        Err(e) => classify_remote_error(e),
    }
}

/// Map a remote error to a scheduling outcome
fn classify_remote_error(e: RemoteError) -> ExecOutcome {
    match e {
        RemoteError::RateLimited { retry_after } => ExecOutcome::RetryAfter(retry_after),
        RemoteError::Transient(m) => ExecOutcome::RetryBackoff(m),
        RemoteError::Network(m) => ExecOutcome::RetryBackoff(m),
        RemoteError::Server { status } => ExecOutcome::RetryBackoff(format!("server error {status}")),
        RemoteError::AuthExpired => ExecOutcome::Fatal(EngineError::AuthExpired),
        e @ RemoteError::Client { .. } => ExecOutcome::Fail {
            category: "remote",
            message: e.to_string(),
        },
        RemoteError::DeltaReset => ExecOutcome::Fail {
            category: "remote",
            message: "unexpected delta reset during transfer".to_string(),
        },
    }
}

// ----------------------------------------------------------------------------
// Download
// ----------------------------------------------------------------------------

async fn exec_download(
    shared: &Shared,
    drive_id: &DriveId,
    item_id: &ItemId,
) -> Result<ExecOutcome, RemoteError> {
    let row = match lookup_row(shared, drive_id, item_id).await? {
        Some(row) => row,
        None => {
            return Ok(ExecOutcome::Fail {
                category: "internal",
                message: "download intent without a cached row".to_string(),
            })
        }
    };
    let Some(local_path) = row.local_path.clone() else {
        return Ok(ExecOutcome::Fail {
            category: "internal",
            message: "download intent without a local path".to_string(),
        });
    };

    let temp = fsops::partial_path(local_path.as_path(), item_id);
    let offset = std::fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
    if offset > 0 {
        debug!(path = %local_path, offset, "Resuming partial download");
    }

    let mut stream = shared.remote.download(drive_id, item_id, offset).await?;

    let mut file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&temp)
    {
        Ok(f) => f,
        Err(e) => {
            return Ok(ExecOutcome::Fail {
                category: "filesystem",
                message: format!("cannot open {}: {e}", temp.display()),
            })
        }
    };

    let mut pacer = Pacer::new(shared.config.rate_limit_bps);
    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = shared.cancel.cancelled() => {
                // Keep the partial file; the next run resumes it
                return Ok(ExecOutcome::Cancelled);
            }
        };
        let Some(chunk) = chunk else { break };
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                drop(file);
                return Err(e);
            }
        };
        if let Err(e) = file.write_all(&bytes) {
            return Ok(ExecOutcome::Fail {
                category: "filesystem",
                message: format!("cannot write {}: {e}", temp.display()),
            });
        }
        pacer.pace(bytes.len() as u64).await;
    }
    if let Err(e) = file.flush() {
        return Ok(ExecOutcome::Fail {
            category: "filesystem",
            message: format!("cannot flush {}: {e}", temp.display()),
        });
    }
    drop(file);

    // Verify size first: short means a truncated stream (resume), long
    // means a corrupt partial (start over)
    let written = std::fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
    if written < row.size {
        return Ok(ExecOutcome::RetryBackoff(format!(
            "short download: {written} of {} bytes",
            row.size
        )));
    }
    if written > row.size {
        let _ = std::fs::remove_file(&temp);
        return Ok(ExecOutcome::RetryBackoff(format!(
            "oversized partial: {written} of {} bytes",
            row.size
        )));
    }

    // Verify content against whichever hash the remote provided
    let (computed, _) = match fsops::hash_file(&temp) {
        Ok(h) => h,
        Err(e) => {
            return Ok(ExecOutcome::Fail {
                category: "filesystem",
                message: format!("cannot hash {}: {e}", temp.display()),
            })
        }
    };
    if computed.matches(&row.hashes) == Some(false) {
        warn!(path = %local_path, "Downloaded content failed hash verification");
        let _ = std::fs::remove_file(&temp);
        return Ok(ExecOutcome::HashMismatch);
    }

    // Atomically move into place and stamp the remote's mtime
    if let Err(e) = std::fs::rename(&temp, local_path.as_path()) {
        return Ok(ExecOutcome::Fail {
            category: "filesystem",
            message: format!("cannot move {} into place: {e}", temp.display()),
        });
    }
    if let Some(modified) = row.modified {
        let _ = fsops::set_mtime(local_path.as_path(), modified);
    }

    let mut updated = row;
    updated.hashes = updated.hashes.merged_with(&computed);
    updated.state = SyncState::Present;
    updated.last_seen = Some(chrono::Utc::now());
    if let Err(e) = shared.store.upsert(&updated).await {
        return Ok(ExecOutcome::Fail {
            category: "store",
            message: e.to_string(),
        });
    }

    info!(path = %local_path, "Downloaded");
    shared.report.lock().unwrap().downloaded += 1;
    Ok(ExecOutcome::Done)
}

// ----------------------------------------------------------------------------
// Upload
// ----------------------------------------------------------------------------

async fn exec_upload(
    shared: &Shared,
    drive_id: &DriveId,
    parent_id: &ItemId,
    name: &str,
    local_path: &SyncPath,
    existing: &Option<(ItemId, Option<String>)>,
) -> Result<ExecOutcome, RemoteError> {
    let metadata = match std::fs::metadata(local_path.as_path()) {
        Ok(m) => m,
        Err(e) => {
            return Ok(ExecOutcome::Fail {
                category: "filesystem",
                message: format!("upload source vanished: {e}"),
            })
        }
    };
    let size = metadata.len();
    let local_mtime = fsops::mtime_of(local_path.as_path()).ok();

    let (local_hashes, _) = match fsops::hash_file(local_path.as_path()) {
        Ok(h) => h,
        Err(e) => {
            return Ok(ExecOutcome::Fail {
                category: "filesystem",
                message: format!("cannot hash {local_path}: {e}"),
            })
        }
    };

    let uploaded = if size <= SIMPLE_UPLOAD_LIMIT {
        let data = match std::fs::read(local_path.as_path()) {
            Ok(d) => d,
            Err(e) => {
                return Ok(ExecOutcome::Fail {
                    category: "filesystem",
                    message: format!("cannot read {local_path}: {e}"),
                })
            }
        };
        let if_match = existing.as_ref().and_then(|(_, etag)| etag.as_deref());
        match shared
            .remote
            .upload_small(drive_id, parent_id, name, data, if_match)
            .await
        {
            Ok(item) => item,
            Err(e) if e.is_etag_conflict() => {
                return conflict_fallback(shared, drive_id, existing, local_path).await;
            }
            Err(e) => return Err(e),
        }
    } else {
        match exec_session_upload(shared, drive_id, parent_id, name, local_path, existing, size)
            .await?
        {
            SessionResult::Completed(item) => *item,
            SessionResult::Cancelled => return Ok(ExecOutcome::Cancelled),
            SessionResult::Conflict => {
                return conflict_fallback(shared, drive_id, existing, local_path).await;
            }
        }
    };

    // Round-trip verification: the server's hash must match what we sent
    if uploaded.hashes.matches(&local_hashes) == Some(false) {
        warn!(path = %local_path, "Uploaded item hash differs from local content");
        shared.report.lock().unwrap().record_failure(
            local_path.to_string(),
            "integrity",
            "remote hash differs after upload",
        );
    }

    let mut row = CachedItem::from_remote(&uploaded, Some(local_path.clone()));
    // Keep the on-disk mtime so the next scan's fast path holds
    row.modified = local_mtime.or(row.modified);
    row.hashes = row.hashes.merged_with(&local_hashes);
    row.state = SyncState::Present;
    row.last_seen = Some(chrono::Utc::now());
    if let Err(e) = shared.store.upsert(&row).await {
        return Ok(ExecOutcome::Fail {
            category: "store",
            message: e.to_string(),
        });
    }

    info!(path = %local_path, size, "Uploaded");
    shared.report.lock().unwrap().uploaded += 1;
    Ok(ExecOutcome::Done)
}

enum SessionResult {
    Completed(Box<RemoteItem>),
    Cancelled,
    Conflict,
}

/// Chunked upload with session resume
async fn exec_session_upload(
    shared: &Shared,
    drive_id: &DriveId,
    parent_id: &ItemId,
    name: &str,
    local_path: &SyncPath,
    existing: &Option<(ItemId, Option<String>)>,
    size: u64,
) -> Result<SessionResult, RemoteError> {
    // Resume markers are keyed by item id; brand-new files restart cleanly
    let marker_key = existing.as_ref().map(|(id, _)| id.clone());

    let mut session: Option<(UploadSession, u64)> = None;
    if let Some(ref key) = marker_key {
        if let Ok(Some(marker)) = shared.state_files.resume_marker(key) {
            if marker.total_size == size {
                let candidate = UploadSession {
                    upload_url: marker.upload_url.clone(),
                    expires: None,
                };
                // The server is authoritative about where to continue
                match shared.remote.upload_session_status(&candidate).await {
                    Ok(offset) => {
                        info!(path = %local_path, offset, "Resuming upload session");
                        session = Some((candidate, offset));
                    }
                    Err(_) => {
                        // Session expired server-side; start over
                        let _ = shared.state_files.clear_resume_marker(key);
                    }
                }
            } else {
                let _ = shared.state_files.clear_resume_marker(key);
            }
        }
    }

    let (session, mut offset) = match session {
        Some(pair) => pair,
        None => {
            let created = match shared
                .remote
                .create_upload_session(drive_id, parent_id, name)
                .await
            {
                Ok(s) => s,
                Err(e) if e.is_etag_conflict() => return Ok(SessionResult::Conflict),
                Err(e) => return Err(e),
            };
            (created, 0)
        }
    };

    let mut pacer = Pacer::new(shared.config.rate_limit_bps);
    while offset < size {
        if shared.cancel.is_cancelled() {
            // Progress is in the marker; the next run resumes
            return Ok(SessionResult::Cancelled);
        }

        let end = (offset + UPLOAD_CHUNK_SIZE - 1).min(size - 1);
        let chunk = match read_range(local_path.as_path(), offset, end) {
            Ok(c) => c,
            Err(e) => {
                return Err(RemoteError::Transient(format!(
                    "cannot read {local_path}: {e}"
                )))
            }
        };
        let chunk_len = chunk.len() as u64;

        let outcome = match shared
            .remote
            .upload_chunk(&session, chunk, (offset, end), size)
            .await
        {
            Ok(o) => o,
            Err(e) if e.is_etag_conflict() => return Ok(SessionResult::Conflict),
            Err(e) => return Err(e),
        };
        pacer.pace(chunk_len).await;

        match outcome {
            ChunkOutcome::More { next_offset } => {
                offset = next_offset;
                if let Some(ref key) = marker_key {
                    let _ = shared.state_files.save_resume_marker(
                        key,
                        &ResumeMarker {
                            upload_url: session.upload_url.clone(),
                            next_offset: offset,
                            total_size: size,
                        },
                    );
                }
            }
            ChunkOutcome::Done(item) => {
                if let Some(ref key) = marker_key {
                    let _ = shared.state_files.clear_resume_marker(key);
                }
                return Ok(SessionResult::Completed(item));
            }
        }
    }

    Err(RemoteError::Transient(
        "upload session ended without a completion response".to_string(),
    ))
}

/// Etag conflict during upload: the remote changed underneath us. Preserve
/// the local bytes, take the remote version, and let the next scan upload
/// the backup as a new item.
async fn conflict_fallback(
    shared: &Shared,
    drive_id: &DriveId,
    existing: &Option<(ItemId, Option<String>)>,
    local_path: &SyncPath,
) -> Result<ExecOutcome, RemoteError> {
    let Some((item_id, _)) = existing else {
        return Ok(ExecOutcome::Fail {
            category: "conflict",
            message: "name already exists remotely".to_string(),
        });
    };

    info!(path = %local_path, "Upload lost a concurrent-edit race; falling back to download");

    let remote_item = shared.remote.get_item(drive_id, item_id).await?;

    if !shared.config.bypass_data_protection && local_path.as_path().exists() {
        if let Err(e) = safe_backup_rename(local_path.as_path()) {
            return Ok(ExecOutcome::Fail {
                category: "filesystem",
                message: e.to_string(),
            });
        }
        shared.report.lock().unwrap().backed_up += 1;
    }

    let mut row = CachedItem::from_remote(&remote_item, Some(local_path.clone()));
    row.state = SyncState::PendingDownload;
    if let Err(e) = shared.store.upsert(&row).await {
        return Ok(ExecOutcome::Fail {
            category: "store",
            message: e.to_string(),
        });
    }

    Ok(ExecOutcome::Switch(TransferIntent::Download {
        drive_id: drive_id.clone(),
        item_id: item_id.clone(),
    }))
}

// ----------------------------------------------------------------------------
// Tombstones and remote deletes
// ----------------------------------------------------------------------------

async fn exec_tombstone(
    shared: &Shared,
    drive_id: &DriveId,
    item_id: &ItemId,
) -> Result<ExecOutcome, RemoteError> {
    let row = match lookup_row(shared, drive_id, item_id).await? {
        Some(row) => row,
        None => return Ok(ExecOutcome::Done),
    };
    let Some(path) = row.local_path.clone() else {
        let _ = shared.store.remove(drive_id, item_id).await;
        return Ok(ExecOutcome::Done);
    };

    if row.is_directory_like() {
        if path.as_path().is_dir() {
            let has_children = path
                .as_path()
                .read_dir()
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
            if has_children {
                // Children drain first; their tombstones are in the queue
                return Ok(ExecOutcome::RetryBackoff(
                    "directory not yet empty".to_string(),
                ));
            }
            if let Err(e) = std::fs::remove_dir(path.as_path()) {
                return Ok(ExecOutcome::Fail {
                    category: "filesystem",
                    message: format!("cannot remove {path}: {e}"),
                });
            }
        }
    } else if path.as_path().is_file() {
        let matches_cache = fsops::hash_file(path.as_path())
            .ok()
            .map(|(hashes, _)| hashes.matches(&row.hashes));
        match matches_cache {
            Some(Some(true)) | Some(None) => {
                if let Err(e) = std::fs::remove_file(path.as_path()) {
                    return Ok(ExecOutcome::Fail {
                        category: "filesystem",
                        message: format!("cannot remove {path}: {e}"),
                    });
                }
            }
            _ => {
                // The local copy diverged from what the remote deleted;
                // keep the bytes under a safe-backup name
                if let Err(e) = safe_backup_rename(path.as_path()) {
                    return Ok(ExecOutcome::Fail {
                        category: "filesystem",
                        message: e.to_string(),
                    });
                }
                shared.report.lock().unwrap().backed_up += 1;
            }
        }
    }

    if let Err(e) = shared.store.remove(drive_id, item_id).await {
        return Ok(ExecOutcome::Fail {
            category: "store",
            message: e.to_string(),
        });
    }
    info!(path = %path, "Applied remote deletion locally");
    shared.report.lock().unwrap().deleted_local += 1;
    Ok(ExecOutcome::Done)
}

async fn exec_delete_remote(
    shared: &Shared,
    drive_id: &DriveId,
    item_id: &ItemId,
) -> Result<ExecOutcome, RemoteError> {
    let row = match lookup_row(shared, drive_id, item_id).await? {
        Some(row) => row,
        None => return Ok(ExecOutcome::Done),
    };

    // Safe-delete check: never delete a remote file whose content moved on
    // since we cached it. The remote wins and comes back down instead.
    match shared.remote.get_item(drive_id, item_id).await {
        Ok(remote_item) => {
            if remote_item.hashes.matches(&row.hashes) == Some(false) {
                info!(
                    item = item_id.as_str(),
                    "Remote content changed since cache; restoring instead of deleting"
                );
                let mut restored = CachedItem::from_remote(&remote_item, row.local_path.clone());
                restored.state = SyncState::PendingDownload;
                if let Err(e) = shared.store.upsert(&restored).await {
                    return Ok(ExecOutcome::Fail {
                        category: "store",
                        message: e.to_string(),
                    });
                }
                return Ok(ExecOutcome::Switch(TransferIntent::Download {
                    drive_id: drive_id.clone(),
                    item_id: item_id.clone(),
                }));
            }
        }
        Err(e) if e.is_not_found() => {
            // Already gone remotely; just forget it
            let _ = shared.store.remove(drive_id, item_id).await;
            return Ok(ExecOutcome::Done);
        }
        Err(e) => return Err(e),
    }

    shared.remote.delete_item(drive_id, item_id).await?;

    // Forget the row and every cached descendant; the remote delete took
    // the whole subtree
    remove_subtree_rows(shared, drive_id, item_id).await;
    info!(item = item_id.as_str(), "Propagated local deletion to remote");
    shared.report.lock().unwrap().deleted_remote += 1;
    Ok(ExecOutcome::Done)
}

async fn remove_subtree_rows(shared: &Shared, drive_id: &DriveId, item_id: &ItemId) {
    let mut stack = vec![item_id.clone()];
    while let Some(current) = stack.pop() {
        if let Ok(children) = shared.store.children_of(drive_id, &current).await {
            for child in children {
                stack.push(child.item_id);
            }
        }
        let _ = shared.store.remove(drive_id, &current).await;
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

async fn lookup_row(
    shared: &Shared,
    drive_id: &DriveId,
    item_id: &ItemId,
) -> Result<Option<CachedItem>, RemoteError> {
    shared
        .store
        .get(drive_id, item_id)
        .await
        .map_err(|e| RemoteError::Transient(format!("store lookup failed: {e}")))
}

/// Read an inclusive byte range of a file
fn read_range(path: &std::path::Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let len = (end - start + 1) as usize;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Sleep-based bandwidth cap shared by downloads and upload chunks
struct Pacer {
    bps: Option<u64>,
    started: Instant,
    bytes: u64,
}

impl Pacer {
    fn new(bps: Option<u64>) -> Self {
        Self {
            bps,
            started: Instant::now(),
            bytes: 0,
        }
    }

    async fn pace(&mut self, just_transferred: u64) {
        let Some(bps) = self.bps else { return };
        if bps == 0 {
            return;
        }
        self.bytes += just_transferred;
        let expected = Duration::from_secs_f64(self.bytes as f64 / bps as f64);
        let elapsed = self.started.elapsed();
        if expected > elapsed {
            tokio::time::sleep(expected - elapsed).await;
        }
    }
}
