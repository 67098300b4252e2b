//! End-to-end engine tests
//!
//! Drives the full coordinator (delta → scan → drain → delta link) against
//! the in-memory fake remote and store. Covers the headline flows: fresh
//! sync, remote rename without transfer, conflict with data-protection
//! backup, filter exclusion, feed reseeds, upload round-trips, and
//! re-application idempotence.

use std::sync::Arc;

use onesync_core::config::{EngineConfig, StateLayout};
use onesync_core::domain::item::{ContentHashes, ItemKind, RemoteItem, SyncState};
use onesync_core::domain::newtypes::{DriveId, ItemId, SyncPath};
use onesync_core::hash::hash_all;
use onesync_core::ports::item_store::ItemStore;
use onesync_core::ports::remote_drive::{FixedBudget, RemoteError};
use onesync_engine::testutil::{FakeRemote, MemStore};
use onesync_engine::SyncCoordinator;
use onesync_store::StateFiles;

fn drive() -> DriveId {
    DriveId::new("d1".to_string()).unwrap()
}

fn root_item() -> RemoteItem {
    RemoteItem {
        drive_id: drive(),
        item_id: ItemId::new("root-1".to_string()).unwrap(),
        parent_id: None,
        name: "root".to_string(),
        kind: ItemKind::Root,
        size: None,
        etag: None,
        ctag: None,
        hashes: ContentHashes::none(),
        modified: None,
        is_deleted: false,
    }
}

fn folder(id: &str, parent: &str, name: &str) -> RemoteItem {
    RemoteItem {
        drive_id: drive(),
        item_id: ItemId::new(id.to_string()).unwrap(),
        parent_id: Some(ItemId::new(parent.to_string()).unwrap()),
        name: name.to_string(),
        kind: ItemKind::Folder,
        size: None,
        etag: Some(format!("\"{id}-e1\"")),
        ctag: None,
        hashes: ContentHashes::none(),
        modified: None,
        is_deleted: false,
    }
}

fn file(id: &str, parent: &str, name: &str, content: &[u8]) -> RemoteItem {
    RemoteItem {
        drive_id: drive(),
        item_id: ItemId::new(id.to_string()).unwrap(),
        parent_id: Some(ItemId::new(parent.to_string()).unwrap()),
        name: name.to_string(),
        kind: ItemKind::File,
        size: Some(content.len() as u64),
        etag: Some(format!("\"{id}-e1\"")),
        ctag: Some(format!("\"{id}-c1\"")),
        hashes: hash_all(content),
        modified: Some("2026-04-01T10:00:00Z".parse().unwrap()),
        is_deleted: false,
    }
}

fn tombstone(id: &str) -> RemoteItem {
    RemoteItem {
        drive_id: drive(),
        item_id: ItemId::new(id.to_string()).unwrap(),
        parent_id: None,
        name: String::new(),
        kind: ItemKind::File,
        size: None,
        etag: None,
        ctag: None,
        hashes: ContentHashes::none(),
        modified: None,
        is_deleted: true,
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    root: std::path::PathBuf,
    remote: Arc<FakeRemote>,
    store: Arc<MemStore>,
    state_files: StateFiles,
    config: EngineConfig,
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn harness_with(mutate: impl FnOnce(&mut EngineConfig)) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("sync");
    let state_dir = tmp.path().join("state");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::create_dir_all(&state_dir).unwrap();

    let mut config = EngineConfig {
        sync_dir: root.clone(),
        config_dir: state_dir.clone(),
        drives: vec!["d1".to_string()],
        skip_file: Vec::new(),
        ..Default::default()
    };
    mutate(&mut config);

    Harness {
        _tmp: tmp,
        root,
        remote: Arc::new(FakeRemote::new()),
        store: Arc::new(MemStore::new()),
        state_files: StateFiles::new(StateLayout::new(state_dir)),
        config,
    }
}

impl Harness {
    fn coordinator(&self) -> SyncCoordinator {
        SyncCoordinator::new(
            self.remote.clone(),
            self.store.clone(),
            self.state_files.clone(),
            Arc::new(FixedBudget(8)),
            self.config.clone(),
        )
        .unwrap()
    }
}

#[tokio::test]
async fn test_fresh_sync_materializes_remote_tree() {
    let fx = harness();

    // Remote: /A/b.txt with 10 bytes
    fx.remote.seed_file("F1", "A1", "b.txt", b"ten bytes!");
    fx.remote.set_delta_feed(
        vec![vec![
            root_item(),
            folder("A1", "root-1", "A"),
            file("F1", "A1", "b.txt", b"ten bytes!"),
        ]],
        "fake://delta/link/1",
    );

    let report = fx.coordinator().run().await.unwrap();

    // The file landed with the right bytes and the remote's mtime
    let path = fx.root.join("A/b.txt");
    assert_eq!(std::fs::read(&path).unwrap(), b"ten bytes!");
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.folders_created, 1);
    assert!(report.is_clean());

    let mtime = onesync_engine::fsops::mtime_of(&path).unwrap();
    assert_eq!(mtime.to_rfc3339(), "2026-04-01T10:00:00+00:00");

    // The database settled and the delta link is persisted
    let file_id = ItemId::new("F1".to_string()).unwrap();
    let row = fx.store.get(&drive(), &file_id).await.unwrap().unwrap();
    assert_eq!(row.state, SyncState::Present);
    assert_eq!(row.hashes.matches(&hash_all(b"ten bytes!")), Some(true));

    let link = fx.state_files.delta_link(&drive()).unwrap().unwrap();
    assert_eq!(link.as_str(), "fake://delta/link/1");
}

#[tokio::test]
async fn test_remote_rename_moves_in_place_without_bytes() {
    let fx = harness();

    fx.remote.seed_file("F1", "A1", "b.txt", b"contents");
    fx.remote.set_delta_feed(
        vec![vec![
            root_item(),
            folder("A1", "root-1", "A"),
            file("F1", "A1", "b.txt", b"contents"),
        ]],
        "fake://delta/link/1",
    );
    fx.coordinator().run().await.unwrap();
    let downloads_before = fx
        .remote
        .download_calls
        .load(std::sync::atomic::Ordering::SeqCst);

    // Second cycle: the same item id arrives as /A/c.txt
    let mut renamed = file("F1", "A1", "c.txt", b"contents");
    renamed.etag = Some("\"F1-e2\"".to_string());
    fx.remote
        .set_delta_feed(vec![vec![renamed]], "fake://delta/link/2");

    let report = fx.coordinator().run().await.unwrap();

    assert_eq!(report.renamed, 1);
    assert_eq!(report.downloaded, 0);
    assert!(!fx.root.join("A/b.txt").exists());
    assert_eq!(std::fs::read(fx.root.join("A/c.txt")).unwrap(), b"contents");
    // No extra bytes were transferred
    assert_eq!(
        fx.remote
            .download_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        downloads_before
    );
}

#[tokio::test]
async fn test_conflict_backs_up_local_and_uploads_backup() {
    let fx = harness();

    // Cycle 1: remote and local agree
    fx.remote.seed_file("F1", "A1", "b.txt", b"common ancestor");
    fx.remote.set_delta_feed(
        vec![vec![
            root_item(),
            folder("A1", "root-1", "A"),
            file("F1", "A1", "b.txt", b"common ancestor"),
        ]],
        "fake://delta/link/1",
    );
    fx.coordinator().run().await.unwrap();

    // Both sides change independently
    std::fs::write(fx.root.join("A/b.txt"), b"local change").unwrap();
    fx.remote.mutate_file("F1", b"remote change");
    let mut updated = file("F1", "A1", "b.txt", b"remote change");
    updated.etag = Some("\"F1-v2\"".to_string());
    fx.remote
        .set_delta_feed(vec![vec![updated]], "fake://delta/link/2");

    let report = fx.coordinator().run().await.unwrap();

    // The remote version won the name; the local change survived as a
    // backup which was itself uploaded as a new item
    assert_eq!(report.backed_up, 1);
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(
        std::fs::read(fx.root.join("A/b.txt")).unwrap(),
        b"remote change"
    );

    let backups: Vec<_> = std::fs::read_dir(fx.root.join("A"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("safe-backup"))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(std::fs::read(backups[0].path()).unwrap(), b"local change");

    let backup_name = backups[0].file_name().to_string_lossy().into_owned();
    let (_, remote_backup) = fx.remote.find_by_name(&backup_name).unwrap();
    assert_eq!(remote_backup.content.unwrap(), b"local change");
}

#[tokio::test]
async fn test_filter_exclusion_scenario() {
    let fx = harness_with(|c| {
        c.sync_list = vec!["+/A/".to_string(), "-*".to_string()];
    });

    fx.remote.seed_file("FA", "A1", "x", b"inside");
    fx.remote.seed_file("FB", "B1", "y", b"outside");
    fx.remote.set_delta_feed(
        vec![vec![
            root_item(),
            folder("A1", "root-1", "A"),
            folder("B1", "root-1", "B"),
            file("FA", "A1", "x", b"inside"),
            file("FB", "B1", "y", b"outside"),
        ]],
        "fake://delta/link/1",
    );

    fx.coordinator().run().await.unwrap();

    assert!(fx.root.join("A/x").exists());
    assert!(!fx.root.join("B").exists());

    let fb = ItemId::new("FB".to_string()).unwrap();
    assert!(fx.store.get(&drive(), &fb).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reapplying_the_same_feed_is_idempotent() {
    let fx = harness();

    let items = vec![
        root_item(),
        folder("A1", "root-1", "A"),
        file("F1", "A1", "b.txt", b"stable"),
    ];
    fx.remote.seed_file("F1", "A1", "b.txt", b"stable");
    fx.remote
        .set_delta_feed(vec![items.clone()], "fake://delta/link/1");
    fx.coordinator().run().await.unwrap();
    let rows_after_first = fx.store.len();

    // The same page arrives again (crash-recovery replay)
    fx.remote.set_delta_feed(vec![items], "fake://delta/link/2");
    let second = fx.coordinator().run().await.unwrap();

    assert_eq!(second.downloaded, 0);
    assert_eq!(second.uploaded, 0);
    assert_eq!(second.backed_up, 0);
    assert_eq!(fx.store.len(), rows_after_first);
    assert_eq!(std::fs::read(fx.root.join("A/b.txt")).unwrap(), b"stable");
}

#[tokio::test]
async fn test_multi_page_feed_applies_in_order() {
    let fx = harness();

    fx.remote.seed_file("F1", "A1", "one.txt", b"1");
    fx.remote.seed_file("F2", "A1", "two.txt", b"22");
    fx.remote.set_delta_feed(
        vec![
            vec![root_item(), folder("A1", "root-1", "A")],
            vec![file("F1", "A1", "one.txt", b"1")],
            vec![file("F2", "A1", "two.txt", b"22")],
        ],
        "fake://delta/link/final",
    );

    let report = fx.coordinator().run().await.unwrap();

    assert_eq!(report.downloaded, 2);
    assert!(fx.root.join("A/one.txt").exists());
    assert!(fx.root.join("A/two.txt").exists());
    let link = fx.state_files.delta_link(&drive()).unwrap().unwrap();
    assert_eq!(link.as_str(), "fake://delta/link/final");
}

#[tokio::test]
async fn test_delta_reset_reseeds_and_adopts() {
    let fx = harness();

    // Cycle 1 establishes state and a delta link
    fx.remote.seed_file("F1", "root-1", "keep.txt", b"kept");
    fx.remote.set_delta_feed(
        vec![vec![root_item(), file("F1", "root-1", "keep.txt", b"kept")]],
        "fake://delta/link/old",
    );
    fx.coordinator().run().await.unwrap();

    // Cycle 2: the stored token is rejected; the full feed replays
    fx.remote.queue_delta_error(RemoteError::DeltaReset);
    fx.remote.set_delta_feed(
        vec![vec![root_item(), file("F1", "root-1", "keep.txt", b"kept")]],
        "fake://delta/link/new",
    );

    let report = fx.coordinator().run().await.unwrap();

    // Identical content was adopted, not re-downloaded
    assert_eq!(report.downloaded, 0);
    assert!(report.is_clean());
    let link = fx.state_files.delta_link(&drive()).unwrap().unwrap();
    assert_eq!(link.as_str(), "fake://delta/link/new");
}

#[tokio::test]
async fn test_local_new_file_round_trips_to_remote() {
    let fx = harness();

    fx.remote
        .set_delta_feed(vec![vec![root_item()]], "fake://delta/link/1");
    std::fs::write(fx.root.join("created-here.txt"), b"local bytes").unwrap();

    let report = fx.coordinator().run().await.unwrap();

    assert_eq!(report.uploaded, 1);
    let (id, item) = fx.remote.find_by_name("created-here.txt").unwrap();
    assert_eq!(item.content.unwrap(), b"local bytes");

    // Round-trip law: the cached row's hash equals the local content hash
    let row = fx
        .store
        .get(&drive(), &ItemId::new(id).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.hashes.matches(&hash_all(b"local bytes")), Some(true));
    assert_eq!(row.state, SyncState::Present);
}

#[tokio::test]
async fn test_remote_tombstone_removes_local_file() {
    let fx = harness();

    fx.remote.seed_file("F1", "root-1", "doomed.txt", b"bytes");
    fx.remote.set_delta_feed(
        vec![vec![root_item(), file("F1", "root-1", "doomed.txt", b"bytes")]],
        "fake://delta/link/1",
    );
    fx.coordinator().run().await.unwrap();
    assert!(fx.root.join("doomed.txt").exists());

    fx.remote
        .set_delta_feed(vec![vec![tombstone("F1")]], "fake://delta/link/2");
    let report = fx.coordinator().run().await.unwrap();

    assert_eq!(report.deleted_local, 1);
    assert!(!fx.root.join("doomed.txt").exists());
    let f1 = ItemId::new("F1".to_string()).unwrap();
    assert!(fx.store.get(&drive(), &f1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_local_deletion_propagates_to_remote() {
    let fx = harness();

    fx.remote.seed_file("F1", "root-1", "mine.txt", b"bytes");
    fx.remote.set_delta_feed(
        vec![vec![root_item(), file("F1", "root-1", "mine.txt", b"bytes")]],
        "fake://delta/link/1",
    );
    fx.coordinator().run().await.unwrap();

    std::fs::remove_file(fx.root.join("mine.txt")).unwrap();
    fx.remote.set_delta_feed(vec![], "fake://delta/link/2");

    let report = fx.coordinator().run().await.unwrap();

    assert_eq!(report.deleted_remote, 1);
    assert!(fx.remote.item("F1").is_none());
}

#[tokio::test]
async fn test_orphaned_rows_force_reseed() {
    let fx = harness();

    // Seed a row whose parent does not exist
    let orphan = onesync_core::domain::item::CachedItem {
        drive_id: drive(),
        item_id: ItemId::new("lost-1".to_string()).unwrap(),
        parent_id: Some(ItemId::new("vanished".to_string()).unwrap()),
        name: "lost.txt".to_string(),
        kind: ItemKind::File,
        size: 1,
        etag: None,
        ctag: None,
        hashes: ContentHashes::none(),
        modified: None,
        local_path: Some(SyncPath::new(fx.root.join("lost.txt")).unwrap()),
        last_seen: None,
        state: SyncState::Present,
    };
    fx.store.upsert(&orphan).await.unwrap();

    fx.remote.seed_file("F1", "root-1", "fresh.txt", b"fresh");
    fx.remote.set_delta_feed(
        vec![vec![root_item(), file("F1", "root-1", "fresh.txt", b"fresh")]],
        "fake://delta/link/1",
    );

    fx.coordinator().run().await.unwrap();

    // The orphan is gone; the reseeded tree is present
    let lost = ItemId::new("lost-1".to_string()).unwrap();
    assert!(fx.store.get(&drive(), &lost).await.unwrap().is_none());
    assert!(fx.root.join("fresh.txt").exists());
}

#[tokio::test]
async fn test_resync_discards_link_but_adopts_content() {
    let fx = harness();

    fx.remote.seed_file("F1", "root-1", "a.txt", b"bytes");
    fx.remote.set_delta_feed(
        vec![vec![root_item(), file("F1", "root-1", "a.txt", b"bytes")]],
        "fake://delta/link/1",
    );
    fx.coordinator().run().await.unwrap();

    let fx2_config = {
        let mut c = fx.config.clone();
        c.resync = true;
        c
    };
    let coordinator = SyncCoordinator::new(
        fx.remote.clone(),
        fx.store.clone(),
        fx.state_files.clone(),
        Arc::new(FixedBudget(8)),
        fx2_config,
    )
    .unwrap();

    fx.remote.set_delta_feed(
        vec![vec![root_item(), file("F1", "root-1", "a.txt", b"bytes")]],
        "fake://delta/link/resynced",
    );
    let report = coordinator.run().await.unwrap();

    // Nothing re-downloaded; the link moved forward
    assert_eq!(report.downloaded, 0);
    let link = fx.state_files.delta_link(&drive()).unwrap().unwrap();
    assert_eq!(link.as_str(), "fake://delta/link/resynced");
}

#[tokio::test]
async fn test_auth_expiry_during_delta_aborts_run() {
    let fx = harness();
    fx.remote.queue_delta_error(RemoteError::AuthExpired);

    let result = fx.coordinator().run().await;
    assert!(matches!(
        result,
        Err(onesync_core::domain::errors::EngineError::AuthExpired)
    ));
    // The delta link was never advanced
    assert!(fx.state_files.delta_link(&drive()).unwrap().is_none());
}

#[tokio::test]
async fn test_dry_run_plans_without_side_effects() {
    let fx = harness_with(|c| c.dry_run = true);

    fx.remote.seed_file("F1", "A1", "b.txt", b"planned");
    fx.remote.set_delta_feed(
        vec![vec![
            root_item(),
            folder("A1", "root-1", "A"),
            file("F1", "A1", "b.txt", b"planned"),
        ]],
        "fake://delta/link/1",
    );

    fx.coordinator().run().await.unwrap();

    assert!(!fx.root.join("A").exists());
    assert_eq!(fx.store.len(), 0);
    assert!(fx.state_files.delta_link(&drive()).unwrap().is_none());
}

#[tokio::test]
async fn test_cancellation_aborts_cleanly() {
    let fx = harness();
    fx.remote.seed_file("F1", "root-1", "x.txt", b"bytes");
    fx.remote.set_delta_feed(
        vec![vec![root_item(), file("F1", "root-1", "x.txt", b"bytes")]],
        "fake://delta/link/1",
    );

    let coordinator = fx.coordinator();
    coordinator.cancellation_token().cancel();

    let result = coordinator.run().await;
    assert!(matches!(
        result,
        Err(onesync_core::domain::errors::EngineError::Cancelled)
    ));
    assert!(fx.state_files.delta_link(&drive()).unwrap().is_none());
}
