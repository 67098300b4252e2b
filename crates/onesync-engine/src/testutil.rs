//! In-memory fakes for the engine's tests
//!
//! Not part of the public surface; kept compiled so both unit tests and the
//! integration suite can share one fake remote and one fake store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use onesync_core::domain::item::{CachedItem, ContentHashes, ItemKind, RemoteItem};
use onesync_core::domain::newtypes::{DeltaLink, DriveId, ItemId, SyncPath};
use onesync_core::hash::hash_all;
use onesync_core::ports::item_store::{ItemStore, StoreError};
use onesync_core::ports::remote_drive::{
    ByteStream, ChunkOutcome, DeltaPage, DriveInfo, RemoteDrive, RemoteError, UploadSession,
};

/// HashMap-backed ItemStore for tests
#[derive(Default)]
pub struct MemStore {
    rows: Mutex<HashMap<(String, String), CachedItem>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct row count, for assertions
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn key(drive_id: &DriveId, item_id: &ItemId) -> (String, String) {
        (drive_id.as_str().to_string(), item_id.as_str().to_string())
    }
}

#[async_trait::async_trait]
impl ItemStore for MemStore {
    async fn upsert(&self, item: &CachedItem) -> Result<(), StoreError> {
        self.rows
            .lock()
            .unwrap()
            .insert(Self::key(&item.drive_id, &item.item_id), item.clone());
        Ok(())
    }

    async fn get(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
    ) -> Result<Option<CachedItem>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&Self::key(drive_id, item_id))
            .cloned())
    }

    async fn children_of(
        &self,
        drive_id: &DriveId,
        parent_id: &ItemId,
    ) -> Result<Vec<CachedItem>, StoreError> {
        let mut children: Vec<CachedItem> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| {
                row.drive_id == *drive_id
                    && row.parent_id.as_ref() == Some(parent_id)
            })
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn get_by_path(&self, path: &SyncPath) -> Result<Option<CachedItem>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|row| row.local_path.as_ref() == Some(path))
            .cloned())
    }

    async fn remove(&self, drive_id: &DriveId, item_id: &ItemId) -> Result<(), StoreError> {
        self.rows.lock().unwrap().remove(&Self::key(drive_id, item_id));
        Ok(())
    }

    async fn apply_page(
        &self,
        upserts: &[CachedItem],
        removals: &[(DriveId, ItemId)],
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        for item in upserts {
            rows.insert(Self::key(&item.drive_id, &item.item_id), item.clone());
        }
        for (drive_id, item_id) in removals {
            rows.remove(&Self::key(drive_id, item_id));
        }
        Ok(())
    }

    async fn items_in_drive(&self, drive_id: &DriveId) -> Result<Vec<CachedItem>, StoreError> {
        let mut items: Vec<CachedItem> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.drive_id == *drive_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        Ok(items)
    }

    async fn tombstones(&self, drive_id: &DriveId) -> Result<Vec<CachedItem>, StoreError> {
        use onesync_core::domain::item::SyncState;
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.drive_id == *drive_id && row.state == SyncState::Tombstoned)
            .cloned()
            .collect())
    }

    async fn orphans(&self) -> Result<Vec<CachedItem>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|row| {
                row.parent_id.as_ref().is_some_and(|parent| {
                    !rows.contains_key(&Self::key(&row.drive_id, parent))
                })
            })
            .cloned()
            .collect())
    }

    async fn clear_drive(&self, drive_id: &DriveId) -> Result<(), StoreError> {
        self.rows
            .lock()
            .unwrap()
            .retain(|_, row| row.drive_id != *drive_id);
        Ok(())
    }
}

// ============================================================================
// FakeRemote
// ============================================================================

/// One remote-side item held by the fake
#[derive(Debug, Clone)]
pub struct FakeItem {
    pub name: String,
    pub parent_id: Option<ItemId>,
    pub content: Option<Vec<u8>>,
    pub etag: String,
    pub is_folder: bool,
}

#[derive(Default)]
struct FakeSessionState {
    sessions: HashMap<String, FakeSession>,
    counter: u32,
}

struct FakeSession {
    parent_id: ItemId,
    name: String,
    buffer: Vec<u8>,
}

/// In-memory RemoteDrive with failure injection
///
/// Content lives in a HashMap; downloads stream it back, uploads write it.
/// `queue_error` pushes one-shot errors returned by the next content
/// operation, and `corrupt_downloads` serves flipped bytes to exercise the
/// integrity path.
#[derive(Default)]
pub struct FakeRemote {
    items: Mutex<HashMap<String, FakeItem>>,
    sessions: Mutex<FakeSessionState>,
    pending_errors: Mutex<Vec<RemoteError>>,
    delta_pages: Mutex<Vec<DeltaPage>>,
    delta_errors: Mutex<Vec<RemoteError>>,
    pub corrupt_downloads: AtomicBool,
    folder_counter: AtomicU32,
    upload_counter: AtomicU32,
    pub download_calls: AtomicU32,
    pub delete_calls: AtomicU32,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a remote file; returns its id
    pub fn seed_file(&self, id: &str, parent: &str, name: &str, content: &[u8]) -> ItemId {
        self.items.lock().unwrap().insert(
            id.to_string(),
            FakeItem {
                name: name.to_string(),
                parent_id: Some(ItemId::new(parent.to_string()).unwrap()),
                content: Some(content.to_vec()),
                etag: format!("\"{id}-v1\""),
                is_folder: false,
            },
        );
        ItemId::new(id.to_string()).unwrap()
    }

    /// Replace a seeded file's content (a concurrent remote edit)
    pub fn mutate_file(&self, id: &str, content: &[u8]) {
        let mut items = self.items.lock().unwrap();
        let item = items.get_mut(id).expect("unknown fake item");
        item.content = Some(content.to_vec());
        item.etag = format!("\"{id}-v2\"");
    }

    /// Queue a one-shot error for the next content operation
    pub fn queue_error(&self, error: RemoteError) {
        self.pending_errors.lock().unwrap().push(error);
    }

    /// Queue a one-shot error for the next delta request
    pub fn queue_delta_error(&self, error: RemoteError) {
        self.delta_errors.lock().unwrap().push(error);
    }

    /// Program the delta feed from batches of items
    ///
    /// Each batch becomes one page; all but the last carry a `next_link`,
    /// the last carries `final_link` as its delta link.
    pub fn set_delta_feed(&self, batches: Vec<Vec<RemoteItem>>, final_link: &str) {
        let total = batches.len();
        let pages = batches
            .into_iter()
            .enumerate()
            .map(|(index, items)| DeltaPage {
                items,
                next_link: (index + 1 < total)
                    .then(|| format!("fake://delta/page/{}", index + 1)),
                delta_link: (index + 1 == total)
                    .then(|| DeltaLink::new(final_link.to_string()).unwrap()),
            })
            .collect();
        *self.delta_pages.lock().unwrap() = pages;
    }

    fn pop_delta_page(&self) -> Result<DeltaPage, RemoteError> {
        if let Some(err) = self.delta_errors.lock().unwrap().pop() {
            return Err(err);
        }
        let mut pages = self.delta_pages.lock().unwrap();
        if pages.is_empty() {
            // An exhausted feed answers with an empty final page
            return Ok(DeltaPage {
                items: Vec::new(),
                next_link: None,
                delta_link: Some(DeltaLink::new("fake://delta/link/empty".to_string()).unwrap()),
            });
        }
        Ok(pages.remove(0))
    }

    /// Direct item access for assertions
    pub fn item(&self, id: &str) -> Option<FakeItem> {
        self.items.lock().unwrap().get(id).cloned()
    }

    /// Find an item id by name, for assertions on new uploads
    pub fn find_by_name(&self, name: &str) -> Option<(String, FakeItem)> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .find(|(_, item)| item.name == name)
            .map(|(id, item)| (id.clone(), item.clone()))
    }

    pub fn item_count(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    fn take_error(&self) -> Option<RemoteError> {
        self.pending_errors.lock().unwrap().pop()
    }

    fn to_remote_item(&self, drive_id: &DriveId, id: &str, item: &FakeItem) -> RemoteItem {
        let hashes = item
            .content
            .as_ref()
            .map(|c| hash_all(c))
            .unwrap_or_else(ContentHashes::none);
        RemoteItem {
            drive_id: drive_id.clone(),
            item_id: ItemId::new(id.to_string()).unwrap(),
            parent_id: item.parent_id.clone(),
            name: item.name.clone(),
            kind: if item.is_folder {
                ItemKind::Folder
            } else {
                ItemKind::File
            },
            size: item.content.as_ref().map(|c| c.len() as u64),
            etag: Some(item.etag.clone()),
            ctag: None,
            hashes,
            modified: Some("2026-04-01T10:00:00Z".parse().unwrap()),
            is_deleted: false,
        }
    }
}

#[async_trait::async_trait]
impl RemoteDrive for FakeRemote {
    async fn list_drives(&self) -> Result<Vec<DriveInfo>, RemoteError> {
        Ok(Vec::new())
    }

    async fn delta_page_initial(
        &self,
        _drive_id: &DriveId,
        _link: Option<&DeltaLink>,
    ) -> Result<DeltaPage, RemoteError> {
        self.pop_delta_page()
    }

    async fn delta_page_next(&self, _next_link: &str) -> Result<DeltaPage, RemoteError> {
        self.pop_delta_page()
    }

    async fn get_item(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
    ) -> Result<RemoteItem, RemoteError> {
        let items = self.items.lock().unwrap();
        match items.get(item_id.as_str()) {
            Some(item) => Ok(self.to_remote_item(drive_id, item_id.as_str(), item)),
            None => Err(RemoteError::Client {
                status: 404,
                code: "itemNotFound".into(),
                message: "no such fake item".into(),
            }),
        }
    }

    async fn list_children(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        let items = self.items.lock().unwrap();
        Ok(items
            .iter()
            .filter(|(_, item)| item.parent_id.as_ref() == Some(item_id))
            .map(|(id, item)| self.to_remote_item(drive_id, id, item))
            .collect())
    }

    async fn download(
        &self,
        _drive_id: &DriveId,
        item_id: &ItemId,
        offset: u64,
    ) -> Result<ByteStream, RemoteError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_error() {
            return Err(err);
        }

        let items = self.items.lock().unwrap();
        let item = items.get(item_id.as_str()).ok_or(RemoteError::Client {
            status: 404,
            code: "itemNotFound".into(),
            message: "no such fake item".into(),
        })?;
        let mut content = item.content.clone().unwrap_or_default();
        if self.corrupt_downloads.load(Ordering::SeqCst) {
            for byte in content.iter_mut() {
                *byte ^= 0xFF;
            }
        }
        let tail = content.split_off((offset as usize).min(content.len()));

        let stream = futures_util::stream::iter(vec![Ok(bytes::Bytes::from(tail))]);
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
        if let Some(err) = self.take_error() {
            return Err(err);
        }

        let mut items = self.items.lock().unwrap();
        let existing = items
            .iter()
            .find(|(_, item)| item.parent_id.as_ref() == Some(parent_id) && item.name == name)
            .map(|(id, item)| (id.clone(), item.etag.clone()));

        let id = match existing {
            Some((id, current_etag)) => {
                if let Some(expected) = if_match {
                    if expected != current_etag {
                        return Err(RemoteError::Client {
                            status: 412,
                            code: "resourceModified".into(),
                            message: "etag mismatch".into(),
                        });
                    }
                }
                id
            }
            None => {
                let n = self.upload_counter.fetch_add(1, Ordering::SeqCst) + 1;
                format!("uploaded-{n}")
            }
        };

        let item = FakeItem {
            name: name.to_string(),
            parent_id: Some(parent_id.clone()),
            content: Some(data),
            etag: format!("\"{id}-up\""),
            is_folder: false,
        };
        items.insert(id.clone(), item.clone());
        Ok(self.to_remote_item(drive_id, &id, &item))
    }

    async fn create_upload_session(
        &self,
        _drive_id: &DriveId,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<UploadSession, RemoteError> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        let mut state = self.sessions.lock().unwrap();
        state.counter += 1;
        let url = format!("fake://session/{}", state.counter);
        state.sessions.insert(
            url.clone(),
            FakeSession {
                parent_id: parent_id.clone(),
                name: name.to_string(),
                buffer: Vec::new(),
            },
        );
        Ok(UploadSession {
            upload_url: url,
            expires: None,
        })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        chunk: Vec<u8>,
        range: (u64, u64),
        total: u64,
    ) -> Result<ChunkOutcome, RemoteError> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }

        let (parent_id, name, complete_content) = {
            let mut state = self.sessions.lock().unwrap();
            let fake = state
                .sessions
                .get_mut(&session.upload_url)
                .ok_or(RemoteError::Client {
                    status: 404,
                    code: "uploadSessionNotFound".into(),
                    message: "no such session".into(),
                })?;

            if fake.buffer.len() as u64 != range.0 {
                return Err(RemoteError::Client {
                    status: 416,
                    code: "invalidRange".into(),
                    message: format!(
                        "expected offset {}, got {}",
                        fake.buffer.len(),
                        range.0
                    ),
                });
            }
            fake.buffer.extend_from_slice(&chunk);

            if (fake.buffer.len() as u64) < total {
                return Ok(ChunkOutcome::More {
                    next_offset: fake.buffer.len() as u64,
                });
            }
            let done = state.sessions.remove(&session.upload_url).unwrap();
            (done.parent_id, done.name, done.buffer)
        };

        let n = self.upload_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("uploaded-{n}");
        let item = FakeItem {
            name,
            parent_id: Some(parent_id),
            content: Some(complete_content),
            etag: format!("\"{id}-up\""),
            is_folder: false,
        };
        self.items.lock().unwrap().insert(id.clone(), item.clone());
        let drive = DriveId::new("d1".to_string()).unwrap();
        Ok(ChunkOutcome::Done(Box::new(
            self.to_remote_item(&drive, &id, &item),
        )))
    }

    async fn upload_session_status(
        &self,
        session: &UploadSession,
    ) -> Result<u64, RemoteError> {
        let state = self.sessions.lock().unwrap();
        state
            .sessions
            .get(&session.upload_url)
            .map(|s| s.buffer.len() as u64)
            .ok_or(RemoteError::Client {
                status: 404,
                code: "uploadSessionNotFound".into(),
                message: "no such session".into(),
            })
    }

    async fn create_folder(
        &self,
        drive_id: &DriveId,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<RemoteItem, RemoteError> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        let n = self.folder_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("folder-{n}");
        let item = FakeItem {
            name: name.to_string(),
            parent_id: Some(parent_id.clone()),
            content: None,
            etag: format!("\"{id}\""),
            is_folder: true,
        };
        self.items.lock().unwrap().insert(id.clone(), item.clone());
        Ok(self.to_remote_item(drive_id, &id, &item))
    }

    async fn rename_item(
        &self,
        drive_id: &DriveId,
        item_id: &ItemId,
        new_parent_id: Option<&ItemId>,
        new_name: Option<&str>,
    ) -> Result<RemoteItem, RemoteError> {
        let mut items = self.items.lock().unwrap();
        let item = items
            .get_mut(item_id.as_str())
            .ok_or(RemoteError::Client {
                status: 404,
                code: "itemNotFound".into(),
                message: "no such fake item".into(),
            })?;
        if let Some(parent) = new_parent_id {
            item.parent_id = Some(parent.clone());
        }
        if let Some(name) = new_name {
            item.name = name.to_string();
        }
        let snapshot = item.clone();
        Ok(self.to_remote_item(drive_id, item_id.as_str(), &snapshot))
    }

    async fn delete_item(
        &self,
        _drive_id: &DriveId,
        item_id: &ItemId,
    ) -> Result<(), RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        let removed = self.items.lock().unwrap().remove(item_id.as_str());
        if removed.is_none() {
            return Err(RemoteError::Client {
                status: 404,
                code: "itemNotFound".into(),
                message: "no such fake item".into(),
            });
        }
        Ok(())
    }
}
