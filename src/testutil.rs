//! Test harness: on-disk SQLite and a local object store in a temp dir.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sea_orm::{EntityTrait, PaginatorTrait};
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::db;
use crate::db::entities::{asset_reference, asset_reference_release};
use crate::service::StorageCore;
use crate::storage::{
    ListPage, LocalStorage, ObjectHead, PutOptions, StorageBackend, StorageError, StorageResult,
};

/// Local storage whose calls can be made to fail, stall or race
pub(crate) struct SwitchedStorage {
    inner: LocalStorage,
    fail_puts: AtomicBool,
    slow_puts: AtomicBool,
    fail_deletes: AtomicBool,
    pause_delete: AtomicBool,
    vanish_head: AtomicBool,
    delete_paused: Notify,
    delete_resume: Notify,
}

impl SwitchedStorage {
    fn new(inner: LocalStorage) -> Self {
        Self {
            inner,
            fail_puts: AtomicBool::new(false),
            slow_puts: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            pause_delete: AtomicBool::new(false),
            vanish_head: AtomicBool::new(false),
            delete_paused: Notify::new(),
            delete_resume: Notify::new(),
        }
    }

    pub fn fail_puts(&self, on: bool) {
        self.fail_puts.store(on, Ordering::SeqCst);
    }

    /// Puts sleep far longer than any test deadline
    pub fn slow_puts(&self, on: bool) {
        self.slow_puts.store(on, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, on: bool) {
        self.fail_deletes.store(on, Ordering::SeqCst);
    }

    /// Hold the next batch delete until [`SwitchedStorage::resume_delete`]
    pub fn pause_next_delete(&self) {
        self.pause_delete.store(true, Ordering::SeqCst);
    }

    pub async fn delete_paused(&self) {
        self.delete_paused.notified().await;
    }

    pub fn resume_delete(&self) {
        self.delete_resume.notify_one();
    }

    /// The next successful head removes the object right after answering,
    /// like a reap finishing behind the caller's back
    pub fn vanish_next_head(&self) {
        self.vanish_head.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for SwitchedStorage {
    fn location(&self) -> &str {
        self.inner.location()
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes, options: PutOptions) -> StorageResult<ObjectHead> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Request("put refused".into()));
        }
        if self.slow_puts.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.put(key, data, options).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectHead> {
        let head = self.inner.head(key).await?;
        if self.vanish_head.swap(false, Ordering::SeqCst) {
            self.inner.delete(key).await?;
        }
        Ok(head)
    }

    async fn list(&self, prefix: &str, continuation: Option<String>) -> StorageResult<ListPage> {
        self.inner.list(prefix, continuation).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Request("delete refused".into()));
        }
        self.inner.delete(key).await
    }

    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Request("delete refused".into()));
        }
        if self.pause_delete.swap(false, Ordering::SeqCst) {
            self.delete_paused.notify_one();
            self.delete_resume.notified().await;
        }
        self.inner.delete_batch(keys).await
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        self.inner.presign_get(key, ttl).await
    }

    async fn presign_put(&self, key: &str, content_type: &str, ttl: Duration) -> StorageResult<String> {
        self.inner.presign_put(key, content_type, ttl).await
    }
}

pub(crate) struct Harness {
    core: StorageCore,
    pub backend: Arc<SwitchedStorage>,
    _dir: TempDir,
}

impl Deref for Harness {
    type Target = StorageCore;

    fn deref(&self) -> &StorageCore {
        &self.core
    }
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("test.db").display());
        let db = Arc::new(db::connect(&url, Some(1)).await.unwrap());
        let local = LocalStorage::new(dir.path().join("store")).with_page_size(2);
        let backend = Arc::new(SwitchedStorage::new(local));
        let core = StorageCore::new(db, backend.clone(), Duration::from_secs(3600));
        Self {
            core,
            backend,
            _dir: dir,
        }
    }

    pub async fn object_exists(&self, key: &str) -> bool {
        self.backend.inner.head(key).await.is_ok()
    }

    pub async fn object_count(&self) -> usize {
        let mut count = 0;
        let mut next = None;
        loop {
            let page = self.backend.inner.list("", next).await.unwrap();
            count += page.keys.len();
            match page.next {
                Some(token) => next = Some(token),
                None => return count,
            }
        }
    }

    /// Stored count including tombstones
    pub async fn raw_ref_count(&self, project_id: Uuid, sha256: &str) -> Option<i64> {
        asset_reference::Entity::find_by_id((project_id.to_string(), sha256.to_string()))
            .one(self.db.as_ref())
            .await
            .unwrap()
            .map(|row| row.ref_count)
    }

    pub async fn pending_releases(&self) -> u64 {
        asset_reference_release::Entity::find()
            .count(self.db.as_ref())
            .await
            .unwrap()
    }
}
