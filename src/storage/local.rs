//! Local filesystem storage backend.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;

use super::backend::{ListPage, ObjectHead, PutOptions, StorageBackend, StorageError, StorageResult};
use crate::cas::ContentHash;

/// Default number of keys returned per listing page
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Local filesystem storage backend.
///
/// Stores objects in a directory structure mirroring their keys:
/// ```text
/// {base_path}/
///   objects/{key}          # object bytes
///   meta/{key}.json        # content type, user metadata, etag
/// ```
pub struct LocalStorage {
    base_path: PathBuf,
    public_url: String,
    page_size: usize,
}

#[derive(Serialize, Deserialize, Default)]
struct Sidecar {
    content_type: String,
    etag: String,
    metadata: HashMap<String, String>,
}

impl LocalStorage {
    /// Create a new local storage backend
    pub fn new(base_path: PathBuf) -> Self {
        let public_url = format!("file://{}", base_path.join("objects").display());
        Self {
            base_path,
            public_url,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Base URL presigned links are issued against
    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Reject keys that are empty or would resolve outside the store root
    fn checked_key(key: &str) -> StorageResult<&str> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let escapes = Path::new(key)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(key)
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        Ok(self.base_path.join("objects").join(Self::checked_key(key)?))
    }

    fn sidecar_path(&self, key: &str) -> StorageResult<PathBuf> {
        Ok(self
            .base_path
            .join("meta")
            .join(format!("{}.json", Self::checked_key(key)?)))
    }

    /// Ensure parent directory exists
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn read_sidecar(&self, key: &str) -> StorageResult<Sidecar> {
        match fs::read(self.sidecar_path(key)?).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Sidecar::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Walk the object tree and return every key, sorted
    async fn all_keys(&self) -> StorageResult<Vec<String>> {
        let root = self.base_path.join("objects");
        let mut keys = Vec::new();
        if !root.exists() {
            return Ok(keys);
        }

        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn signed_url(&self, key: &str, method: &str, ttl: Duration) -> String {
        let expires = SystemTime::now()
            .checked_add(ttl)
            .unwrap_or_else(SystemTime::now)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        format!("{}/{}?method={}&expires={}", self.public_url, key, method, expires)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn location(&self) -> &str {
        self.base_path.to_str().unwrap_or("local")
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.object_path(key)?;
        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, key: &str, data: Bytes, options: PutOptions) -> StorageResult<ObjectHead> {
        let path = self.object_path(key)?;
        let sidecar_path = self.sidecar_path(key)?;
        self.ensure_parent(&path).await?;
        self.ensure_parent(&sidecar_path).await?;

        let sidecar = Sidecar {
            content_type: options.content_type,
            etag: ContentHash::from_data(&data).to_hex(),
            metadata: options.metadata,
        };
        fs::write(&path, &data).await?;
        fs::write(
            &sidecar_path,
            serde_json::to_vec(&sidecar).map_err(|e| StorageError::Io(e.into()))?,
        )
        .await?;

        Ok(ObjectHead {
            key: key.to_string(),
            size: data.len() as u64,
            etag: sidecar.etag,
        })
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectHead> {
        let path = self.object_path(key)?;
        let metadata = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;
        let sidecar = self.read_sidecar(key).await?;
        Ok(ObjectHead {
            key: key.to_string(),
            size: metadata.len(),
            etag: sidecar.etag,
        })
    }

    async fn list(&self, prefix: &str, continuation: Option<String>) -> StorageResult<ListPage> {
        let keys: Vec<String> = self
            .all_keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| continuation.as_deref().map_or(true, |after| k.as_str() > after))
            .collect();

        if keys.len() > self.page_size {
            let page: Vec<String> = keys.into_iter().take(self.page_size).collect();
            let next = page.last().cloned();
            Ok(ListPage { keys: page, next })
        } else {
            Ok(ListPage { keys, next: None })
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {} // Already deleted
            Err(e) => return Err(StorageError::Io(e)),
        }
        match fs::remove_file(self.sidecar_path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        Self::checked_key(key)?;
        Ok(self.signed_url(key, "GET", ttl))
    }

    async fn presign_put(&self, key: &str, _content_type: &str, ttl: Duration) -> StorageResult<String> {
        Self::checked_key(key)?;
        Ok(self.signed_url(key, "PUT", ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> PutOptions {
        PutOptions {
            content_type: "text/plain".to_string(),
            metadata: HashMap::from([("name".to_string(), "a.txt".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_local_storage_basic() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        // Put and get
        let data = Bytes::from("hello world");
        let head = storage.put("disks/d1/abc.txt", data.clone(), options()).await.unwrap();
        assert_eq!(head.size, 11);
        assert_eq!(head.etag, ContentHash::from_data(b"hello world").to_hex());

        let retrieved = storage.get("disks/d1/abc.txt").await.unwrap();
        assert_eq!(retrieved, data);

        // Head
        let head = storage.head("disks/d1/abc.txt").await.unwrap();
        assert_eq!(head.size, 11);

        // Delete, twice
        storage.delete("disks/d1/abc.txt").await.unwrap();
        storage.delete("disks/d1/abc.txt").await.unwrap();
        assert!(matches!(
            storage.get("disks/d1/abc.txt").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_storage_list_paginates() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf()).with_page_size(2);

        for key in ["ns/a/1", "ns/a/2", "ns/b/3", "other/4"] {
            storage.put(key, Bytes::from("x"), options()).await.unwrap();
        }

        let first = storage.list("ns/", None).await.unwrap();
        assert_eq!(first.keys, vec!["ns/a/1", "ns/a/2"]);
        let second = storage.list("ns/", first.next).await.unwrap();
        assert_eq!(second.keys, vec!["ns/b/3"]);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_local_storage_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        for key in ["", "/etc/passwd", "a/../../b"] {
            let result = storage.put(key, Bytes::from("x"), options()).await;
            assert!(matches!(result, Err(StorageError::InvalidKey(_))), "{key}");
        }
    }

    #[tokio::test]
    async fn test_local_storage_batch_delete_ignores_missing() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());
        storage.put("k/1", Bytes::from("1"), options()).await.unwrap();

        storage
            .delete_batch(&["k/1".to_string(), "k/missing".to_string()])
            .await
            .unwrap();
        assert!(storage.list("k/", None).await.unwrap().keys.is_empty());
    }

    #[tokio::test]
    async fn test_local_presign_uses_public_url() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf())
            .with_public_url("http://files.example.test/");

        let url = storage
            .presign_get("disks/d/x.pdf", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("http://files.example.test/disks/d/x.pdf?method=GET&expires="));
    }
}
