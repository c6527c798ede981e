//! Blob Store: content-addressed upload, download, delete and presign.
//!
//! Objects are written under `{prefix}/{yyyy}/{mm}/{dd}/{sha256}{ext}` and are
//! never rewritten once stored. The store knows nothing about references;
//! whether an object may be deleted is decided by the ledger.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::cas::ContentHash;
use crate::deadline::Deadline;
use crate::error::{Result, StoreError};
use crate::storage::{PutOptions, StorageBackend, StorageError, MAX_BATCH_DELETE};

/// Immutable descriptor of stored content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Bucket (or local root) holding the object
    pub bucket: String,
    pub s3_key: String,
    /// Integrity tag reported by the store
    pub etag: String,
    pub sha256: String,
    pub mime: String,
    pub size_b: i64,
}

/// Content waiting to be stored
#[derive(Clone, Debug)]
pub struct Upload {
    pub data: Bytes,
    pub hash: ContentHash,
    pub mime: String,
    /// Lower-cased extension including the dot, or empty
    pub ext: String,
    /// Original file name, carried as object metadata
    pub name: Option<String>,
}

/// Lower-cased extension of `filename` including the dot, or empty
pub fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

impl Upload {
    pub fn new(filename: &str, mime: impl Into<String>, data: Bytes) -> Self {
        let ext = file_extension(filename);
        let mime = mime.into();
        Self {
            hash: ContentHash::from_data(&data),
            mime: if mime.is_empty() {
                "application/octet-stream".to_string()
            } else {
                mime
            },
            ext,
            name: Some(filename.to_string()),
            data,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let data = Bytes::from(serde_json::to_vec(value)?);
        Ok(Self {
            hash: ContentHash::from_data(&data),
            mime: "application/json".to_string(),
            ext: ".json".to_string(),
            name: None,
            data,
        })
    }

    pub fn size(&self) -> i64 {
        self.data.len() as i64
    }

    fn object_metadata(&self) -> HashMap<String, String> {
        let mut meta = HashMap::from([("sha256".to_string(), self.hash.to_hex())]);
        if let Some(name) = &self.name {
            meta.insert("name".to_string(), name.clone());
        }
        meta
    }
}

/// Object key for content stored under `prefix` on `date`
pub fn object_key(prefix: &str, date: DateTime<Utc>, hash: &ContentHash, ext: &str) -> String {
    format!(
        "{}/{}/{}{}",
        prefix.trim_end_matches('/'),
        date.format("%Y/%m/%d"),
        hash.to_hex(),
        ext
    )
}

/// Content-addressed object access on top of a [`StorageBackend`]
pub struct BlobStore {
    backend: Arc<dyn StorageBackend>,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Store `upload` under `prefix` unless an object with the same hash is
    /// already there, in which case its descriptor is returned untouched.
    ///
    /// A failing existence scan falls through to a fresh upload.
    pub async fn upload_dedup(&self, prefix: &str, upload: &Upload, deadline: Deadline) -> Result<Asset> {
        deadline
            .run("upload", async {
                match self.find_existing(prefix, upload).await {
                    Ok(Some(asset)) => {
                        tracing::debug!("Dedup hit for {} at {}", upload.hash, asset.s3_key);
                        return Ok(asset);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(
                            "Existence scan under {} failed, uploading {} anew: {}",
                            prefix,
                            upload.hash,
                            e
                        );
                    }
                }

                let key = object_key(prefix, Utc::now(), &upload.hash, &upload.ext);
                let head = self
                    .backend
                    .put(
                        &key,
                        upload.data.clone(),
                        PutOptions {
                            content_type: upload.mime.clone(),
                            metadata: upload.object_metadata(),
                        },
                    )
                    .await?;

                tracing::debug!("Stored {} ({} bytes) at {}", upload.hash, head.size, key);
                Ok::<_, StoreError>(self.describe(key, head.etag, upload, upload.size()))
            })
            .await
    }

    /// Put `upload` back under `asset`'s key when the object is gone, as
    /// after a reap that finished between the dedup lookup and the ledger
    /// write. Returns whether the object had to be restored.
    pub async fn restore_missing(&self, asset: &Asset, upload: &Upload, deadline: Deadline) -> Result<bool> {
        deadline
            .run("restore", async {
                match self.backend.head(&asset.s3_key).await {
                    Ok(_) => return Ok(false),
                    Err(StorageError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                self.backend
                    .put(
                        &asset.s3_key,
                        upload.data.clone(),
                        PutOptions {
                            content_type: upload.mime.clone(),
                            metadata: upload.object_metadata(),
                        },
                    )
                    .await?;
                tracing::warn!("Restored {} at {} after a concurrent delete", upload.hash, asset.s3_key);
                Ok::<_, StoreError>(true)
            })
            .await
    }

    /// Paginated scan of `prefix` for a key containing the content hash
    async fn find_existing(&self, prefix: &str, upload: &Upload) -> Result<Option<Asset>> {
        let needle = upload.hash.to_hex();
        let mut continuation = None;
        loop {
            let page = self.backend.list(prefix, continuation).await?;
            for key in page.keys.into_iter().filter(|k| k.contains(&needle)) {
                // A key that vanished between list and head is simply skipped
                if let Ok(head) = self.backend.head(&key).await {
                    return Ok(Some(self.describe(key, head.etag, upload, head.size as i64)));
                }
            }
            match page.next {
                Some(token) => continuation = Some(token),
                None => return Ok(None),
            }
        }
    }

    fn describe(&self, key: String, etag: String, upload: &Upload, size: i64) -> Asset {
        Asset {
            bucket: self.backend.location().to_string(),
            s3_key: key,
            etag,
            sha256: upload.hash.to_hex(),
            mime: upload.mime.clone(),
            size_b: size,
        }
    }

    /// Serialize `value` as JSON and store it with dedup
    pub async fn upload_json<T: Serialize>(&self, prefix: &str, value: &T, deadline: Deadline) -> Result<Asset> {
        let upload = Upload::json(value)?;
        self.upload_dedup(prefix, &upload, deadline).await
    }

    pub async fn download(&self, key: &str, deadline: Deadline) -> Result<Bytes> {
        if key.is_empty() {
            return Err(StoreError::InvalidArgument("object key is empty".into()));
        }
        deadline
            .run("download", async { Ok::<_, StoreError>(self.backend.get(key).await?) })
            .await
    }

    pub async fn download_json<T: DeserializeOwned>(&self, key: &str, deadline: Deadline) -> Result<T> {
        let data = self.download(key, deadline).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn delete(&self, key: &str, deadline: Deadline) -> Result<()> {
        if key.is_empty() {
            return Err(StoreError::InvalidArgument("object key is empty".into()));
        }
        deadline
            .run("delete", async { Ok::<_, StoreError>(self.backend.delete(key).await?) })
            .await
    }

    /// Delete many keys, split into requests of at most 1000 keys.
    /// Empty keys are skipped and missing keys are not an error.
    pub async fn delete_batch(&self, keys: &[String], deadline: Deadline) -> Result<()> {
        let keys: Vec<String> = keys.iter().filter(|k| !k.is_empty()).cloned().collect();
        if keys.is_empty() {
            return Ok(());
        }
        deadline
            .run("delete batch", async {
                for chunk in keys.chunks(MAX_BATCH_DELETE) {
                    self.backend.delete_batch(chunk).await?;
                }
                Ok::<_, StoreError>(())
            })
            .await
    }

    pub async fn presign_get(&self, key: &str, ttl: Duration, deadline: Deadline) -> Result<String> {
        if key.is_empty() {
            return Err(StoreError::UpstreamStorage(StorageError::InvalidKey(String::new())));
        }
        deadline
            .run("presign get", async { Ok::<_, StoreError>(self.backend.presign_get(key, ttl).await?) })
            .await
    }

    pub async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<String> {
        deadline
            .run("presign put", async {
                Ok::<_, StoreError>(self.backend.presign_put(key, content_type, ttl).await?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tempfile::TempDir;

    use crate::storage::{ListPage, ObjectHead, StorageResult};

    fn local_store(dir: &TempDir) -> (Arc<LocalStorage>, BlobStore) {
        let backend = Arc::new(LocalStorage::new(dir.path().to_path_buf()).with_page_size(1));
        (backend.clone(), BlobStore::new(backend))
    }

    #[test]
    fn test_object_key_layout() {
        let date = Utc.with_ymd_and_hms(2025, 3, 7, 12, 0, 0).unwrap();
        let hash = ContentHash::from_data(b"x");
        assert_eq!(
            object_key("disks/abc/", date, &hash, ".pdf"),
            format!("disks/abc/2025/03/07/{}.pdf", hash.to_hex())
        );
    }

    #[test]
    fn test_upload_extension_and_default_mime() {
        let upload = Upload::new("Report.PDF", "", Bytes::from("x"));
        assert_eq!(upload.ext, ".pdf");
        assert_eq!(upload.mime, "application/octet-stream");
        assert_eq!(Upload::new("Makefile", "text/plain", Bytes::new()).ext, "");
    }

    #[tokio::test]
    async fn test_upload_dedup_reuses_existing_object() {
        let dir = TempDir::new().unwrap();
        let (backend, blobs) = local_store(&dir);

        // Unrelated keys force the scan across several pages
        for i in 0..3 {
            let other = Upload::new(&format!("{i}.txt"), "text/plain", Bytes::from(format!("other {i}")));
            blobs.upload_dedup("disks/d1", &other, Deadline::none()).await.unwrap();
        }

        let upload = Upload::new("report.pdf", "application/pdf", Bytes::from("same bytes"));
        let first = blobs.upload_dedup("disks/d1", &upload, Deadline::none()).await.unwrap();
        let again = Upload::new("copy.pdf", "application/pdf", Bytes::from("same bytes"));
        let second = blobs.upload_dedup("disks/d1", &again, Deadline::none()).await.unwrap();

        assert_eq!(first.s3_key, second.s3_key);
        assert_eq!(first.sha256, upload.hash.to_hex());
        assert_eq!(second.size_b, 10);

        let mut keys = Vec::new();
        let mut next = None;
        loop {
            let page = backend.list("disks/d1/", next).await.unwrap();
            keys.extend(page.keys);
            match page.next {
                Some(token) => next = Some(token),
                None => break,
            }
        }
        assert_eq!(keys.len(), 4);
    }

    #[tokio::test]
    async fn test_json_roundtrip_through_store() {
        let dir = TempDir::new().unwrap();
        let (_, blobs) = local_store(&dir);

        let value = serde_json::json!({"role": "user", "parts": [1, 2, 3]});
        let asset = blobs.upload_json("parts/p1", &value, Deadline::none()).await.unwrap();
        assert!(asset.s3_key.ends_with(".json"));
        assert_eq!(asset.mime, "application/json");

        let back: serde_json::Value = blobs.download_json(&asset.s3_key, Deadline::none()).await.unwrap();
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn test_delete_batch_skips_empty_keys() {
        let dir = TempDir::new().unwrap();
        let (backend, blobs) = local_store(&dir);
        let upload = Upload::new("a.txt", "text/plain", Bytes::from("a"));
        let asset = blobs.upload_dedup("p", &upload, Deadline::none()).await.unwrap();

        blobs
            .delete_batch(&[String::new(), asset.s3_key.clone(), "p/missing".into()], Deadline::none())
            .await
            .unwrap();
        assert!(backend.list("p/", None).await.unwrap().keys.is_empty());
    }

    /// Backend whose listing always fails, to exercise the upload fallback
    struct BrokenList(LocalStorage);

    #[async_trait]
    impl StorageBackend for BrokenList {
        fn location(&self) -> &str {
            self.0.location()
        }
        async fn get(&self, key: &str) -> StorageResult<Bytes> {
            self.0.get(key).await
        }
        async fn put(&self, key: &str, data: Bytes, options: PutOptions) -> StorageResult<ObjectHead> {
            self.0.put(key, data, options).await
        }
        async fn head(&self, key: &str) -> StorageResult<ObjectHead> {
            self.0.head(key).await
        }
        async fn list(&self, _prefix: &str, _continuation: Option<String>) -> StorageResult<ListPage> {
            Err(StorageError::Request("listing unavailable".into()))
        }
        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.0.delete(key).await
        }
        async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
            self.0.delete_batch(keys).await
        }
        async fn presign_get(&self, key: &str, ttl: Duration) -> StorageResult<String> {
            self.0.presign_get(key, ttl).await
        }
        async fn presign_put(&self, key: &str, content_type: &str, ttl: Duration) -> StorageResult<String> {
            self.0.presign_put(key, content_type, ttl).await
        }
    }

    #[tokio::test]
    async fn test_failed_scan_falls_through_to_upload() {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(Arc::new(BrokenList(LocalStorage::new(dir.path().to_path_buf()))));

        let upload = Upload::new("a.txt", "text/plain", Bytes::from("a"));
        let asset = blobs.upload_dedup("p", &upload, Deadline::none()).await.unwrap();
        let data = blobs.download(&asset.s3_key, Deadline::none()).await.unwrap();
        assert_eq!(data, Bytes::from("a"));
    }

    #[tokio::test]
    async fn test_presign_rejects_empty_key() {
        let dir = TempDir::new().unwrap();
        let (_, blobs) = local_store(&dir);
        let err = blobs
            .presign_get("", Duration::from_secs(60), Deadline::none())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
