//! Storage backend trait definition.
//!
//! Abstracts the object-store protocol the blob layer needs: PUT/GET/HEAD,
//! paginated LIST, single and batched DELETE, and presigned GET/PUT URLs.
//! Keys are full slash-separated object keys such as
//! `disks/{disk_id}/2025/01/31/{sha256}.pdf`.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Storage error types
#[derive(Debug)]
pub enum StorageError {
    /// Object not found
    NotFound(String),
    /// IO error
    Io(std::io::Error),
    /// Request to the object store failed (network, auth, throttling)
    Request(String),
    /// Presigned URL could not be produced
    Presign(String),
    /// Key is empty or escapes the store root
    InvalidKey(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(key) => write!(f, "Object not found: {}", key),
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Request(msg) => write!(f, "Request failed: {}", msg),
            StorageError::Presign(msg) => write!(f, "Presign failed: {}", msg),
            StorageError::InvalidKey(key) => write!(f, "Invalid object key: {:?}", key),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(e.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Upload parameters beyond the key and body.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    pub content_type: String,
    /// User-defined object metadata (`x-amz-meta-*` on S3).
    pub metadata: HashMap<String, String>,
}

/// What a HEAD (or a completed PUT) reports about an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHead {
    pub key: String,
    pub size: u64,
    /// Integrity tag, quotes stripped.
    pub etag: String,
}

/// One page of a prefix listing.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Token for the next page, `None` when the listing is complete.
    pub next: Option<String>,
}

/// Storage backend trait for pluggable object stores.
///
/// Direct operations may go to an internal endpoint while presigned URLs are
/// always issued against the publicly reachable one.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the bucket (or root directory) objects live in.
    fn location(&self) -> &str;

    /// Get an object's bytes
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object, returning its head as stored
    async fn put(&self, key: &str, data: Bytes, options: PutOptions) -> StorageResult<ObjectHead>;

    /// Fetch size and integrity tag without the body
    async fn head(&self, key: &str) -> StorageResult<ObjectHead>;

    /// List one page of keys under `prefix`
    async fn list(&self, prefix: &str, continuation: Option<String>) -> StorageResult<ListPage>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Delete up to [`MAX_BATCH_DELETE`] keys in one request. Missing keys are ignored.
    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()>;

    /// Time-bounded GET URL
    async fn presign_get(&self, key: &str, ttl: Duration) -> StorageResult<String>;

    /// Time-bounded PUT URL for direct client uploads
    async fn presign_put(&self, key: &str, content_type: &str, ttl: Duration) -> StorageResult<String>;
}

/// S3 caps DeleteObjects at 1000 keys per request.
pub const MAX_BATCH_DELETE: usize = 1000;

/// Strip the surrounding quotes S3 puts on ETags.
pub fn clean_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}
