//! S3-compatible storage backend.
//!
//! Direct operations go through a client bound to the internal endpoint;
//! presigned URLs come from a second client bound to the public endpoint so
//! that links handed to users resolve from outside the cluster.
//! Compatible with AWS S3, MinIO, R2, etc.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Builder, Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier, ServerSideEncryption},
    Client,
};
use bytes::Bytes;
use std::time::Duration;

use super::backend::{
    clean_etag, ListPage, ObjectHead, PutOptions, StorageBackend, StorageError, StorageResult,
    MAX_BATCH_DELETE,
};

/// S3 storage backend configuration
#[derive(Clone, Debug)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Publicly reachable endpoint, used for presigned URLs
    pub endpoint: Option<String>,
    /// Endpoint for direct operations; falls back to `endpoint`
    pub internal_endpoint: Option<String>,
    /// Force path-style URLs (required for MinIO)
    pub force_path_style: bool,
    /// Static credentials; the default AWS provider chain is used otherwise
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Server-side encryption mode, e.g. `AES256` or `aws:kms`
    pub sse: Option<String>,
}

impl S3Config {
    /// Create config for AWS S3
    pub fn aws(bucket: String, region: String) -> Self {
        Self {
            bucket,
            region,
            endpoint: None,
            internal_endpoint: None,
            force_path_style: false,
            access_key: None,
            secret_key: None,
            sse: None,
        }
    }

    /// Endpoint for direct operations, normalized
    pub fn internal_url(&self) -> Option<String> {
        self.internal_endpoint
            .as_deref()
            .and_then(normalize_endpoint)
            .or_else(|| self.public_url())
    }

    /// Endpoint presigned URLs are issued against, normalized
    pub fn public_url(&self) -> Option<String> {
        self.endpoint.as_deref().and_then(normalize_endpoint)
    }
}

/// Trim whitespace and default to https when no scheme is given.
pub fn normalize_endpoint(endpoint: &str) -> Option<String> {
    let ep = endpoint.trim();
    if ep.is_empty() {
        return None;
    }
    if ep.starts_with("http://") || ep.starts_with("https://") {
        Some(ep.to_string())
    } else {
        Some(format!("https://{}", ep))
    }
}

/// S3-compatible storage backend
pub struct S3Storage {
    client: Client,
    presigner: Client,
    bucket: String,
    sse: Option<ServerSideEncryption>,
}

impl S3Storage {
    /// Create a new S3 storage backend from config
    pub async fn new(config: S3Config) -> Self {
        let credentials = match (&config.access_key, &config.secret_key) {
            (Some(access), Some(secret)) if !access.is_empty() && !secret.is_empty() => {
                Some(Credentials::new(access, secret, None, None, "static"))
            }
            _ => None,
        };

        // Load credentials from environment or use defaults
        let sdk_config = aws_config::load_from_env().await;

        let build = |endpoint: Option<String>| {
            let mut builder = Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .force_path_style(config.force_path_style);
            if let Some(endpoint) = endpoint {
                builder = builder.endpoint_url(endpoint);
            }
            if let Some(creds) = credentials.clone() {
                builder = builder.credentials_provider(creds);
            } else if let Some(creds) = sdk_config.credentials_provider() {
                builder = builder.credentials_provider(creds);
            }
            Client::from_conf(builder.build())
        };

        Self {
            client: build(config.internal_url()),
            presigner: build(config.public_url()),
            bucket: config.bucket.clone(),
            sse: config.sse.as_deref().map(ServerSideEncryption::from),
        }
    }

    /// Verify the bucket exists and is reachable
    pub async fn check_bucket(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify(&self.bucket, e))?;
        Ok(())
    }

    fn presigning(ttl: Duration) -> StorageResult<PresigningConfig> {
        PresigningConfig::expires_in(ttl).map_err(|e| StorageError::Presign(e.to_string()))
    }
}

/// Map an SDK error onto our storage error, recognising missing keys.
fn classify<E>(key: &str, err: SdkError<E>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match err.code() {
        Some("NoSuchKey") | Some("NotFound") | Some("NoSuchBucket") => {
            StorageError::NotFound(key.to_string())
        }
        _ => StorageError::Request(format!("{}: {}", key, DisplayErrorContext(&err))),
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn location(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        let data = result
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        Ok(data.into_bytes())
    }

    async fn put(&self, key: &str, data: Bytes, options: PutOptions) -> StorageResult<ObjectHead> {
        let size = data.len() as u64;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(options.content_type)
            .set_metadata(Some(options.metadata))
            .body(ByteStream::from(data));
        if let Some(sse) = &self.sse {
            request = request.server_side_encryption(sse.clone());
        }

        let output = request.send().await.map_err(|e| classify(key, e))?;

        Ok(ObjectHead {
            key: key.to_string(),
            size,
            etag: output.e_tag().map(clean_etag).unwrap_or_default(),
        })
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectHead> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        Ok(ObjectHead {
            key: key.to_string(),
            size: result.content_length().unwrap_or(0).max(0) as u64,
            etag: result.e_tag().map(clean_etag).unwrap_or_default(),
        })
    }

    async fn list(&self, prefix: &str, continuation: Option<String>) -> StorageResult<ListPage> {
        let result = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| classify(prefix, e))?;

        let keys = result
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(str::to_string))
            .collect();

        let next = if result.is_truncated().unwrap_or(false) {
            result.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage { keys, next })
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        if keys.len() > MAX_BATCH_DELETE {
            return Err(StorageError::Request(format!(
                "batch of {} keys exceeds the {} key limit",
                keys.len(),
                MAX_BATCH_DELETE
            )));
        }

        let objects = keys
            .iter()
            .filter(|k| !k.is_empty())
            .map(|k| {
                ObjectIdentifier::builder()
                    .key(k)
                    .build()
                    .map_err(|e| StorageError::InvalidKey(e.to_string()))
            })
            .collect::<StorageResult<Vec<_>>>()?;
        if objects.is_empty() {
            return Ok(());
        }

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true) // Don't return deleted objects in response
            .build()
            .map_err(|e| StorageError::Request(e.to_string()))?;

        let output = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| classify("batch", e))?;

        // Per-key failures come back in the body, not as a request error
        if let Some(failed) = output.errors().first() {
            return Err(StorageError::Request(format!(
                "{}: {}",
                failed.key().unwrap_or_default(),
                failed.message().unwrap_or("delete failed")
            )));
        }

        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(String::new()));
        }
        let request = self
            .presigner
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(Self::presigning(ttl)?)
            .await
            .map_err(|e| StorageError::Presign(DisplayErrorContext(&e).to_string()))?;
        Ok(request.uri().to_string())
    }

    async fn presign_put(&self, key: &str, content_type: &str, ttl: Duration) -> StorageResult<String> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(String::new()));
        }
        let mut request = self
            .presigner
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type);
        if let Some(sse) = &self.sse {
            request = request.server_side_encryption(sse.clone());
        }
        let request = request
            .presigned(Self::presigning(ttl)?)
            .await
            .map_err(|e| StorageError::Presign(DisplayErrorContext(&e).to_string()))?;
        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("  "), None);
        assert_eq!(
            normalize_endpoint("minio:9000").as_deref(),
            Some("https://minio:9000")
        );
        assert_eq!(
            normalize_endpoint("http://minio:9000").as_deref(),
            Some("http://minio:9000")
        );
    }

    #[test]
    fn test_internal_endpoint_falls_back_to_public() {
        let mut config = S3Config::aws("bucket".into(), "us-east-1".into());
        config.endpoint = Some("files.example.test".into());
        assert_eq!(config.internal_url().as_deref(), Some("https://files.example.test"));

        config.internal_endpoint = Some("http://minio:9000".into());
        assert_eq!(config.internal_url().as_deref(), Some("http://minio:9000"));
        assert_eq!(config.public_url().as_deref(), Some("https://files.example.test"));
    }
}
