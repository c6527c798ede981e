//! Storage configuration.

use std::path::PathBuf;
use std::sync::Arc;

use super::{LocalStorage, S3Config, S3Storage, StorageBackend, StorageError};

/// Storage backend type
#[derive(Debug, Clone)]
pub enum StorageType {
    /// Local filesystem storage
    Local {
        path: PathBuf,
        public_url: Option<String>,
    },
    /// S3-compatible storage (AWS S3, MinIO, R2, etc.)
    S3(S3Config),
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Storage backend type
    pub storage_type: StorageType,
}

impl StorageConfig {
    /// Read the backend selection from the process environment
    pub fn from_env(data_dir: &std::path::Path) -> Result<Self, String> {
        Self::from_lookup(data_dir, |key| std::env::var(key).ok())
    }

    /// Read the backend selection through `lookup`, so tests can supply a map
    pub fn from_lookup<F>(data_dir: &std::path::Path, lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        match get("ACONTEXT_STORAGE").as_deref().unwrap_or("local") {
            "local" => Ok(Self {
                storage_type: StorageType::Local {
                    path: data_dir.to_path_buf(),
                    public_url: get("ACONTEXT_LOCAL_PUBLIC_URL"),
                },
            }),
            "s3" => {
                let bucket = get("S3_BUCKET").ok_or("S3_BUCKET is required for s3 storage")?;
                let mut config = S3Config::aws(
                    bucket,
                    get("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                );
                config.endpoint = get("S3_ENDPOINT");
                config.internal_endpoint = get("S3_INTERNAL_ENDPOINT");
                config.force_path_style = get("S3_USE_PATH_STYLE")
                    .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                    .unwrap_or(false);
                config.access_key = get("S3_ACCESS_KEY");
                config.secret_key = get("S3_SECRET_KEY");
                config.sse = get("S3_SSE");
                Ok(Self {
                    storage_type: StorageType::S3(config),
                })
            }
            other => Err(format!("unknown ACONTEXT_STORAGE backend: {}", other)),
        }
    }

    /// Build a storage backend from this config (supports all backends)
    pub async fn build(&self) -> Result<Arc<dyn StorageBackend>, StorageError> {
        match &self.storage_type {
            StorageType::Local { path, public_url } => {
                tokio::fs::create_dir_all(path).await?;
                let mut storage = LocalStorage::new(path.clone());
                if let Some(url) = public_url {
                    storage = storage.with_public_url(url.clone());
                }
                Ok(Arc::new(storage))
            }
            StorageType::S3(config) => {
                let storage = S3Storage::new(config.clone()).await;
                storage.check_bucket().await?;
                Ok(Arc::new(storage))
            }
        }
    }
}
