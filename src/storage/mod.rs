//! Storage backend abstraction.
//!
//! Provides a pluggable object-store layer that can be backed by:
//! - Local filesystem (default, also used by tests)
//! - S3-compatible object storage (AWS S3, MinIO, R2, etc.)

mod backend;
mod config;
mod local;
mod s3;

pub use backend::{
    clean_etag, ListPage, ObjectHead, PutOptions, StorageBackend, StorageError, StorageResult,
    MAX_BATCH_DELETE,
};
pub use config::{StorageConfig, StorageType};
pub use local::LocalStorage;
pub use s3::{normalize_endpoint, S3Config, S3Storage};
