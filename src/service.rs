//! Wiring of the storage components over one database and one object store.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;

use crate::artifact::ArtifactDirectory;
use crate::blob::BlobStore;
use crate::config::AppConfig;
use crate::db;
use crate::disk::DiskManager;
use crate::ledger::ReferenceLedger;
use crate::storage::StorageBackend;

/// Shared handles used by consumers of the storage core
pub struct StorageCore {
    pub db: Arc<DatabaseConnection>,
    pub blobs: Arc<BlobStore>,
    pub ledger: Arc<ReferenceLedger>,
    pub artifacts: ArtifactDirectory,
    pub disks: DiskManager,
}

impl StorageCore {
    /// Connect the database and object store named by `config`
    pub async fn open(config: &AppConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let db = db::connect(&config.database_url, None).await?;
        let backend = config.storage.build().await?;
        tracing::info!("Object store ready at {}", backend.location());
        Ok(Self::new(Arc::new(db), backend, config.presign_ttl))
    }

    pub fn new(db: Arc<DatabaseConnection>, backend: Arc<dyn StorageBackend>, presign_ttl: Duration) -> Self {
        let blobs = Arc::new(BlobStore::new(backend));
        let ledger = Arc::new(ReferenceLedger::new(db.clone(), blobs.clone()));
        let artifacts = ArtifactDirectory::new(db.clone(), blobs.clone(), ledger.clone(), presign_ttl);
        let disks = DiskManager::new(db.clone(), ledger.clone());
        Self {
            db,
            blobs,
            ledger,
            artifacts,
            disks,
        }
    }
}
