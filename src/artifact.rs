//! Artifact Directory: named files on a disk pointing at stored content.
//!
//! Each mutation pairs its artifact row change with exactly one ledger call
//! in the same transaction. Content is stored before the transaction opens
//! and orphaned objects are deleted after it commits, so no object-store
//! request runs while a transaction is held.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::blob::{file_extension, object_key, Asset, BlobStore, Upload};
use crate::cas::ContentHash;
use crate::db::entities::{artifact, disk};
use crate::db::{now, parse_id};
use crate::deadline::Deadline;
use crate::error::{Result, StoreError};
use crate::ledger::{Release, ReferenceLedger};
use crate::vfs::{child_directories, validate_filename, validate_path};

/// Meta key holding the system metadata of an artifact
pub const ARTIFACT_INFO_KEY: &str = "__artifact_info__";

/// Meta keys callers may not set
pub fn reserved_keys() -> &'static [&'static str] {
    &[ARTIFACT_INFO_KEY]
}

/// Object key prefix for content uploaded to a disk
pub fn disk_prefix(disk_id: Uuid) -> String {
    format!("disks/{}", disk_id)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Artifact {
    pub id: Uuid,
    pub disk_id: Uuid,
    pub path: String,
    pub filename: String,
    /// User metadata plus system metadata under [`ARTIFACT_INFO_KEY`]
    pub meta: Map<String, Value>,
    pub asset: Asset,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Artifact {
    pub fn system_meta(&self) -> Option<&Value> {
        self.meta.get(ARTIFACT_INFO_KEY)
    }

    pub fn user_meta(&self) -> Map<String, Value> {
        self.meta
            .iter()
            .filter(|(k, _)| !reserved_keys().contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl TryFrom<artifact::Model> for Artifact {
    type Error = StoreError;

    fn try_from(model: artifact::Model) -> Result<Self> {
        Ok(Self {
            id: parse_id(&model.id)?,
            disk_id: parse_id(&model.disk_id)?,
            path: model.path,
            filename: model.filename,
            meta: serde_json::from_str(&model.meta)?,
            asset: serde_json::from_str(&model.asset_meta)?,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

/// Changes applied by [`ArtifactDirectory::update_by_path`]
#[derive(Clone, Debug, Default)]
pub struct ArtifactUpdate {
    /// Replacement content
    pub content: Option<Upload>,
    /// Move to this directory path
    pub path: Option<String>,
    /// Rename to this filename
    pub filename: Option<String>,
}

/// Content released by deleting an artifact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Released {
    pub release: Release,
    /// The orphaned object is still stored; the reconcile sweep deletes it
    pub cleanup_pending: bool,
}

/// One directory level of a disk
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ArtifactListing {
    pub artifacts: Vec<Artifact>,
    /// Names of the directories directly below the listed path
    pub directories: Vec<String>,
}

fn system_meta(path: &str, filename: &str, mime: &str, size: i64) -> Value {
    json!({
        "path": path,
        "filename": filename,
        "mime": mime,
        "size": size,
    })
}

fn check_user_meta(meta: &Map<String, Value>) -> Result<()> {
    for key in reserved_keys() {
        if meta.contains_key(*key) {
            return Err(StoreError::InvalidArgument(format!("meta key {:?} is reserved", key)));
        }
    }
    Ok(())
}

fn conflict(path: &str, filename: &str) -> String {
    format!("artifact '{}' already exists in path '{}'", filename, path)
}

pub struct ArtifactDirectory {
    db: Arc<DatabaseConnection>,
    blobs: Arc<BlobStore>,
    ledger: Arc<ReferenceLedger>,
    presign_ttl: Duration,
}

impl ArtifactDirectory {
    pub fn new(
        db: Arc<DatabaseConnection>,
        blobs: Arc<BlobStore>,
        ledger: Arc<ReferenceLedger>,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            db,
            blobs,
            ledger,
            presign_ttl,
        }
    }

    /// Fail with `NotFound` unless `disk_id` belongs to `project_id`
    async fn check_disk(&self, project_id: Uuid, disk_id: Uuid) -> Result<()> {
        if project_id.is_nil() {
            return Err(StoreError::InvalidArgument("project id is empty".into()));
        }
        let found = disk::Entity::find_by_id(disk_id.to_string())
            .filter(disk::Column::ProjectId.eq(project_id.to_string()))
            .one(self.db.as_ref())
            .await?;
        match found {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("disk {}", disk_id))),
        }
    }

    async fn exists<C: ConnectionTrait>(
        conn: &C,
        disk_id: Uuid,
        path: &str,
        filename: &str,
        exclude: Option<Uuid>,
    ) -> Result<bool> {
        let mut query = artifact::Entity::find()
            .filter(artifact::Column::DiskId.eq(disk_id.to_string()))
            .filter(artifact::Column::Path.eq(path))
            .filter(artifact::Column::Filename.eq(filename));
        if let Some(id) = exclude {
            query = query.filter(artifact::Column::Id.ne(id.to_string()));
        }
        Ok(query.count(conn).await? > 0)
    }

    /// Reuse content the project already references, else store it under the disk
    async fn resolve_asset(
        &self,
        project_id: Uuid,
        disk_id: Uuid,
        upload: &Upload,
        deadline: Deadline,
    ) -> Result<Asset> {
        if let Some(mut asset) = self.ledger.lookup_live(project_id, &upload.hash.to_hex()).await? {
            tracing::debug!("Reusing {} for project {}", asset.s3_key, project_id);
            asset.mime = upload.mime.clone();
            return Ok(asset);
        }
        self.blobs
            .upload_dedup(&disk_prefix(disk_id), upload, deadline)
            .await
    }

    /// Delete objects orphaned by a committed change. The artifact change
    /// stands either way; failures leave tombstones for the sweep.
    /// Returns false when cleanup was deferred.
    async fn reap_after_commit(&self, release: &Release, deadline: Deadline) -> bool {
        match self.ledger.reap(std::slice::from_ref(release), deadline).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(
                    "Deferred cleanup of {} to the reconcile sweep: {}",
                    release.sha256(),
                    e
                );
                false
            }
        }
    }

    /// Make sure content whose ledger entry was just created or revived is
    /// actually stored; a concurrent reap may have removed it
    async fn settle_content(&self, asset: &Asset, upload: &Upload, count: i64, deadline: Deadline) -> Result<()> {
        if count == 1 {
            self.blobs.restore_missing(asset, upload, deadline).await?;
        }
        Ok(())
    }

    /// Store `upload` as `path` + `filename` on the disk with `user_meta`
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        project_id: Uuid,
        disk_id: Uuid,
        path: &str,
        filename: &str,
        upload: &Upload,
        user_meta: Map<String, Value>,
        deadline: Deadline,
    ) -> Result<Artifact> {
        validate_path(path)?;
        validate_filename(filename)?;
        check_user_meta(&user_meta)?;
        self.check_disk(project_id, disk_id).await?;

        if Self::exists(self.db.as_ref(), disk_id, path, filename, None).await? {
            return Err(StoreError::Conflict(conflict(path, filename)));
        }

        let asset = self.resolve_asset(project_id, disk_id, upload, deadline).await?;

        let mut meta = user_meta;
        meta.insert(
            ARTIFACT_INFO_KEY.to_string(),
            system_meta(path, filename, &upload.mime, upload.size()),
        );
        let ts = now();
        let row = artifact::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            disk_id: Set(disk_id.to_string()),
            path: Set(path.to_string()),
            filename: Set(filename.to_string()),
            sha256: Set(asset.sha256.clone()),
            meta: Set(Value::Object(meta).to_string()),
            asset_meta: Set(serde_json::to_string(&asset)?),
            created_at: Set(ts),
            updated_at: Set(ts),
        };

        let (created, count) = deadline
            .run("create artifact", async {
                let txn = self.db.begin().await?;
                let created = row
                    .insert(&txn)
                    .await
                    .map_err(|e| StoreError::from_db_conflict(e, || conflict(path, filename)))?;
                let count = self.ledger.increment_in(&txn, project_id, &asset, 1).await?;
                txn.commit().await?;
                Ok::<_, StoreError>((created, count))
            })
            .await?;
        self.settle_content(&asset, upload, count, deadline).await?;

        tracing::info!("Created artifact {}{} on disk {}", path, filename, disk_id);
        created.try_into()
    }

    pub async fn get_by_path(&self, disk_id: Uuid, path: &str, filename: &str) -> Result<Artifact> {
        if path.is_empty() || filename.is_empty() {
            return Err(StoreError::InvalidArgument("path and filename are required".into()));
        }
        artifact::Entity::find()
            .filter(artifact::Column::DiskId.eq(disk_id.to_string()))
            .filter(artifact::Column::Path.eq(path))
            .filter(artifact::Column::Filename.eq(filename))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("artifact {}{}", path, filename)))?
            .try_into()
    }

    pub async fn get_by_id(&self, disk_id: Uuid, artifact_id: Uuid) -> Result<Artifact> {
        artifact::Entity::find_by_id(artifact_id.to_string())
            .filter(artifact::Column::DiskId.eq(disk_id.to_string()))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("artifact {}", artifact_id)))?
            .try_into()
    }

    /// Replace content and/or move the artifact at `path` + `filename`.
    ///
    /// When the content hash changes, the new content gains a reference and
    /// the old one loses its reference in the same transaction as the row update.
    pub async fn update_by_path(
        &self,
        project_id: Uuid,
        disk_id: Uuid,
        path: &str,
        filename: &str,
        update: ArtifactUpdate,
        deadline: Deadline,
    ) -> Result<Artifact> {
        self.check_disk(project_id, disk_id).await?;
        let current = self.get_by_path(disk_id, path, filename).await?;

        let target_path = update
            .path
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| current.path.clone());
        let target_filename = update
            .filename
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| current.filename.clone());
        validate_path(&target_path)?;
        validate_filename(&target_filename)?;

        if Self::exists(self.db.as_ref(), disk_id, &target_path, &target_filename, Some(current.id)).await? {
            return Err(StoreError::Conflict(conflict(&target_path, &target_filename)));
        }

        let asset = match &update.content {
            Some(upload) => self.resolve_asset(project_id, disk_id, upload, deadline).await?,
            None => current.asset.clone(),
        };

        let mut meta = current.meta.clone();
        let info = match &update.content {
            Some(upload) => system_meta(&target_path, &target_filename, &upload.mime, upload.size()),
            None => {
                let mut info = current.system_meta().cloned().unwrap_or_else(|| {
                    system_meta(&target_path, &target_filename, &current.asset.mime, current.asset.size_b)
                });
                if let Some(fields) = info.as_object_mut() {
                    fields.insert("path".into(), json!(target_path));
                    fields.insert("filename".into(), json!(target_filename));
                }
                info
            }
        };
        meta.insert(ARTIFACT_INFO_KEY.to_string(), info);

        let changes = artifact::ActiveModel {
            path: Set(target_path.clone()),
            filename: Set(target_filename.clone()),
            sha256: Set(asset.sha256.clone()),
            meta: Set(Value::Object(meta).to_string()),
            asset_meta: Set(serde_json::to_string(&asset)?),
            updated_at: Set(now()),
            ..Default::default()
        };
        let hash_changed = asset.sha256 != current.asset.sha256;

        let (updated, release) = deadline
            .run("update artifact", async {
                let txn = self.db.begin().await?;
                // Guarded by the old hash so a concurrent update cannot
                // release the same reference twice
                let result = artifact::Entity::update_many()
                    .set(changes)
                    .filter(artifact::Column::Id.eq(current.id.to_string()))
                    .filter(artifact::Column::Sha256.eq(current.asset.sha256.clone()))
                    .exec(&txn)
                    .await
                    .map_err(|e| {
                        StoreError::from_db_conflict(e, || conflict(&target_path, &target_filename))
                    })?;
                if result.rows_affected == 0 {
                    return Err(StoreError::Transaction(DbErr::RecordNotUpdated));
                }

                let mut release = None;
                if hash_changed {
                    let count = self.ledger.increment_in(&txn, project_id, &asset, 1).await?;
                    let released = self
                        .ledger
                        .release_in(&txn, project_id, &current.asset.sha256, 1)
                        .await?;
                    release = Some((count, released));
                }

                let updated = artifact::Entity::find_by_id(current.id.to_string())
                    .one(&txn)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("artifact {}", current.id)))?;
                txn.commit().await?;
                Ok::<_, StoreError>((updated, release))
            })
            .await?;

        if let Some((count, release)) = release {
            if matches!(release, Release::Missing { .. }) {
                tracing::warn!(
                    "No live reference for replaced content {} in project {}",
                    release.sha256(),
                    project_id
                );
            }
            self.reap_after_commit(&release, deadline).await;
            if let Some(upload) = &update.content {
                self.settle_content(&asset, upload, count, deadline).await?;
            }
        }

        tracing::info!(
            "Updated artifact {}{} -> {}{} on disk {}",
            path,
            filename,
            target_path,
            target_filename,
            disk_id
        );
        updated.try_into()
    }

    /// Replace the user metadata, keeping the system metadata
    pub async fn update_meta_by_path(
        &self,
        project_id: Uuid,
        disk_id: Uuid,
        path: &str,
        filename: &str,
        user_meta: Map<String, Value>,
    ) -> Result<Artifact> {
        check_user_meta(&user_meta)?;
        self.check_disk(project_id, disk_id).await?;
        let current = self.get_by_path(disk_id, path, filename).await?;

        let mut meta = user_meta;
        if let Some(info) = current.system_meta() {
            meta.insert(ARTIFACT_INFO_KEY.to_string(), info.clone());
        }
        let changes = artifact::ActiveModel {
            id: Set(current.id.to_string()),
            meta: Set(Value::Object(meta).to_string()),
            updated_at: Set(now()),
            ..Default::default()
        };
        let updated = changes.update(self.db.as_ref()).await.map_err(|e| match e {
            DbErr::RecordNotUpdated => StoreError::NotFound(format!("artifact {}{}", path, filename)),
            other => StoreError::Transaction(other),
        })?;
        updated.try_into()
    }

    /// Delete the artifact at `path` + `filename` and release its content
    pub async fn delete_by_path(
        &self,
        project_id: Uuid,
        disk_id: Uuid,
        path: &str,
        filename: &str,
        deadline: Deadline,
    ) -> Result<Released> {
        self.check_disk(project_id, disk_id).await?;
        let current = self.get_by_path(disk_id, path, filename).await?;
        self.delete_artifact(project_id, current, deadline).await
    }

    pub async fn delete_by_id(
        &self,
        project_id: Uuid,
        disk_id: Uuid,
        artifact_id: Uuid,
        deadline: Deadline,
    ) -> Result<Released> {
        self.check_disk(project_id, disk_id).await?;
        let current = self.get_by_id(disk_id, artifact_id).await?;
        self.delete_artifact(project_id, current, deadline).await
    }

    async fn delete_artifact(&self, project_id: Uuid, current: Artifact, deadline: Deadline) -> Result<Released> {
        let release = deadline
            .run("delete artifact", async {
                let txn = self.db.begin().await?;
                let result = artifact::Entity::delete_many()
                    .filter(artifact::Column::Id.eq(current.id.to_string()))
                    .filter(artifact::Column::Sha256.eq(current.asset.sha256.clone()))
                    .exec(&txn)
                    .await?;
                if result.rows_affected == 0 {
                    return Err(StoreError::NotFound(format!(
                        "artifact {}{}",
                        current.path, current.filename
                    )));
                }
                let release = self
                    .ledger
                    .release_in(&txn, project_id, &current.asset.sha256, 1)
                    .await?;
                txn.commit().await?;
                Ok::<_, StoreError>(release)
            })
            .await?;

        if matches!(release, Release::Missing { .. }) {
            tracing::warn!(
                "No live reference for deleted content {} in project {}",
                release.sha256(),
                project_id
            );
        }
        let cleanup_pending = !self.reap_after_commit(&release, deadline).await;

        tracing::info!(
            "Deleted artifact {}{} on disk {}",
            current.path,
            current.filename,
            current.disk_id
        );
        Ok(Released {
            release,
            cleanup_pending,
        })
    }

    /// Artifacts stored directly at `path` plus the directories below it
    pub async fn list_by_path(&self, disk_id: Uuid, path: &str) -> Result<ArtifactListing> {
        let path = if path.is_empty() { "/" } else { path };
        validate_path(path)?;

        let artifacts = artifact::Entity::find()
            .filter(artifact::Column::DiskId.eq(disk_id.to_string()))
            .filter(artifact::Column::Path.eq(path))
            .order_by_asc(artifact::Column::Filename)
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(Artifact::try_from)
            .collect::<Result<Vec<_>>>()?;

        let paths = self.get_all_paths(disk_id).await?;
        let directories = child_directories(path, paths.iter().map(String::as_str));
        Ok(ArtifactListing {
            artifacts,
            directories,
        })
    }

    /// Distinct directory paths in use on the disk, sorted
    pub async fn get_all_paths(&self, disk_id: Uuid) -> Result<Vec<String>> {
        let paths: Vec<String> = artifact::Entity::find()
            .select_only()
            .column(artifact::Column::Path)
            .distinct()
            .filter(artifact::Column::DiskId.eq(disk_id.to_string()))
            .order_by_asc(artifact::Column::Path)
            .into_tuple()
            .all(self.db.as_ref())
            .await?;
        Ok(paths)
    }

    pub async fn list_by_disk(&self, disk_id: Uuid) -> Result<Vec<Artifact>> {
        artifact::Entity::find()
            .filter(artifact::Column::DiskId.eq(disk_id.to_string()))
            .order_by_asc(artifact::Column::Path)
            .order_by_asc(artifact::Column::Filename)
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(Artifact::try_from)
            .collect()
    }

    /// Bytes of the artifact at `path` + `filename`
    pub async fn content(&self, disk_id: Uuid, path: &str, filename: &str, deadline: Deadline) -> Result<Bytes> {
        let artifact = self.get_by_path(disk_id, path, filename).await?;
        self.blobs.download(&artifact.asset.s3_key, deadline).await
    }

    /// Time-limited download URL; `ttl` defaults to the configured expiry
    pub async fn presigned_url(&self, artifact: &Artifact, ttl: Option<Duration>, deadline: Deadline) -> Result<String> {
        if artifact.asset.s3_key.is_empty() {
            return Err(StoreError::NotFound(format!("artifact {} has no stored object", artifact.id)));
        }
        self.blobs
            .presign_get(&artifact.asset.s3_key, ttl.unwrap_or(self.presign_ttl), deadline)
            .await
    }

    /// Time-limited upload URL for content with `hash`, returned with the
    /// object key the content must land at
    pub async fn presigned_put_url(
        &self,
        disk_id: Uuid,
        hash: &ContentHash,
        filename: &str,
        content_type: &str,
        ttl: Option<Duration>,
        deadline: Deadline,
    ) -> Result<(String, String)> {
        validate_filename(filename)?;
        let key = object_key(&disk_prefix(disk_id), Utc::now(), hash, &file_extension(filename));
        let url = self
            .blobs
            .presign_put(&key, content_type, ttl.unwrap_or(self.presign_ttl), deadline)
            .await?;
        Ok((key, url))
    }
}
