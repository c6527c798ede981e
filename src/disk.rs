//! Disk Lifecycle Manager: project-scoped artifact namespaces.

use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::Serialize;
use uuid::Uuid;

use crate::blob::Asset;
use crate::db::entities::{artifact, disk};
use crate::db::{now, parse_id};
use crate::deadline::Deadline;
use crate::error::{Result, StoreError};
use crate::ledger::ReferenceLedger;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Disk {
    pub id: Uuid,
    pub project_id: Uuid,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<disk::Model> for Disk {
    type Error = StoreError;

    fn try_from(model: disk::Model) -> Result<Self> {
        Ok(Self {
            id: parse_id(&model.id)?,
            project_id: parse_id(&model.project_id)?,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

/// Outcome of [`DiskManager::delete`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskDeletion {
    pub artifacts_removed: usize,
    /// Journaled releases or orphaned objects are left for the reconcile sweep
    pub cleanup_pending: bool,
}

pub struct DiskManager {
    db: Arc<DatabaseConnection>,
    ledger: Arc<ReferenceLedger>,
}

impl DiskManager {
    pub fn new(db: Arc<DatabaseConnection>, ledger: Arc<ReferenceLedger>) -> Self {
        Self { db, ledger }
    }

    pub async fn create(&self, project_id: Uuid) -> Result<Disk> {
        if project_id.is_nil() {
            return Err(StoreError::InvalidArgument("project id is empty".into()));
        }
        let ts = now();
        let created = disk::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            project_id: Set(project_id.to_string()),
            created_at: Set(ts),
            updated_at: Set(ts),
        }
        .insert(self.db.as_ref())
        .await?;

        tracing::info!("Created disk {} for project {}", created.id, project_id);
        created.try_into()
    }

    pub async fn get(&self, project_id: Uuid, disk_id: Uuid) -> Result<Disk> {
        disk::Entity::find_by_id(disk_id.to_string())
            .filter(disk::Column::ProjectId.eq(project_id.to_string()))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("disk {}", disk_id)))?
            .try_into()
    }

    /// Disks of a project, newest first
    pub async fn list(&self, project_id: Uuid) -> Result<Vec<Disk>> {
        disk::Entity::find()
            .filter(disk::Column::ProjectId.eq(project_id.to_string()))
            .order_by_desc(disk::Column::CreatedAt)
            .order_by_asc(disk::Column::Id)
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(Disk::try_from)
            .collect()
    }

    /// Delete a disk and all of its artifacts.
    ///
    /// The disk, its artifact rows and one journaled release per distinct
    /// content hash commit together. The journal is drained right after
    /// commit; if that fails the reconcile sweep drains it later and the
    /// result says so.
    pub async fn delete(&self, project_id: Uuid, disk_id: Uuid, deadline: Deadline) -> Result<DiskDeletion> {
        if project_id.is_nil() {
            return Err(StoreError::InvalidArgument("project id is empty".into()));
        }

        let removed = deadline
            .run("delete disk", async {
                let txn = self.db.begin().await?;

                let owned = disk::Entity::find_by_id(disk_id.to_string())
                    .filter(disk::Column::ProjectId.eq(project_id.to_string()))
                    .one(&txn)
                    .await?;
                if owned.is_none() {
                    return Err(StoreError::NotFound(format!("disk {}", disk_id)));
                }

                let assets = artifact::Entity::find()
                    .filter(artifact::Column::DiskId.eq(disk_id.to_string()))
                    .all(&txn)
                    .await?
                    .iter()
                    .map(|a| serde_json::from_str::<Asset>(&a.asset_meta))
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                self.ledger
                    .schedule_releases_in(&txn, project_id, disk_id, &assets)
                    .await?;
                artifact::Entity::delete_many()
                    .filter(artifact::Column::DiskId.eq(disk_id.to_string()))
                    .exec(&txn)
                    .await?;
                disk::Entity::delete_by_id(disk_id.to_string())
                    .exec(&txn)
                    .await?;

                txn.commit().await?;
                Ok::<_, StoreError>(assets.len())
            })
            .await?;

        tracing::info!(
            "Deleted disk {} of project {} with {} artifacts",
            disk_id,
            project_id,
            removed
        );

        let cleanup_pending = match self
            .ledger
            .apply_releases(project_id, Some(disk_id), deadline)
            .await
        {
            Ok(_) => false,
            Err(e) => {
                tracing::error!(
                    "Ledger cleanup for disk {} deferred to the reconcile sweep: {}",
                    disk_id,
                    e
                );
                true
            }
        };
        Ok(DiskDeletion {
            artifacts_removed: removed,
            cleanup_pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::Upload;
    use crate::error::ErrorKind;
    use crate::testutil::Harness;
    use bytes::Bytes;
    use serde_json::Map;

    async fn fill(h: &Harness, project: Uuid, disk: Uuid, names: &[&str], data: &'static str) -> Vec<Asset> {
        let mut assets = Vec::new();
        for name in names {
            let upload = Upload::new(name, "text/plain", Bytes::from(data));
            let artifact = h
                .artifacts
                .create(project, disk, "/", name, &upload, Map::new(), Deadline::none())
                .await
                .unwrap();
            assets.push(artifact.asset);
        }
        assets
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let h = Harness::new().await;
        let project = Uuid::new_v4();
        let first = h.disks.create(project).await.unwrap();
        let second = h.disks.create(project).await.unwrap();
        h.disks.create(Uuid::new_v4()).await.unwrap();

        assert_eq!(h.disks.get(project, first.id).await.unwrap(), first);
        let err = h.disks.get(Uuid::new_v4(), first.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let listed = h.disks.list(project).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&first) && listed.contains(&second));
        assert!(listed[0].created_at >= listed[1].created_at);
        assert_eq!(h.disks.list(project).await.unwrap(), listed);

        let err = h.disks.create(Uuid::nil()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_delete_releases_shared_hash_in_one_step() {
        let h = Harness::new().await;
        let project = Uuid::new_v4();
        let doomed = h.disks.create(project).await.unwrap();
        let kept = h.disks.create(project).await.unwrap();

        let assets = fill(&h, project, doomed.id, &["a.txt", "b.txt", "c.txt"], "shared body").await;
        fill(&h, project, kept.id, &["keep.txt"], "shared body").await;
        let hash = assets[0].sha256.clone();
        assert_eq!(h.ledger.get(project, &hash).await.unwrap().unwrap().ref_count, 4);

        let deletion = h.disks.delete(project, doomed.id, Deadline::none()).await.unwrap();
        assert_eq!(deletion.artifacts_removed, 3);
        assert!(!deletion.cleanup_pending);
        assert_eq!(h.ledger.get(project, &hash).await.unwrap().unwrap().ref_count, 1);
        assert!(h.artifacts.list_by_disk(doomed.id).await.unwrap().is_empty());
        assert!(h.object_exists(&assets[0].s3_key).await);
        assert_eq!(h.pending_releases().await, 0);

        let report = h.ledger.reconcile(Deadline::none()).await.unwrap();
        assert!(report.drift.is_empty());
    }

    #[tokio::test]
    async fn test_delete_last_disk_removes_objects() {
        let h = Harness::new().await;
        let project = Uuid::new_v4();
        let disk = h.disks.create(project).await.unwrap();
        let shared = fill(&h, project, disk.id, &["a.txt", "b.txt", "c.txt"], "one").await;
        let single = fill(&h, project, disk.id, &["d.txt"], "two").await;

        h.disks.delete(project, disk.id, Deadline::none()).await.unwrap();

        assert!(h.ledger.list(project).await.unwrap().is_empty());
        assert!(!h.object_exists(&shared[0].s3_key).await);
        assert!(!h.object_exists(&single[0].s3_key).await);
        assert_eq!(h.object_count().await, 0);
        assert!(h.disks.list(project).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_object_delete_leaves_cleanup_to_sweep() {
        let h = Harness::new().await;
        let project = Uuid::new_v4();
        let disk = h.disks.create(project).await.unwrap();
        let assets = fill(&h, project, disk.id, &["a.txt", "b.txt"], "held").await;
        let hash = assets[0].sha256.clone();

        h.backend.fail_deletes(true);
        let deletion = h.disks.delete(project, disk.id, Deadline::none()).await.unwrap();
        assert_eq!(deletion.artifacts_removed, 2);
        assert!(deletion.cleanup_pending);
        assert_eq!(h.pending_releases().await, 0);
        assert_eq!(h.raw_ref_count(project, &hash).await, Some(0));
        assert!(h.object_exists(&assets[0].s3_key).await);

        h.backend.fail_deletes(false);
        let report = h.ledger.reconcile(Deadline::none()).await.unwrap();
        assert_eq!(report.orphans_reaped, 1);
        assert_eq!(h.raw_ref_count(project, &hash).await, None);
        assert_eq!(h.object_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_checks_ownership() {
        let h = Harness::new().await;
        let project = Uuid::new_v4();
        let disk = h.disks.create(project).await.unwrap();
        fill(&h, project, disk.id, &["a.txt"], "mine").await;

        let err = h
            .disks
            .delete(Uuid::new_v4(), disk.id, Deadline::none())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(h.artifacts.list_by_disk(disk.id).await.unwrap().len(), 1);
    }
}
