//! Reference Ledger: per-project count of live references to each content hash.
//!
//! The ledger is the only component allowed to decide that an object may be
//! deleted. Every count change is a single SQL statement evaluated by the
//! database, so concurrent increments and decrements on the same
//! `(project_id, sha256)` key never lose an update.
//!
//! Decrements run in two phases:
//! - [`ReferenceLedger::release_in`] lowers the count inside the caller's
//!   metadata transaction. A count that reaches zero leaves a tombstone row.
//! - [`ReferenceLedger::reap`] runs after commit: it claims the tombstone,
//!   deletes the backing object, then deletes the tombstone. A claimed
//!   tombstone cannot be revived by an increment. A failed object delete
//!   keeps the tombstone so [`ReferenceLedger::reconcile`] retries it later.
//!
//! Disk deletion records its decrements in the `asset_reference_releases`
//! journal inside the transaction that removes the disk, and drains that
//! journal after commit with [`ReferenceLedger::apply_releases`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set, Statement, TransactionTrait,
};
use uuid::Uuid;

use crate::blob::{Asset, BlobStore};
use crate::cas::ContentHash;
use crate::db::entities::{asset_reference, asset_reference_release};
use crate::db::{now, parse_id};
use crate::deadline::Deadline;
use crate::error::{Result, StoreError};

/// A live ledger row
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    pub project_id: Uuid,
    pub sha256: String,
    /// Canonical object key; the first one recorded for the hash
    pub object_key: String,
    pub ref_count: i64,
    pub asset: Asset,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_referenced_at: i64,
}

impl TryFrom<asset_reference::Model> for LedgerEntry {
    type Error = StoreError;

    fn try_from(model: asset_reference::Model) -> Result<Self> {
        let mut asset: Asset = serde_json::from_str(&model.asset_meta)?;
        // The descriptor is refreshed on every increment but the key is not
        asset.s3_key = model.object_key.clone();
        Ok(Self {
            project_id: parse_id(&model.project_id)?,
            sha256: model.sha256,
            object_key: model.object_key,
            ref_count: model.ref_count,
            asset,
            created_at: model.created_at,
            updated_at: model.updated_at,
            last_referenced_at: model.last_referenced_at,
        })
    }
}

/// Outcome of lowering a reference count
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Release {
    /// References remain; the object stays
    Retained { sha256: String, remaining: i64 },
    /// The count reached zero; the object is due for deletion by [`ReferenceLedger::reap`]
    Orphaned { project_id: Uuid, sha256: String },
    /// No live entry existed; nothing changed
    Missing { sha256: String },
}

impl Release {
    pub fn sha256(&self) -> &str {
        match self {
            Release::Retained { sha256, .. }
            | Release::Orphaned { sha256, .. }
            | Release::Missing { sha256 } => sha256,
        }
    }

    pub fn is_orphaned(&self) -> bool {
        matches!(self, Release::Orphaned { .. })
    }
}

/// Ledger count that disagrees with the artifacts referencing the hash
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Drift {
    pub project_id: String,
    pub sha256: String,
    pub ledger_count: i64,
    pub artifact_count: i64,
}

/// Result of one reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// References released from leftover journal rows
    pub releases_applied: i64,
    /// Tombstones whose object and row were removed
    pub orphans_reaped: usize,
    pub drift: Vec<Drift>,
}

/// Group assets by content hash, counting how often each occurs.
/// The last descriptor seen for a hash wins.
pub fn group_by_hash(assets: &[Asset]) -> BTreeMap<String, (Asset, i64)> {
    let mut groups: BTreeMap<String, (Asset, i64)> = BTreeMap::new();
    for asset in assets {
        let entry = groups
            .entry(asset.sha256.clone())
            .or_insert_with(|| (asset.clone(), 0));
        entry.0 = asset.clone();
        entry.1 += 1;
    }
    groups
}

fn check_project(project_id: Uuid) -> Result<()> {
    if project_id.is_nil() {
        return Err(StoreError::InvalidArgument("project id is empty".into()));
    }
    Ok(())
}

fn check_hash(sha256: &str) -> Result<()> {
    if sha256.is_empty() {
        return Err(StoreError::InvalidArgument("content hash is empty".into()));
    }
    sha256
        .parse::<ContentHash>()
        .map(|_| ())
        .map_err(StoreError::InvalidArgument)
}

/// Seconds a reap claim holds when the caller gives no deadline
const REAP_LEASE_SECS: i64 = 300;

fn reap_lease(deadline: Deadline) -> i64 {
    deadline
        .remaining()
        .map_or(REAP_LEASE_SECS, |left| left.as_secs() as i64 + 1)
}

/// A tombstone claimed for deletion
struct Claim {
    project_id: String,
    sha256: String,
    object_key: String,
}

pub struct ReferenceLedger {
    db: Arc<DatabaseConnection>,
    blobs: Arc<BlobStore>,
}

impl ReferenceLedger {
    pub fn new(db: Arc<DatabaseConnection>, blobs: Arc<BlobStore>) -> Self {
        Self { db, blobs }
    }

    /// Record one more reference to `asset` in `project_id`
    pub async fn increment(&self, project_id: Uuid, asset: &Asset) -> Result<()> {
        self.increment_in(self.db.as_ref(), project_id, asset, 1)
            .await
            .map(|_| ())
    }

    /// Record `count` references to `asset` on `conn`, usually an open transaction.
    ///
    /// Inserts the row when absent. Otherwise adds to the count in the same
    /// statement, refreshes the descriptor and `last_referenced_at`, and keeps
    /// the canonical object key unless the row was a tombstone. A tombstone
    /// under a live reap claim is left alone and the call fails with a
    /// retryable `Transaction` error.
    ///
    /// Returns the count after the increment; a result equal to `count` means
    /// the entry was created or revived.
    pub async fn increment_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        project_id: Uuid,
        asset: &Asset,
        count: i64,
    ) -> Result<i64> {
        check_project(project_id)?;
        check_hash(&asset.sha256)?;
        if count <= 0 {
            return Err(StoreError::InvalidArgument(format!("increment by {}", count)));
        }

        let ts = now();
        let sql = r#"
            INSERT INTO asset_references
                (project_id, sha256, object_key, ref_count, asset_meta, created_at, updated_at, last_referenced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project_id, sha256) DO UPDATE SET
                ref_count = asset_references.ref_count + excluded.ref_count,
                object_key = CASE
                    WHEN asset_references.ref_count = 0 OR asset_references.object_key = ''
                    THEN excluded.object_key
                    ELSE asset_references.object_key
                END,
                asset_meta = excluded.asset_meta,
                updated_at = excluded.updated_at,
                last_referenced_at = excluded.last_referenced_at,
                reaping_until = NULL
            WHERE asset_references.reaping_until IS NULL OR asset_references.reaping_until < ?
            RETURNING ref_count
        "#;
        let row = conn
            .query_one(Statement::from_sql_and_values(
                conn.get_database_backend(),
                sql,
                [
                    project_id.to_string().into(),
                    asset.sha256.clone().into(),
                    asset.s3_key.clone().into(),
                    count.into(),
                    serde_json::to_string(asset)?.into(),
                    ts.into(),
                    ts.into(),
                    ts.into(),
                    ts.into(),
                ],
            ))
            .await?;
        let Some(row) = row else {
            tracing::debug!("{}/{} is being reaped, increment refused", project_id, asset.sha256);
            return Err(StoreError::Transaction(DbErr::Custom(format!(
                "content {} is being deleted",
                asset.sha256
            ))));
        };
        let total: i64 = row.try_get("", "ref_count")?;

        tracing::debug!("Ledger +{} for {}/{} now {}", count, project_id, asset.sha256, total);
        Ok(total)
    }

    /// Lower the count for `sha256` by `count` on `conn` with one
    /// decrement-and-check statement. The count never goes below zero.
    pub async fn release_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        project_id: Uuid,
        sha256: &str,
        count: i64,
    ) -> Result<Release> {
        check_project(project_id)?;
        check_hash(sha256)?;
        if count <= 0 {
            return Err(StoreError::InvalidArgument(format!("release by {}", count)));
        }

        let sql = r#"
            UPDATE asset_references
            SET ref_count = MAX(ref_count - ?, 0), updated_at = ?
            WHERE project_id = ? AND sha256 = ? AND ref_count > 0
            RETURNING ref_count
        "#;
        let row = conn
            .query_one(Statement::from_sql_and_values(
                conn.get_database_backend(),
                sql,
                [
                    count.into(),
                    now().into(),
                    project_id.to_string().into(),
                    sha256.to_string().into(),
                ],
            ))
            .await?;

        let release = match row {
            None => Release::Missing {
                sha256: sha256.to_string(),
            },
            Some(row) => match row.try_get::<i64>("", "ref_count")? {
                0 => Release::Orphaned {
                    project_id,
                    sha256: sha256.to_string(),
                },
                remaining => Release::Retained {
                    sha256: sha256.to_string(),
                    remaining,
                },
            },
        };
        tracing::debug!("Ledger -{} for {}/{}: {:?}", count, project_id, sha256, release);
        Ok(release)
    }

    /// Delete the objects behind orphaned releases, then their tombstones.
    ///
    /// Each tombstone is claimed first, so an increment arriving while its
    /// object is deleted fails instead of reviving it. Entries revived before
    /// the claim are left alone. When the object delete fails the claims are
    /// dropped and the tombstones stay for the sweep.
    /// Returns the number of tombstones removed.
    pub async fn reap(&self, releases: &[Release], deadline: Deadline) -> Result<usize> {
        let backend = self.db.get_database_backend();
        let ts = now();
        let lease_until = ts + reap_lease(deadline);

        let mut claims = Vec::new();
        for release in releases {
            let Release::Orphaned { project_id, sha256 } = release else {
                continue;
            };
            let claimed = self
                .db
                .query_one(Statement::from_sql_and_values(
                    backend,
                    r#"
                    UPDATE asset_references SET reaping_until = ?
                    WHERE project_id = ? AND sha256 = ? AND ref_count = 0
                        AND (reaping_until IS NULL OR reaping_until < ?)
                    RETURNING object_key
                    "#,
                    [
                        lease_until.into(),
                        project_id.to_string().into(),
                        sha256.clone().into(),
                        ts.into(),
                    ],
                ))
                .await?;
            match claimed {
                Some(row) => claims.push(Claim {
                    project_id: project_id.to_string(),
                    sha256: sha256.clone(),
                    object_key: row.try_get("", "object_key")?,
                }),
                None => tracing::debug!(
                    "{}/{} was referenced again or is already being reaped",
                    project_id,
                    sha256
                ),
            }
        }
        if claims.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = claims
            .iter()
            .map(|c| c.object_key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if let Err(e) = self.blobs.delete_batch(&keys, deadline).await {
            tracing::error!("Failed to delete {} orphaned objects, tombstones kept: {}", keys.len(), e);
            self.unclaim(&claims).await;
            return Err(e);
        }

        let mut reaped = 0;
        for claim in &claims {
            let result = self
                .db
                .execute(Statement::from_sql_and_values(
                    backend,
                    "DELETE FROM asset_references WHERE project_id = ? AND sha256 = ? AND ref_count = 0",
                    [claim.project_id.clone().into(), claim.sha256.clone().into()],
                ))
                .await?;
            if result.rows_affected() == 0 {
                tracing::error!(
                    "{}/{} was referenced again after its claim on {} lapsed",
                    claim.project_id,
                    claim.sha256,
                    claim.object_key
                );
            } else {
                reaped += 1;
            }
        }

        tracing::debug!("Reaped {} orphaned objects", reaped);
        Ok(reaped)
    }

    /// Release claims so the sweep can retry the tombstones at once.
    /// A claim that cannot be released expires with its lease.
    async fn unclaim(&self, claims: &[Claim]) {
        for claim in claims {
            let result = self
                .db
                .execute(Statement::from_sql_and_values(
                    self.db.get_database_backend(),
                    "UPDATE asset_references SET reaping_until = NULL WHERE project_id = ? AND sha256 = ? AND ref_count = 0",
                    [claim.project_id.clone().into(), claim.sha256.clone().into()],
                ))
                .await;
            if let Err(e) = result {
                tracing::warn!("Claim on {}/{} left to expire: {}", claim.project_id, claim.sha256, e);
            }
        }
    }

    /// Drop one reference to `asset`; deletes the object when it was the last.
    /// Decrementing an absent entry is a no-op.
    pub async fn decrement(&self, project_id: Uuid, asset: &Asset, deadline: Deadline) -> Result<Release> {
        let release = self
            .release_in(self.db.as_ref(), project_id, &asset.sha256, 1)
            .await?;
        self.reap(std::slice::from_ref(&release), deadline).await?;
        Ok(release)
    }

    /// Increment every asset, one aggregated write per distinct hash
    pub async fn batch_increment(&self, project_id: Uuid, assets: &[Asset]) -> Result<()> {
        check_project(project_id)?;
        if assets.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin().await?;
        for (asset, count) in group_by_hash(assets).values() {
            self.increment_in(&txn, project_id, asset, *count).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Decrement every asset, one aggregated write per distinct hash, then
    /// reap whatever reached zero
    pub async fn batch_decrement(
        &self,
        project_id: Uuid,
        assets: &[Asset],
        deadline: Deadline,
    ) -> Result<Vec<Release>> {
        check_project(project_id)?;
        if assets.is_empty() {
            return Ok(Vec::new());
        }
        let txn = self.db.begin().await?;
        let mut releases = Vec::new();
        for (sha256, (_, count)) in group_by_hash(assets) {
            releases.push(self.release_in(&txn, project_id, &sha256, count).await?);
        }
        txn.commit().await?;

        self.reap(&releases, deadline).await?;
        Ok(releases)
    }

    /// Live entry for `sha256`; tombstones read as absent
    pub async fn get(&self, project_id: Uuid, sha256: &str) -> Result<Option<LedgerEntry>> {
        check_project(project_id)?;
        check_hash(sha256)?;
        let row = asset_reference::Entity::find_by_id((project_id.to_string(), sha256.to_string()))
            .one(self.db.as_ref())
            .await?;
        match row {
            Some(row) if row.ref_count > 0 => Ok(Some(row.try_into()?)),
            _ => Ok(None),
        }
    }

    /// Stored descriptor for content already referenced in the project
    pub async fn lookup_live(&self, project_id: Uuid, sha256: &str) -> Result<Option<Asset>> {
        Ok(self.get(project_id, sha256).await?.map(|e| e.asset))
    }

    /// Live entries of a project ordered by hash
    pub async fn list(&self, project_id: Uuid) -> Result<Vec<LedgerEntry>> {
        check_project(project_id)?;
        asset_reference::Entity::find()
            .filter(asset_reference::Column::ProjectId.eq(project_id.to_string()))
            .filter(asset_reference::Column::RefCount.gt(0))
            .order_by_asc(asset_reference::Column::Sha256)
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(LedgerEntry::try_from)
            .collect()
    }

    /// Journal one release per distinct hash on `conn`; applied later by
    /// [`ReferenceLedger::apply_releases`]
    pub async fn schedule_releases_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        project_id: Uuid,
        disk_id: Uuid,
        assets: &[Asset],
    ) -> Result<usize> {
        check_project(project_id)?;
        let ts = now();
        let mut rows = Vec::new();
        for (sha256, (_, count)) in group_by_hash(assets) {
            check_hash(&sha256)?;
            rows.push(asset_reference_release::ActiveModel {
                project_id: Set(project_id.to_string()),
                disk_id: Set(disk_id.to_string()),
                sha256: Set(sha256),
                count: Set(count),
                created_at: Set(ts),
                ..Default::default()
            });
        }
        let scheduled = rows.len();
        if scheduled > 0 {
            asset_reference_release::Entity::insert_many(rows)
                .exec(conn)
                .await?;
        }
        Ok(scheduled)
    }

    /// Drain journaled releases of a project (optionally of one disk).
    ///
    /// Journal rows are consumed in the same transaction that lowers the
    /// counts, so draining twice releases each reference once. Returns the
    /// number of references released.
    pub async fn apply_releases(
        &self,
        project_id: Uuid,
        disk_id: Option<Uuid>,
        deadline: Deadline,
    ) -> Result<i64> {
        check_project(project_id)?;
        let txn = self.db.begin().await?;

        let mut query = asset_reference_release::Entity::find()
            .filter(asset_reference_release::Column::ProjectId.eq(project_id.to_string()));
        if let Some(disk_id) = disk_id {
            query = query.filter(asset_reference_release::Column::DiskId.eq(disk_id.to_string()));
        }
        let rows = query.all(&txn).await?;
        if rows.is_empty() {
            txn.commit().await?;
            return Ok(0);
        }

        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for row in &rows {
            *counts.entry(row.sha256.clone()).or_default() += row.count;
        }
        let mut releases = Vec::new();
        for (sha256, count) in &counts {
            releases.push(self.release_in(&txn, project_id, sha256, *count).await?);
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let deleted = asset_reference_release::Entity::delete_many()
            .filter(asset_reference_release::Column::Id.is_in(ids.clone()))
            .exec(&txn)
            .await?;
        if deleted.rows_affected != ids.len() as u64 {
            // Dropping the transaction rolls the releases back
            return Err(StoreError::Transaction(DbErr::Custom(
                "release journal drained concurrently".into(),
            )));
        }
        txn.commit().await?;

        let released: i64 = counts.values().sum();
        tracing::info!(
            "Applied {} journaled releases across {} hashes for project {}",
            released,
            counts.len(),
            project_id
        );
        self.reap(&releases, deadline).await?;
        Ok(released)
    }

    /// One sweep: drain leftover journal rows, reap every tombstone and
    /// report counts that disagree with the artifact table.
    ///
    /// Drift is logged, never corrected.
    pub async fn reconcile(&self, deadline: Deadline) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let backend = self.db.get_database_backend();

        let pending = self
            .db
            .query_all(Statement::from_string(
                backend,
                "SELECT DISTINCT project_id FROM asset_reference_releases ORDER BY project_id".to_string(),
            ))
            .await?;
        for row in pending {
            if deadline.is_expired() {
                return Err(StoreError::DeadlineExceeded("reconcile".into()));
            }
            let project_id = parse_id(&row.try_get::<String>("", "project_id")?)?;
            report.releases_applied += self.apply_releases(project_id, None, deadline).await?;
        }

        let tombstones: Vec<Release> = asset_reference::Entity::find()
            .filter(asset_reference::Column::RefCount.eq(0))
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(|row| -> Result<Release> {
                Ok(Release::Orphaned {
                    project_id: parse_id(&row.project_id)?,
                    sha256: row.sha256,
                })
            })
            .collect::<Result<_>>()?;
        if !tombstones.is_empty() {
            if deadline.is_expired() {
                return Err(StoreError::DeadlineExceeded("reconcile".into()));
            }
            report.orphans_reaped = self.reap(&tombstones, deadline).await?;
        }

        report.drift = self.find_drift().await?;
        for drift in &report.drift {
            tracing::warn!(
                "Ledger drift for {}/{}: ledger counts {}, artifacts count {}",
                drift.project_id,
                drift.sha256,
                drift.ledger_count,
                drift.artifact_count
            );
        }

        tracing::info!(
            "Reconcile: {} releases applied, {} orphans reaped, {} drifted entries",
            report.releases_applied,
            report.orphans_reaped,
            report.drift.len()
        );
        Ok(report)
    }

    async fn find_drift(&self) -> Result<Vec<Drift>> {
        // Live entries whose count differs from their artifacts, then
        // artifacts whose hash has no live entry at all
        let sql = r#"
            SELECT r.project_id AS project_id, r.sha256 AS sha256,
                   r.ref_count AS ledger_count, COUNT(a.id) AS artifact_count
            FROM asset_references r
            LEFT JOIN disks d ON d.project_id = r.project_id
            LEFT JOIN artifacts a ON a.disk_id = d.id AND a.sha256 = r.sha256
            WHERE r.ref_count > 0
            GROUP BY r.project_id, r.sha256, r.ref_count
            HAVING COUNT(a.id) <> r.ref_count
            UNION ALL
            SELECT d.project_id AS project_id, a.sha256 AS sha256,
                   0 AS ledger_count, COUNT(a.id) AS artifact_count
            FROM artifacts a
            JOIN disks d ON d.id = a.disk_id
            LEFT JOIN asset_references r
                ON r.project_id = d.project_id AND r.sha256 = a.sha256 AND r.ref_count > 0
            WHERE r.sha256 IS NULL
            GROUP BY d.project_id, a.sha256
            ORDER BY project_id, sha256
        "#;
        let rows = self
            .db
            .query_all(Statement::from_string(self.db.get_database_backend(), sql.to_string()))
            .await?;
        rows.iter()
            .map(|row| -> Result<Drift> {
                Ok(Drift {
                    project_id: row.try_get("", "project_id")?,
                    sha256: row.try_get("", "sha256")?,
                    ledger_count: row.try_get("", "ledger_count")?,
                    artifact_count: row.try_get("", "artifact_count")?,
                })
            })
            .collect()
    }
}
