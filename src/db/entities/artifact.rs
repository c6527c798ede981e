//! Artifact entity

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "artifacts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String, // UUID
    pub disk_id: String,
    pub path: String,     // always starts and ends with '/'
    pub filename: String,
    pub sha256: String,   // copy of asset_meta.sha256 for ledger reconciliation
    pub meta: String,     // JSON object: user keys plus __artifact_info__
    pub asset_meta: String, // JSON-encoded blob::Asset
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::disk::Entity",
        from = "Column::DiskId",
        to = "super::disk::Column::Id",
        on_delete = "Cascade"
    )]
    Disk,
}

impl Related<super::disk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Disk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
