//! Reference ledger entity
//!
//! Rows are written through raw statements in `ledger.rs` so that every
//! count change is a single atomic expression; the entity is used for reads.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "asset_references")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub project_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub sha256: String,       // 64-char hex SHA256
    pub object_key: String,   // canonical key, first one recorded wins
    pub ref_count: i64,       // 0 = tombstone awaiting object deletion
    pub asset_meta: String,   // JSON-encoded blob::Asset
    pub created_at: i64,
    pub updated_at: i64,
    pub last_referenced_at: i64,
    pub reaping_until: Option<i64>, // unix seconds; set while the object is being deleted
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
