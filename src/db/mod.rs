//! Database module for SQLite persistence using SeaORM

pub mod entities;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use uuid::Uuid;

/// Connect to `db_url` and create tables.
///
/// `max_connections` bounds the pool; tests pass `Some(1)` so every query
/// shares one SQLite connection.
pub async fn connect(db_url: &str, max_connections: Option<u32>) -> Result<DatabaseConnection, DbErr> {
    tracing::info!("Connecting to database: {}", db_url);

    let mut options = ConnectOptions::new(db_url.to_string());
    options.sqlx_logging(false);
    if let Some(max) = max_connections {
        options.max_connections(max).min_connections(1);
    }
    let db = Database::connect(options).await?;

    create_tables(&db).await?;

    Ok(db)
}

/// Create all tables if they don't exist
async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    let statements = [
        "PRAGMA foreign_keys = ON",
        // Disks: project-scoped artifact namespaces
        r#"
        CREATE TABLE IF NOT EXISTS disks (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS idx_disks_project ON disks(project_id)"#,
        // Artifacts: one row per (disk, path, filename)
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY,
            disk_id TEXT NOT NULL,
            path TEXT NOT NULL,
            filename TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            meta TEXT NOT NULL DEFAULT '{}',
            asset_meta TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (disk_id) REFERENCES disks(id) ON DELETE CASCADE,
            UNIQUE(disk_id, path, filename)
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS idx_artifacts_disk_path ON artifacts(disk_id, path)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_artifacts_sha256 ON artifacts(sha256)"#,
        // Reference ledger: live references per (project, content hash)
        r#"
        CREATE TABLE IF NOT EXISTS asset_references (
            project_id TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            object_key TEXT NOT NULL,
            ref_count INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0),
            asset_meta TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_referenced_at INTEGER NOT NULL,
            reaping_until INTEGER,
            PRIMARY KEY (project_id, sha256)
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS idx_asset_references_key ON asset_references(object_key)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_asset_references_count ON asset_references(ref_count)"#,
        // Pending ledger decrements left behind by disk deletion
        r#"
        CREATE TABLE IF NOT EXISTS asset_reference_releases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            disk_id TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            count INTEGER NOT NULL CHECK (count > 0),
            created_at INTEGER NOT NULL
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS idx_releases_project_disk ON asset_reference_releases(project_id, disk_id)"#,
    ];

    for sql in statements {
        db.execute(Statement::from_string(db.get_database_backend(), sql.to_string()))
            .await?;
    }

    tracing::info!("Database tables initialized");
    Ok(())
}

/// Current time as unix seconds
pub(crate) fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Parse an id column written by this crate
pub(crate) fn parse_id(value: &str) -> Result<Uuid, DbErr> {
    Uuid::parse_str(value).map_err(|e| DbErr::Type(format!("invalid id {:?}: {}", value, e)))
}
