//! Process configuration read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::storage::StorageConfig;

pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base directory for the database and local objects
    pub data_dir: PathBuf,
    pub database_url: String,
    pub storage: StorageConfig,
    /// Expiry of presigned URLs when the caller gives none
    pub presign_ttl: Duration,
    /// Period of the reconcile sweep
    pub sweep_interval: Duration,
    /// Deadline applied to each sweep pass
    pub op_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = get("ACONTEXT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("acontext-storage"));
        let database_url = get("ACONTEXT_DATABASE_URL").unwrap_or_else(|| {
            format!("sqlite:{}?mode=rwc", data_dir.join("acontext.db").display())
        });
        let storage = StorageConfig::from_lookup(&data_dir, &lookup)?;

        Ok(Self {
            presign_ttl: seconds(get("ACONTEXT_PRESIGN_TTL_SECS"), "ACONTEXT_PRESIGN_TTL_SECS", DEFAULT_PRESIGN_TTL)?,
            sweep_interval: seconds(
                get("ACONTEXT_SWEEP_INTERVAL_SECS"),
                "ACONTEXT_SWEEP_INTERVAL_SECS",
                DEFAULT_SWEEP_INTERVAL,
            )?,
            op_timeout: seconds(get("ACONTEXT_OP_TIMEOUT_SECS"), "ACONTEXT_OP_TIMEOUT_SECS", DEFAULT_OP_TIMEOUT)?,
            data_dir,
            database_url,
            storage,
        })
    }
}

fn seconds(value: Option<String>, key: &str, default: Duration) -> Result<Duration, String> {
    match value {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(format!("{} must be a positive number of seconds, got {:?}", key, raw)),
            Ok(secs) => Ok(Duration::from_secs(secs)),
        },
    }
}
