//! Content-addressed, reference-counted artifact storage.
//!
//! Uploaded content is stored once per project in an S3-compatible object
//! store (or the local filesystem) and shared by every artifact with the same
//! SHA256. A per-project reference ledger in SQLite counts the artifacts
//! pointing at each hash and is the only place that decides when an object
//! is deleted.
//!
//! - [`blob`]: object upload, download, delete and presign
//! - [`ledger`]: reference counts, release journal and reconcile sweep
//! - [`artifact`]: path + filename addressed files on a disk
//! - [`disk`]: project-scoped disks with cascading deletion

pub mod artifact;
pub mod blob;
pub mod cas;
pub mod config;
pub mod db;
pub mod deadline;
pub mod disk;
pub mod error;
pub mod ledger;
pub mod service;
pub mod storage;
pub mod vfs;

#[cfg(test)]
mod testutil;

pub use artifact::{Artifact, ArtifactDirectory, ArtifactListing, ArtifactUpdate, Released};
pub use blob::{Asset, BlobStore, Upload};
pub use config::AppConfig;
pub use deadline::Deadline;
pub use disk::{Disk, DiskDeletion, DiskManager};
pub use error::{ErrorKind, Result, StoreError};
pub use ledger::{LedgerEntry, ReconcileReport, ReferenceLedger, Release};
pub use service::StorageCore;
