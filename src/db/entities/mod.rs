//! Database entities

pub mod artifact;
pub mod asset_reference;
pub mod asset_reference_release;
pub mod disk;

pub use artifact::Entity as Artifact;
pub use asset_reference::Entity as AssetReference;
pub use asset_reference_release::Entity as AssetReferenceRelease;
pub use disk::Entity as Disk;
