//! Data models for stowage.
//!
//! Plain data carried between the storage tiers, the facade and the
//! versioning service.

mod object;
mod version;

pub use object::{
    HealthReport, HealthStatus, ObjectEntry, ObjectMetadata, Tier, Tiered, UploadResult,
};
pub use version::{FileHead, FileId, FileVersion, NewVersion, VersionDiff};
