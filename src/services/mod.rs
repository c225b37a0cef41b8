//! Business logic services.
//!
//! Services orchestrate the storage facade and metadata stores and provide
//! high-level operations.

mod hasher;
mod versioning;

pub use hasher::ContentHasher;
pub use versioning::{
    DEFAULT_KEEP_VERSIONS, NewFile, PruneReport, RestoreOutcome, VersioningService,
};
