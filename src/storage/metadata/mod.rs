//! Version metadata stores.
//!
//! The versioning service keeps two kinds of records per logical file: the
//! immutable [`FileVersion`] history and a single mutable [`FileHead`]
//! describing the live content. Version numbers come from a per-file counter
//! that is incremented atomically with the insert, so concurrent writers
//! always receive unique, gap-free numbers. The counter never goes backwards,
//! even after pruning.

mod memory;
mod sqlite;

pub use memory::InMemoryMetadataStore;
pub use sqlite::SqliteMetadataStore;

use crate::Result;
use crate::models::{FileHead, FileId, FileVersion, NewVersion};

/// A version insert, optionally moving the head in the same transaction.
#[derive(Debug, Clone)]
pub struct VersionCommit {
    /// The version to record.
    pub version: NewVersion,
    /// Replaces the file head when set.
    pub head: Option<FileHead>,
    /// Records nothing when the current head already has this content hash.
    pub skip_if_head_matches: bool,
}

/// Storage for file heads and version history.
pub trait MetadataStore: Send + Sync {
    /// Allocates the next version number and records the version atomically.
    ///
    /// Returns `None` when `skip_if_head_matches` suppressed the insert.
    fn commit_version(&self, commit: VersionCommit) -> Result<Option<FileVersion>>;

    /// Lists versions of a file, newest first.
    fn list_versions(&self, file_id: &FileId) -> Result<Vec<FileVersion>>;

    /// Retrieves one version.
    fn get_version(&self, file_id: &FileId, version: u32) -> Result<Option<FileVersion>>;

    /// Deletes the given version rows. Returns how many existed.
    fn delete_versions(&self, file_id: &FileId, versions: &[u32]) -> Result<usize>;

    /// Retrieves the file head.
    fn get_head(&self, file_id: &FileId) -> Result<Option<FileHead>>;

    /// Inserts or replaces the file head.
    fn set_head(&self, head: &FileHead) -> Result<()>;

    /// Returns the newest version.
    fn latest_version(&self, file_id: &FileId) -> Result<Option<FileVersion>> {
        Ok(self.list_versions(file_id)?.into_iter().next())
    }

    /// Returns the number of versions.
    fn count_versions(&self, file_id: &FileId) -> Result<usize> {
        Ok(self.list_versions(file_id)?.len())
    }
}
