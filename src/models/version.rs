//! File version types and identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a logical file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Creates a new file ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One immutable entry in a file's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    /// The logical file this version belongs to.
    pub file_id: FileId,
    /// Version number, strictly increasing per file, starting at 1.
    pub version: u32,
    /// Storage key of the version's blob.
    pub storage_path: String,
    /// Blob size in bytes.
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the blob.
    pub content_hash: String,
    /// Optional note describing the change.
    pub change_note: Option<String>,
    /// Actor that created the version.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A version waiting for its number.
///
/// The metadata store assigns `version` atomically when recording it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVersion {
    /// The logical file.
    pub file_id: FileId,
    /// Storage key of the uploaded blob.
    pub storage_path: String,
    /// Blob size in bytes.
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the blob.
    pub content_hash: String,
    /// Optional note describing the change.
    pub change_note: Option<String>,
    /// Actor creating the version.
    pub created_by: String,
}

impl NewVersion {
    /// Attaches a version number and timestamp.
    #[must_use]
    pub fn into_version(self, version: u32, created_at: DateTime<Utc>) -> FileVersion {
        FileVersion {
            file_id: self.file_id,
            version,
            storage_path: self.storage_path,
            size_bytes: self.size_bytes,
            content_hash: self.content_hash,
            change_note: self.change_note,
            created_by: self.created_by,
            created_at,
        }
    }
}

/// The live content of a logical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHead {
    /// The logical file.
    pub file_id: FileId,
    /// Owner used as the first segment of storage keys.
    pub owner_id: String,
    /// Display filename; its extension is reused for new keys.
    pub filename: String,
    /// MIME type of the content.
    pub content_type: String,
    /// Storage key of the live blob.
    pub storage_path: String,
    /// Lowercase hex SHA-256 of the live blob.
    pub content_hash: String,
    /// Live blob size in bytes.
    pub size_bytes: u64,
    /// Last time the live content changed.
    pub updated_at: DateTime<Utc>,
}

/// Comparison between two versions of the same file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDiff {
    /// The logical file.
    pub file_id: FileId,
    /// The older-side version number as requested.
    pub from: u32,
    /// The newer-side version number as requested.
    pub to: u32,
    /// Whether both versions have identical content.
    pub same_content: bool,
    /// `to.size_bytes - from.size_bytes`.
    pub size_delta: i64,
    /// Time elapsed between the two versions, in seconds.
    pub elapsed_secs: i64,
    /// Whether different actors created the two versions.
    pub author_changed: bool,
}

impl VersionDiff {
    /// Compares two versions.
    #[must_use]
    pub fn between(from: &FileVersion, to: &FileVersion) -> Self {
        let from_size = i64::try_from(from.size_bytes).unwrap_or(i64::MAX);
        let to_size = i64::try_from(to.size_bytes).unwrap_or(i64::MAX);
        Self {
            file_id: to.file_id.clone(),
            from: from.version,
            to: to.version,
            same_content: from.content_hash == to.content_hash,
            size_delta: to_size.saturating_sub(from_size),
            elapsed_secs: (to.created_at - from.created_at).num_seconds(),
            author_changed: from.created_by != to.created_by,
        }
    }
}
