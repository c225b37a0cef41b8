//! Content-addressed file versioning.
//!
//! Each logical file has a head (the live content) and an append-only history
//! of [`FileVersion`]s. A new version is only recorded when the content hash
//! differs from the head's, restores always add history instead of rewriting
//! it, and pruning keeps the newest versions by number.
//!
//! Blobs live in the [`StorageFacade`], so versioning inherits its breaker,
//! retries and local fallback. Version numbers are allocated by the
//! [`MetadataStore`] atomically with the insert.

use crate::models::{FileHead, FileId, FileVersion, NewVersion, Tiered, UploadResult, VersionDiff};
use crate::services::hasher::ContentHasher;
use crate::storage::{MetadataStore, StorageFacade, VersionCommit};
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::instrument;

/// Default number of versions kept by retention pruning.
pub const DEFAULT_KEEP_VERSIONS: usize = 20;

/// Details of a new file.
#[derive(Debug, Clone)]
pub struct NewFile {
    /// The logical file.
    pub file_id: FileId,
    /// Owner used as the first segment of storage keys.
    pub owner_id: String,
    /// Display filename.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
}

/// Result of restoring a version.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    /// Snapshot of the content that was live before the restore.
    pub snapshot: FileVersion,
    /// The version whose content is now live.
    pub restored_from: u32,
    /// The new head.
    pub head: FileHead,
}

/// Result of retention pruning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Versions kept.
    pub kept: usize,
    /// Version rows removed.
    pub removed: Vec<u32>,
    /// Blobs deleted from storage.
    pub blobs_deleted: usize,
    /// Blobs whose deletion failed; their rows were removed anyway.
    pub blob_failures: usize,
}

/// Service for file version history.
pub struct VersioningService {
    storage: Arc<StorageFacade>,
    store: Arc<dyn MetadataStore>,
}

impl VersioningService {
    /// Creates a new versioning service.
    #[must_use]
    pub fn new(storage: Arc<StorageFacade>, store: Arc<dyn MetadataStore>) -> Self {
        Self { storage, store }
    }

    /// Returns the storage facade.
    #[must_use]
    pub fn storage(&self) -> &StorageFacade {
        &self.storage
    }

    /// Returns the live head of a file.
    pub fn head(&self, file_id: &FileId) -> Result<Option<FileHead>> {
        self.store.get_head(file_id)
    }

    /// Uploads the first content of a file and records it as version 1.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the file already has a head.
    #[instrument(skip(self, file, content), fields(file_id = %file.file_id, size = content.len()))]
    pub async fn register_file(
        &self,
        file: NewFile,
        actor_id: &str,
        content: &[u8],
    ) -> Result<FileVersion> {
        if self.store.get_head(&file.file_id)?.is_some() {
            return Err(Error::InvalidInput(format!(
                "file already registered: {}",
                file.file_id
            )));
        }

        let content_hash = ContentHasher::hash(content);
        let uploaded = self
            .storage
            .upload_bytes(content, &file.owner_id, &file.filename, &file.content_type)
            .await?;
        log_tier("register_file", &uploaded);
        let path = uploaded.value.path;

        let head = FileHead {
            file_id: file.file_id.clone(),
            owner_id: file.owner_id,
            filename: file.filename,
            content_type: file.content_type,
            storage_path: path.clone(),
            content_hash: content_hash.clone(),
            size_bytes: content.len() as u64,
            updated_at: Utc::now(),
        };
        let commit = VersionCommit {
            version: NewVersion {
                file_id: file.file_id,
                storage_path: path,
                size_bytes: content.len() as u64,
                content_hash,
                change_note: Some("initial upload".to_string()),
                created_by: actor_id.to_string(),
            },
            head: Some(head),
            skip_if_head_matches: false,
        };
        let version = self
            .store
            .commit_version(commit)?
            .ok_or_else(|| Error::OperationFailed {
                operation: "register_file".to_string(),
                cause: "initial version was not recorded".to_string(),
            })?;
        metrics::counter!("storage_versions_created_total").increment(1);
        Ok(version)
    }

    /// Records new content for a file.
    ///
    /// Returns `None` without uploading anything when the content hash equals
    /// the head's. If a concurrent writer commits the same content first, the
    /// blob uploaded here is deleted and `None` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the file has no head.
    #[instrument(skip(self, content, note), fields(file_id = %file_id, size = content.len()))]
    pub async fn create_version(
        &self,
        file_id: &FileId,
        actor_id: &str,
        content: &[u8],
        note: Option<&str>,
    ) -> Result<Option<FileVersion>> {
        let head = self.require_head(file_id)?;
        let content_hash = ContentHasher::hash(content);
        if head.content_hash == content_hash {
            tracing::debug!(
                file_id = %file_id,
                hash = ContentHasher::short(&content_hash),
                "Content unchanged, no version created"
            );
            return Ok(None);
        }

        let uploaded = self
            .storage
            .upload_bytes(content, &head.owner_id, &head.filename, &head.content_type)
            .await?;
        log_tier("create_version", &uploaded);
        let path = uploaded.value.path;

        let commit = VersionCommit {
            version: NewVersion {
                file_id: file_id.clone(),
                storage_path: path.clone(),
                size_bytes: content.len() as u64,
                content_hash: content_hash.clone(),
                change_note: note.map(str::to_string),
                created_by: actor_id.to_string(),
            },
            head: Some(FileHead {
                storage_path: path.clone(),
                content_hash,
                size_bytes: content.len() as u64,
                updated_at: Utc::now(),
                ..head
            }),
            skip_if_head_matches: true,
        };

        match self.store.commit_version(commit)? {
            Some(version) => {
                tracing::info!(
                    file_id = %file_id,
                    version = version.version,
                    size = version.size_bytes,
                    "Created file version"
                );
                metrics::counter!("storage_versions_created_total").increment(1);
                Ok(Some(version))
            },
            None => {
                self.discard_blob(&path).await;
                Ok(None)
            },
        }
    }

    /// Makes the content of `version` live again.
    ///
    /// The current live content is snapshotted as a new version noted
    /// "before restoring to vN", so history only ever grows. The target bytes
    /// are verified against their recorded hash and uploaded before anything
    /// is recorded; the snapshot and the new head are then committed together,
    /// so a failed restore adds no history.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the file or version does not exist, and
    /// [`Error::OperationFailed`] if the stored bytes fail verification.
    #[instrument(skip(self), fields(file_id = %file_id, version = version))]
    pub async fn restore_version(
        &self,
        file_id: &FileId,
        version: u32,
        actor_id: &str,
    ) -> Result<RestoreOutcome> {
        let target = self
            .store
            .get_version(file_id, version)?
            .ok_or_else(|| Error::NotFound(format!("{file_id} v{version}")))?;
        let head = self.require_head(file_id)?;

        let bytes = self
            .storage
            .download_as_buffer(&target.storage_path)
            .await?
            .into_inner();
        if !ContentHasher::verify(&bytes, &target.content_hash) {
            return Err(Error::OperationFailed {
                operation: "restore_version".to_string(),
                cause: format!(
                    "content of {file_id} v{version} does not match its recorded hash {}",
                    ContentHasher::short(&target.content_hash)
                ),
            });
        }

        // Upload first so a failed upload leaves history untouched.
        let uploaded = self
            .storage
            .upload_bytes(&bytes, &head.owner_id, &head.filename, &head.content_type)
            .await?;
        log_tier("restore_version", &uploaded);
        let path = uploaded.value.path;

        let new_head = FileHead {
            storage_path: path.clone(),
            content_hash: target.content_hash,
            size_bytes: target.size_bytes,
            updated_at: Utc::now(),
            ..head.clone()
        };
        // The snapshot row and the head move together.
        let commit = VersionCommit {
            version: NewVersion {
                file_id: file_id.clone(),
                storage_path: head.storage_path,
                size_bytes: head.size_bytes,
                content_hash: head.content_hash,
                change_note: Some(format!("before restoring to v{version}")),
                created_by: actor_id.to_string(),
            },
            head: Some(new_head.clone()),
            skip_if_head_matches: false,
        };
        let snapshot = match self.store.commit_version(commit) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                self.discard_blob(&path).await;
                return Err(Error::OperationFailed {
                    operation: "restore_version".to_string(),
                    cause: "snapshot was not recorded".to_string(),
                });
            },
            Err(e) => {
                self.discard_blob(&path).await;
                return Err(e);
            },
        };
        metrics::counter!("storage_versions_created_total").increment(1);

        tracing::info!(
            file_id = %file_id,
            restored_from = version,
            snapshot = snapshot.version,
            "Restored file version"
        );
        Ok(RestoreOutcome {
            snapshot,
            restored_from: version,
            head: new_head,
        })
    }

    /// Deletes all but the `keep` newest versions.
    ///
    /// Blob deletion is best effort: failures are logged and counted, and the
    /// version rows are removed regardless. Blobs still referenced by a kept
    /// version or the head are left in place.
    #[instrument(skip(self), fields(file_id = %file_id, keep = keep))]
    pub async fn prune_old_versions(&self, file_id: &FileId, keep: usize) -> Result<PruneReport> {
        let versions = self.store.list_versions(file_id)?;
        if versions.len() <= keep {
            return Ok(PruneReport {
                kept: versions.len(),
                ..PruneReport::default()
            });
        }

        let (kept, doomed) = versions.split_at(keep);
        let mut referenced: HashSet<&str> = kept.iter().map(|v| v.storage_path.as_str()).collect();
        let head = self.store.get_head(file_id)?;
        if let Some(head) = &head {
            referenced.insert(head.storage_path.as_str());
        }

        let mut report = PruneReport {
            kept: kept.len(),
            ..PruneReport::default()
        };
        let mut attempted: HashSet<&str> = HashSet::new();
        for version in doomed {
            let path = version.storage_path.as_str();
            if referenced.contains(path) || !attempted.insert(path) {
                continue;
            }
            match self.storage.delete_file(path).await {
                Ok(_) => report.blobs_deleted += 1,
                Err(e) => {
                    report.blob_failures += 1;
                    tracing::warn!(
                        file_id = %file_id,
                        version = version.version,
                        path = path,
                        error = %e,
                        "Failed to delete version blob"
                    );
                },
            }
        }

        report.removed = doomed.iter().map(|v| v.version).collect();
        self.store.delete_versions(file_id, &report.removed)?;

        tracing::info!(
            file_id = %file_id,
            kept = report.kept,
            removed = report.removed.len(),
            blob_failures = report.blob_failures,
            "Pruned file versions"
        );
        metrics::counter!("storage_versions_pruned_total").increment(report.removed.len() as u64);
        Ok(report)
    }

    /// Lists versions newest first.
    pub fn list_versions(&self, file_id: &FileId) -> Result<Vec<FileVersion>> {
        self.store.list_versions(file_id)
    }

    /// Retrieves one version.
    pub fn get_version(&self, file_id: &FileId, version: u32) -> Result<Option<FileVersion>> {
        self.store.get_version(file_id, version)
    }

    /// Compares two versions of a file.
    pub fn compare_versions(&self, file_id: &FileId, from: u32, to: u32) -> Result<VersionDiff> {
        let load = |n: u32| -> Result<FileVersion> {
            self.store
                .get_version(file_id, n)?
                .ok_or_else(|| Error::NotFound(format!("{file_id} v{n}")))
        };
        Ok(VersionDiff::between(&load(from)?, &load(to)?))
    }

    fn require_head(&self, file_id: &FileId) -> Result<FileHead> {
        self.store
            .get_head(file_id)?
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))
    }

    async fn discard_blob(&self, path: &str) {
        tracing::debug!(path = path, "Discarding blob with no version row");
        if let Err(e) = self.storage.delete_file(path).await {
            tracing::warn!(path = path, error = %e, "Failed to delete orphaned blob");
        }
    }
}

fn log_tier(operation: &str, uploaded: &Tiered<UploadResult>) {
    if uploaded.is_degraded() {
        tracing::info!(
            operation = operation,
            path = %uploaded.value.path,
            "Version content stored on fallback tier"
        );
    }
}
