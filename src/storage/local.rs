//! Local filesystem backend.
//!
//! Objects live under a single root directory. Every path is resolved against
//! the canonicalized root and checked to stay inside it before any I/O, so a
//! symlink planted inside the tree cannot redirect reads or writes elsewhere.
//!
//! Writes go to a temporary sibling first and are renamed into place, so a
//! crash never leaves a half-written object under its final key.

use crate::models::{ObjectEntry, ObjectMetadata};
use crate::storage::keys::validate_key;
use crate::storage::traits::{ObjectBackend, ObjectReader};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Default URL prefix for locally served objects.
pub const DEFAULT_LOCAL_URL_PREFIX: &str = "/api/storage/files";

/// Rooted local directory backend.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    url_prefix: String,
}

impl LocalBackend {
    /// Creates the backend, creating `root` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LocalIo`] if the root cannot be created or resolved.
    pub fn new(root: impl AsRef<Path>, url_prefix: impl Into<String>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| Error::local_io("init", &e))?;
        let root = root
            .canonicalize()
            .map_err(|e| Error::local_io("init", &e))?;
        let url_prefix = url_prefix.into().trim_end_matches('/').to_string();
        tracing::info!(root = %root.display(), "Local storage initialized");
        Ok(Self { root, url_prefix })
    }

    /// Returns the canonical root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{key}", self.url_prefix)
    }

    fn ensure_inside(&self, operation: &str, resolved: &Path) -> Result<()> {
        if resolved.starts_with(&self.root) {
            Ok(())
        } else {
            tracing::warn!(
                operation = operation,
                path = %resolved.display(),
                "Rejected path outside storage root"
            );
            Err(Error::LocalIo {
                operation: operation.to_string(),
                cause: "path resolves outside the storage root".to_string(),
            })
        }
    }

    /// Resolves an existing object. `Ok(None)` when it does not exist.
    async fn resolve_existing(&self, operation: &str, key: &str) -> Result<Option<PathBuf>> {
        validate_key(key)?;
        match tokio::fs::canonicalize(self.root.join(key)).await {
            Ok(resolved) => {
                self.ensure_inside(operation, &resolved)?;
                Ok(Some(resolved))
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::local_io(operation, &e)),
        }
    }
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn upload(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        validate_key(path)?;
        let target = self.root.join(path);
        let (Some(parent), Some(file_name)) = (target.parent(), target.file_name()) else {
            return Err(Error::InvalidInput(format!("storage key has no file name: {path}")));
        };
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::local_io("upload", &e))?;
        let parent = tokio::fs::canonicalize(parent)
            .await
            .map_err(|e| Error::local_io("upload", &e))?;
        self.ensure_inside("upload", &parent)?;

        let target = parent.join(file_name);
        if tokio::fs::try_exists(&target)
            .await
            .map_err(|e| Error::local_io("upload", &e))?
        {
            return Err(Error::LocalIo {
                operation: "upload".to_string(),
                cause: format!("object already exists: {path}"),
            });
        }

        let temp = parent.join(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            uuid::Uuid::new_v4().simple()
        ));
        let written = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp, &target).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Error::local_io("upload", &e));
        }

        tracing::debug!(path = path, size = bytes.len(), "Stored object locally");
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let resolved = self
            .resolve_existing("download", path)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        tokio::fs::read(&resolved)
            .await
            .map_err(|e| Error::local_io("download", &e))
    }

    async fn open_read(&self, path: &str) -> Result<ObjectReader> {
        let resolved = self
            .resolve_existing("download", path)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let file = tokio::fs::File::open(&resolved)
            .await
            .map_err(|e| Error::local_io("download", &e))?;
        Ok(Box::new(file))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let Some(resolved) = self.resolve_existing("delete", path).await? else {
            return Ok(());
        };
        match tokio::fs::remove_file(&resolved).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::local_io("delete", &e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let Some(resolved) = self.resolve_existing("exists", path).await? else {
            return Ok(false);
        };
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| Error::local_io("exists", &e))?;
        Ok(metadata.is_file())
    }

    async fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        let Some(resolved) = self.resolve_existing("metadata", path).await? else {
            return Ok(None);
        };
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| Error::local_io("metadata", &e))?;
        if !metadata.is_file() {
            return Ok(None);
        }
        Ok(Some(ObjectMetadata {
            size: metadata.len(),
            content_type: Some(content_type_for(path).to_string()),
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            etag: None,
        }))
    }

    async fn signed_url(&self, path: &str, _ttl_secs: u64) -> Result<String> {
        validate_key(path)?;
        Ok(self.url_for(path))
    }

    fn public_url(&self, path: &str) -> Option<String> {
        validate_key(path).ok().map(|()| self.url_for(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let prefix = prefix.trim_matches('/');
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            match self.resolve_existing("list", prefix).await? {
                Some(dir) => dir,
                None => return Ok(Vec::new()),
            }
        };

        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::local_io("list", &e)),
        };
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| Error::local_io("list", &e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.ends_with(".tmp") {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .ok()
                .filter(std::fs::Metadata::is_file)
                .map(|m| ObjectMetadata {
                    size: m.len(),
                    content_type: Some(content_type_for(&name).to_string()),
                    last_modified: m.modified().ok().map(DateTime::<Utc>::from),
                    etag: None,
                });
            entries.push(ObjectEntry { name, metadata });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn ping(&self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| Error::local_io("ping", &e))?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(Error::LocalIo {
                operation: "ping".to_string(),
                cause: "storage root is not a directory".to_string(),
            })
        }
    }
}

/// Infers a MIME type from the key's extension.
#[must_use]
pub fn content_type_for(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "json" => "application/json",
        "zip" => "application/zip",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
