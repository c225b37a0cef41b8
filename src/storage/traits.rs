//! Object backend trait.

use crate::Result;
use crate::models::{ObjectEntry, ObjectMetadata};
use async_trait::async_trait;
use tokio::io::AsyncRead;

/// Readable byte stream returned by downloads.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Uniform operations over one storage tier.
///
/// Keys are relative, `/`-separated paths produced by
/// [`crate::storage::generate_key`]. Implementations map their native error
/// shapes onto [`crate::Error`] so the facade can classify them.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Short backend name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Stores `bytes` under `path`. Existing objects are not overwritten.
    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    /// Reads the whole object.
    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    /// Opens the object as a byte stream.
    ///
    /// The default implementation buffers the whole object.
    async fn open_read(&self, path: &str) -> Result<ObjectReader> {
        let bytes = self.download(path).await?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    /// Removes the object. Removing an absent object succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Checks whether the object exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Returns object metadata, or `None` if absent.
    async fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>>;

    /// Creates a URL valid for `ttl_secs` seconds.
    async fn signed_url(&self, path: &str, ttl_secs: u64) -> Result<String>;

    /// Returns a permanent URL if the backend exposes one.
    fn public_url(&self, path: &str) -> Option<String>;

    /// Lists the direct entries under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<()>;
}
