//! Hosted object-store backend speaking the bucketed REST storage API.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | upload | `POST /storage/v1/object/{bucket}/{key}` (`x-upsert: false`) |
//! | download | `GET /storage/v1/object/{bucket}/{key}` |
//! | delete | `DELETE /storage/v1/object/{bucket}` with `{"prefixes": [key]}` |
//! | signed URL | `POST /storage/v1/object/sign/{bucket}/{key}` with `{"expiresIn": ttl}` |
//! | public URL | `/storage/v1/object/public/{bucket}/{key}` (no request) |
//! | list | `POST /storage/v1/object/list/{bucket}` |
//! | ping | `GET /storage/v1/bucket/{bucket}` |
//!
//! Transport failures, client-side timeouts included, map to [`Error::Transient`];
//! error statuses map to [`Error::Backend`] carrying the status code, so the
//! retry executor can tell a 503 from a 401.

use crate::models::{ObjectEntry, ObjectMetadata};
use crate::storage::keys::{split_key, validate_key};
use crate::storage::traits::ObjectBackend;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Default bucket name.
pub const DEFAULT_BUCKET: &str = "stowage-files";

/// Page size for list requests.
const LIST_LIMIT: u32 = 100;

/// Remote backend configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL of the storage service, e.g. `https://project.example.co`.
    pub url: String,
    /// Service key sent as bearer token and `apikey` header.
    pub api_key: SecretString,
    /// Bucket holding all objects.
    pub bucket: String,
    /// TCP connect timeout.
    pub connect_timeout_ms: u64,
}

impl RemoteConfig {
    /// Creates a configuration with the default bucket.
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            url: url.into(),
            api_key,
            bucket: DEFAULT_BUCKET.to_string(),
            connect_timeout_ms: 5_000,
        }
    }

    /// Sets the bucket.
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
    id: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    metadata: Option<ListedMetadata>,
}

#[derive(Debug, Deserialize)]
struct ListedMetadata {
    size: Option<u64>,
    mimetype: Option<String>,
    #[serde(rename = "eTag")]
    etag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "statusCode")]
    status_code: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

impl From<ListedObject> for ObjectEntry {
    fn from(object: ListedObject) -> Self {
        // Folder placeholders come back without an id or metadata.
        let metadata = object.id.as_ref().map(|id| {
            let listed = object.metadata.as_ref();
            ObjectMetadata {
                size: listed.and_then(|m| m.size).unwrap_or(0),
                content_type: listed.and_then(|m| m.mimetype.clone()),
                last_modified: object.updated_at.or(object.created_at),
                etag: listed
                    .and_then(|m| m.etag.clone())
                    .or_else(|| Some(id.clone())),
            }
        });
        Self {
            name: object.name,
            metadata,
        }
    }
}

/// Remote object-store backend.
pub struct RemoteBackend {
    client: reqwest::Client,
    base: Url,
    api_key: SecretString,
    bucket: String,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("base", &self.base.as_str())
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl RemoteBackend {
    /// Creates the backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unusable base URL or bucket.
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| Error::InvalidInput(format!("invalid remote url '{}': {e}", config.url)))?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!(
                "remote url cannot be a base: {}",
                config.url
            )));
        }
        if config.bucket.trim().is_empty() || config.bucket.contains('/') {
            return Err(Error::InvalidInput(format!(
                "invalid bucket name: '{}'",
                config.bucket
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| Error::OperationFailed {
                operation: "remote_init".to_string(),
                cause: e.to_string(),
            })?;
        tracing::info!(bucket = %config.bucket, "Remote storage initialized");
        Ok(Self {
            client,
            base,
            api_key: config.api_key,
            bucket: config.bucket,
        })
    }

    /// Returns the bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Builds `{base}/storage/v1/{segments...}/{key...}` with each segment
    /// percent-encoded.
    fn endpoint(&self, segments: &[&str], key: Option<&str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["storage", "v1"]).extend(segments);
            if let Some(key) = key {
                path.extend(key.split('/'));
            }
        }
        url
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let key = self.api_key.expose_secret();
        request.bearer_auth(key).header("apikey", key)
    }

    async fn send(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| transport_error(operation, &e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let err = status_error(operation, status.as_u16(), &body);
        tracing::debug!(
            backend = "remote",
            operation = operation,
            status = status.as_u16(),
            error = %err,
            "Remote storage returned error status"
        );
        Err(err)
    }

    async fn find(&self, operation: &str, path: &str) -> Result<Option<ObjectEntry>> {
        validate_key(path)?;
        let (prefix, name) = split_key(path);
        let entries = self.list_page(operation, prefix, Some(name)).await?;
        Ok(entries.into_iter().find(|entry| entry.name == name))
    }

    async fn list_page(
        &self,
        operation: &str,
        prefix: &str,
        search: Option<&str>,
    ) -> Result<Vec<ObjectEntry>> {
        let body = serde_json::json!({
            "prefix": prefix,
            "limit": LIST_LIMIT,
            "offset": 0,
            "search": search.unwrap_or_default(),
            "sortBy": { "column": "name", "order": "asc" },
        });
        let response = self
            .send(
                operation,
                self.client
                    .post(self.endpoint(&["object", "list", &self.bucket], None))
                    .json(&body),
            )
            .await?;
        let listed: Vec<ListedObject> = response
            .json()
            .await
            .map_err(|e| decode_error(operation, &e))?;
        Ok(listed.into_iter().map(ObjectEntry::from).collect())
    }

    fn absolute_signed_url(&self, signed: &str) -> String {
        if signed.starts_with("http://") || signed.starts_with("https://") {
            return signed.to_string();
        }
        let base = self.base.as_str().trim_end_matches('/');
        format!("{base}/storage/v1/{}", signed.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        validate_key(path)?;
        let content_type = if content_type.is_empty() {
            "application/octet-stream"
        } else {
            content_type
        };
        self.send(
            "upload",
            self.client
                .post(self.endpoint(&["object", &self.bucket], Some(path)))
                .header("content-type", content_type)
                .header("cache-control", "max-age=3600")
                .header("x-upsert", "false")
                .body(bytes.to_vec()),
        )
        .await?;
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        validate_key(path)?;
        let response = self
            .send(
                "download",
                self.client
                    .get(self.endpoint(&["object", &self.bucket], Some(path))),
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error("download", &e))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_key(path)?;
        self.send(
            "delete",
            self.client
                .delete(self.endpoint(&["object", &self.bucket], None))
                .json(&serde_json::json!({ "prefixes": [path] })),
        )
        .await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.find("exists", path).await?.is_some())
    }

    async fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        Ok(self
            .find("metadata", path)
            .await?
            .and_then(|entry| entry.metadata))
    }

    async fn signed_url(&self, path: &str, ttl_secs: u64) -> Result<String> {
        validate_key(path)?;
        let response = self
            .send(
                "signed_url",
                self.client
                    .post(self.endpoint(&["object", "sign", &self.bucket], Some(path)))
                    .json(&serde_json::json!({ "expiresIn": ttl_secs })),
            )
            .await?;
        let signed: SignedUrlResponse = response
            .json()
            .await
            .map_err(|e| decode_error("signed_url", &e))?;
        Ok(self.absolute_signed_url(&signed.signed_url))
    }

    fn public_url(&self, path: &str) -> Option<String> {
        validate_key(path).ok()?;
        Some(
            self.endpoint(&["object", "public", &self.bucket], Some(path))
                .to_string(),
        )
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        self.list_page("list", prefix.trim_matches('/'), None).await
    }

    async fn ping(&self) -> Result<()> {
        self.send(
            "ping",
            self.client
                .get(self.endpoint(&["bucket", &self.bucket], None)),
        )
        .await?;
        Ok(())
    }
}

fn transport_error(operation: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Transient {
            operation: operation.to_string(),
            cause: format!("request timed out: {e}"),
        }
    } else if e.is_connect() || e.is_request() || e.is_body() {
        Error::Transient {
            operation: operation.to_string(),
            cause: format!("connection error: {e}"),
        }
    } else {
        Error::Backend {
            operation: operation.to_string(),
            status: e.status().map(|s| s.as_u16()),
            cause: e.to_string(),
        }
    }
}

fn decode_error(operation: &str, e: &reqwest::Error) -> Error {
    Error::Backend {
        operation: operation.to_string(),
        status: None,
        cause: format!("unexpected response body: {e}"),
    }
}

/// Maps an error response onto [`Error::Backend`].
///
/// The storage API sometimes answers 400 with the real status in the JSON
/// body (`{"statusCode": "404", "error": "not_found"}`); that inner status
/// wins when present.
fn status_error(operation: &str, status: u16, body: &str) -> Error {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    let effective = parsed
        .as_ref()
        .and_then(|b| b.status_code.as_deref())
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(status);
    let cause = parsed
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("HTTP {status}")
            } else {
                body.chars().take(200).collect()
            }
        });
    Error::Backend {
        operation: operation.to_string(),
        status: Some(effective),
        cause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> RemoteBackend {
        RemoteBackend::new(
            RemoteConfig::new(
                "https://project.example.co/",
                SecretString::from("service-key".to_string()),
            )
            .with_bucket("files"),
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint_building() {
        let backend = backend();
        assert_eq!(
            backend
                .endpoint(&["object", "files"], Some("u/2024/01/a b.txt"))
                .as_str(),
            "https://project.example.co/storage/v1/object/files/u/2024/01/a%20b.txt"
        );
        assert_eq!(
            backend.endpoint(&["object", "list", "files"], None).as_str(),
            "https://project.example.co/storage/v1/object/list/files"
        );
    }

    #[test]
    fn test_public_url() {
        let backend = backend();
        assert_eq!(
            backend.public_url("u/a.pdf").as_deref(),
            Some("https://project.example.co/storage/v1/object/public/files/u/a.pdf")
        );
        assert!(backend.public_url("../a.pdf").is_none());
    }

    #[test]
    fn test_absolute_signed_url() {
        let backend = backend();
        assert_eq!(
            backend.absolute_signed_url("/object/sign/files/u/a.pdf?token=abc"),
            "https://project.example.co/storage/v1/object/sign/files/u/a.pdf?token=abc"
        );
        assert_eq!(
            backend.absolute_signed_url("https://cdn.example.com/x?token=1"),
            "https://cdn.example.com/x?token=1"
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let key = SecretString::from("k".to_string());
        assert!(RemoteBackend::new(RemoteConfig::new("not a url", key.clone())).is_err());
        assert!(
            RemoteBackend::new(RemoteConfig::new("https://x.example", key).with_bucket("a/b"))
                .is_err()
        );
    }

    #[test]
    fn test_status_error_prefers_body_status() {
        let err = status_error(
            "download",
            400,
            r#"{"statusCode":"404","error":"not_found","message":"Object not found"}"#,
        );
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Object not found"));
    }

    #[test]
    fn test_status_error_classification() {
        assert!(status_error("upload", 503, "").is_retryable());
        assert!(status_error("upload", 429, "slow down").is_retryable());
        assert!(!status_error("upload", 401, r#"{"message":"invalid jwt"}"#).is_retryable());
        assert!(!status_error("upload", 409, r#"{"error":"Duplicate"}"#).is_retryable());
    }

    #[test]
    fn test_listed_object_conversion() {
        let listed: Vec<ListedObject> = serde_json::from_str(
            r#"[
                {"name": "2024", "id": null, "updated_at": null, "created_at": null, "metadata": null},
                {"name": "a.pdf", "id": "obj-1", "updated_at": "2024-01-02T03:04:05.000Z",
                 "created_at": "2024-01-01T00:00:00Z",
                 "metadata": {"size": 42, "mimetype": "application/pdf", "eTag": "\"abc\""}}
            ]"#,
        )
        .unwrap();
        let entries: Vec<ObjectEntry> = listed.into_iter().map(ObjectEntry::from).collect();
        assert!(entries[0].metadata.is_none());
        let meta = entries[1].metadata.as_ref().unwrap();
        assert_eq!(meta.size, 42);
        assert_eq!(meta.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(meta.etag.as_deref(), Some("\"abc\""));
        assert!(meta.last_modified.is_some());
    }

    #[test]
    fn test_debug_hides_key() {
        let rendered = format!("{:?}", backend());
        assert!(!rendered.contains("service-key"));
    }
}
