//! Storage facade with circuit breaking, retries and local fallback.
//!
//! Every remote-backed operation follows the same path:
//!
//! 1. Ask the [`CircuitBreaker`] for a permit. A rejection is recorded with
//!    the [`OperationMonitor`] and the call goes straight to the local tier.
//! 2. Run the remote call under the [`RetryExecutor`], each attempt raced
//!    against the per-call timeout.
//! 3. On success, record it with the breaker and the monitor.
//! 4. On failure, record it, then re-run the same logical operation against
//!    the local tier. Only a local failure is surfaced to the caller.
//!
//! Results are wrapped in [`Tiered`] so callers can tell degraded service
//! from normal service. Without a remote backend the facade runs local-only
//! and the local tier is reported as [`Tier::Primary`].
//!
//! A "not found" answer to a lookup proves the backend is reachable, so it
//! never counts as a breaker failure. A 404 on upload does count, since it
//! points at a missing bucket rather than a missing object.

use crate::config::{BackendSelector, StowageConfig};
use crate::models::{HealthReport, HealthStatus, ObjectMetadata, Tier, Tiered, UploadResult};
use crate::resilience::{
    Alert, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, MonitorConfig, MonitorMetrics,
    OperationKind, OperationMonitor, RetryExecutor, RetryPolicy,
};
use crate::storage::cdn::CdnRewriter;
use crate::storage::keys::{generate_key, validate_key};
use crate::storage::local::LocalBackend;
use crate::storage::remote::RemoteBackend;
use crate::storage::traits::{ObjectBackend, ObjectReader};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast;

/// Default per-call timeout for remote operations.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default lifetime of signed download URLs.
pub const DEFAULT_URL_TTL_SECS: u64 = 3600;

/// Outcome of one guarded remote operation.
enum Remote<T> {
    Done(T),
    Missing(Error),
    Unavailable(Error),
}

/// Resilient two-tier object storage.
pub struct StorageFacade {
    remote: Option<Arc<dyn ObjectBackend>>,
    local: Arc<dyn ObjectBackend>,
    breaker: CircuitBreaker,
    retry: RetryExecutor,
    monitor: OperationMonitor,
    call_timeout: Duration,
    cdn: Option<CdnRewriter>,
}

impl std::fmt::Debug for StorageFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageFacade")
            .field("remote", &self.remote.as_ref().map(|r| r.name()))
            .field("local", &self.local.name())
            .field("call_timeout", &self.call_timeout)
            .field("cdn", &self.cdn)
            .finish_non_exhaustive()
    }
}

impl StorageFacade {
    /// Creates a facade over `local` and an optional `remote` backend, with
    /// default breaker, retry and monitor settings.
    #[must_use]
    pub fn new(local: Arc<dyn ObjectBackend>, remote: Option<Arc<dyn ObjectBackend>>) -> Self {
        let backend_name = remote.as_ref().map_or("local", |r| r.name());
        Self {
            remote,
            local,
            breaker: CircuitBreaker::new(&CircuitBreakerConfig::default(), backend_name),
            retry: RetryExecutor::new(RetryPolicy::default()),
            monitor: OperationMonitor::new(MonitorConfig::default()),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            cdn: None,
        }
    }

    /// Builds a facade from configuration.
    ///
    /// A remote backend is selected but missing its URL or key, or failing to
    /// initialize, degrades to local-only operation with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the local root cannot be created or the CDN origin
    /// is invalid.
    pub fn from_config(config: &StowageConfig) -> Result<Self> {
        let storage = &config.storage;
        let local = LocalBackend::new(&storage.local_path, storage.local_url_prefix.clone())?;

        let remote: Option<Arc<dyn ObjectBackend>> = match storage.backend {
            BackendSelector::Local => None,
            BackendSelector::Remote => match storage.remote_config() {
                None => {
                    tracing::warn!(
                        "Remote storage credentials not found, falling back to local storage"
                    );
                    None
                },
                Some(remote_config) => match RemoteBackend::new(remote_config) {
                    Ok(remote) => Some(Arc::new(remote)),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to initialize remote storage");
                        tracing::warn!("Falling back to local storage");
                        None
                    },
                },
            },
        };

        let backend_name = remote.as_ref().map_or("local", |r| r.name());
        let mut facade = Self::new(Arc::new(local), remote)
            .with_circuit_breaker(CircuitBreaker::new(&config.circuit_breaker, backend_name))
            .with_retry_executor(RetryExecutor::new(config.retry.clone()))
            .with_monitor(OperationMonitor::new(config.monitor.clone()))
            .with_call_timeout(Duration::from_millis(storage.call_timeout_ms));
        if let Some(origin) = &storage.cdn_origin {
            facade = facade.with_cdn(CdnRewriter::new(origin)?);
        }
        Ok(facade)
    }

    /// Replaces the circuit breaker.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    /// Replaces the retry executor.
    #[must_use]
    pub fn with_retry_executor(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the operation monitor.
    #[must_use]
    pub fn with_monitor(mut self, monitor: OperationMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Sets the per-call timeout for remote operations.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Rewrites remote download URLs onto a CDN origin.
    #[must_use]
    pub fn with_cdn(mut self, cdn: CdnRewriter) -> Self {
        self.cdn = Some(cdn);
        self
    }

    /// Returns `true` when no remote backend is configured.
    #[must_use]
    pub fn is_local_only(&self) -> bool {
        self.remote.is_none()
    }

    /// Name of the primary backend.
    #[must_use]
    pub fn primary_backend(&self) -> &'static str {
        self.remote.as_ref().map_or_else(|| self.local.name(), |r| r.name())
    }

    /// Returns the circuit breaker.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Returns the operation monitor.
    #[must_use]
    pub const fn monitor(&self) -> &OperationMonitor {
        &self.monitor
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Uploads a stream under a freshly generated key.
    ///
    /// The stream is buffered so retries and the local fallback can replay it.
    pub async fn upload<R>(
        &self,
        mut reader: R,
        owner_id: &str,
        filename: &str,
        content_type: &str,
    ) -> Result<Tiered<UploadResult>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| Error::OperationFailed {
                operation: "read_upload".to_string(),
                cause: e.to_string(),
            })?;
        self.upload_bytes(&bytes, owner_id, filename, content_type)
            .await
    }

    /// Uploads a buffer under a freshly generated key.
    ///
    /// The key is generated once; a fallback upload reuses it.
    pub async fn upload_bytes(
        &self,
        bytes: &[u8],
        owner_id: &str,
        filename: &str,
        content_type: &str,
    ) -> Result<Tiered<UploadResult>> {
        let key = generate_key(owner_id, filename)?;
        let size = bytes.len() as u64;

        if let Some(remote) = &self.remote {
            match self
                .guarded(OperationKind::Upload, || {
                    remote.upload(&key.path, bytes, content_type)
                })
                .await
            {
                Remote::Done(()) => {
                    return Ok(Tiered::primary(UploadResult {
                        public_url: remote.public_url(&key.path),
                        path: key.path,
                        display_name: key.display_name,
                        size,
                    }));
                },
                Remote::Missing(e) | Remote::Unavailable(e) => {
                    self.note_fallback(OperationKind::Upload, &key.path, &e);
                },
            }
        }

        let tier = self.local_tier();
        self.run_local(
            OperationKind::Upload,
            tier,
            self.local.upload(&key.path, bytes, content_type),
        )
        .await?;
        Ok(Tiered {
            tier,
            value: UploadResult {
                public_url: self.local.public_url(&key.path),
                path: key.path,
                display_name: key.display_name,
                size,
            },
        })
    }

    /// Opens an object as a byte stream.
    pub async fn download(&self, path: &str) -> Result<Tiered<ObjectReader>> {
        validate_key(path)?;
        if let Some(remote) = &self.remote {
            match self
                .guarded(OperationKind::Download, || remote.open_read(path))
                .await
            {
                Remote::Done(reader) => return Ok(Tiered::primary(reader)),
                Remote::Missing(e) | Remote::Unavailable(e) => {
                    self.note_fallback(OperationKind::Download, path, &e);
                },
            }
        }
        let tier = self.local_tier();
        let reader = self
            .run_local(OperationKind::Download, tier, self.local.open_read(path))
            .await?;
        Ok(Tiered { tier, value: reader })
    }

    /// Reads a whole object into memory.
    pub async fn download_as_buffer(&self, path: &str) -> Result<Tiered<Vec<u8>>> {
        validate_key(path)?;
        if let Some(remote) = &self.remote {
            match self
                .guarded(OperationKind::Download, || remote.download(path))
                .await
            {
                Remote::Done(bytes) => return Ok(Tiered::primary(bytes)),
                Remote::Missing(e) | Remote::Unavailable(e) => {
                    self.note_fallback(OperationKind::Download, path, &e);
                },
            }
        }
        let tier = self.local_tier();
        let bytes = self
            .run_local(OperationKind::Download, tier, self.local.download(path))
            .await?;
        Ok(Tiered { tier, value: bytes })
    }

    /// Deletes an object. Deleting an absent object succeeds.
    ///
    /// After a remote delete any local copy under the same key is removed too,
    /// since uploads made during an outage land there.
    pub async fn delete_file(&self, path: &str) -> Result<Tiered<bool>> {
        validate_key(path)?;
        if let Some(remote) = &self.remote {
            match self
                .guarded(OperationKind::Delete, || remote.delete(path))
                .await
            {
                Remote::Done(()) | Remote::Missing(_) => {
                    if let Err(e) = self.local.delete(path).await {
                        tracing::debug!(path = path, error = %e, "Local copy cleanup failed");
                    }
                    return Ok(Tiered::primary(true));
                },
                Remote::Unavailable(e) => {
                    self.note_fallback(OperationKind::Delete, path, &e);
                },
            }
        }
        let tier = self.local_tier();
        self.run_local(OperationKind::Delete, tier, self.local.delete(path))
            .await?;
        Ok(Tiered { tier, value: true })
    }

    /// Returns a time-boxed download URL.
    ///
    /// A key held only by the local tier, such as one uploaded during an
    /// outage, gets the local URL. When signing fails for any other reason the
    /// remote public URL is used, then the local one. Remote URLs are
    /// rewritten onto the CDN origin when one is configured. A key missing on
    /// both tiers yields `None`.
    pub async fn get_download_url(
        &self,
        path: &str,
        ttl_secs: u64,
    ) -> Result<Tiered<Option<String>>> {
        validate_key(path)?;
        let Some(remote) = &self.remote else {
            return Ok(Tiered::primary(self.local.public_url(path)));
        };

        match self
            .guarded(OperationKind::SignedUrl, || remote.signed_url(path, ttl_secs))
            .await
        {
            Remote::Done(url) => Ok(Tiered::primary(Some(self.rewrite(&url)))),
            Remote::Missing(_) => {
                // Objects uploaded during an outage only exist locally.
                if self.local.exists(path).await.unwrap_or(false) {
                    Ok(Tiered::fallback(self.local.public_url(path)))
                } else {
                    Ok(Tiered::primary(None))
                }
            },
            Remote::Unavailable(e) => {
                self.note_fallback(OperationKind::SignedUrl, path, &e);
                if self.local.exists(path).await.unwrap_or(false) {
                    return Ok(Tiered::fallback(self.local.public_url(path)));
                }
                let url = remote
                    .public_url(path)
                    .map(|url| self.rewrite(&url))
                    .or_else(|| self.local.public_url(path));
                Ok(Tiered::fallback(url))
            },
        }
    }

    /// Checks whether an object exists on either tier.
    pub async fn file_exists(&self, path: &str) -> Result<Tiered<bool>> {
        validate_key(path)?;
        if let Some(remote) = &self.remote {
            match self
                .guarded(OperationKind::Exists, || remote.exists(path))
                .await
            {
                Remote::Done(true) => return Ok(Tiered::primary(true)),
                Remote::Done(false) | Remote::Missing(_) => {
                    // Objects uploaded during an outage only exist locally.
                    let local = self.local.exists(path).await.unwrap_or(false);
                    return Ok(if local {
                        Tiered::fallback(true)
                    } else {
                        Tiered::primary(false)
                    });
                },
                Remote::Unavailable(e) => {
                    self.note_fallback(OperationKind::Exists, path, &e);
                },
            }
        }
        let tier = self.local_tier();
        let exists = self
            .run_local(OperationKind::Exists, tier, self.local.exists(path))
            .await?;
        Ok(Tiered { tier, value: exists })
    }

    /// Returns object metadata from whichever tier holds the object.
    pub async fn get_metadata(&self, path: &str) -> Result<Tiered<Option<ObjectMetadata>>> {
        validate_key(path)?;
        if let Some(remote) = &self.remote {
            match self
                .guarded(OperationKind::Metadata, || remote.metadata(path))
                .await
            {
                Remote::Done(Some(meta)) => return Ok(Tiered::primary(Some(meta))),
                Remote::Done(None) | Remote::Missing(_) => {
                    let local = self.local.metadata(path).await.ok().flatten();
                    return Ok(match local {
                        Some(meta) => Tiered::fallback(Some(meta)),
                        None => Tiered::primary(None),
                    });
                },
                Remote::Unavailable(e) => {
                    self.note_fallback(OperationKind::Metadata, path, &e);
                },
            }
        }
        let tier = self.local_tier();
        let meta = self
            .run_local(OperationKind::Metadata, tier, self.local.metadata(path))
            .await?;
        Ok(Tiered { tier, value: meta })
    }

    /// Probes the primary backend.
    ///
    /// The probe bypasses the breaker and retries so it reports the backend's
    /// actual reachability.
    pub async fn check_health(&self) -> HealthReport {
        let start = Instant::now();
        let backend = self.primary_backend().to_string();
        let primary = self.remote.as_ref().unwrap_or(&self.local);
        let result = self
            .timed(OperationKind::Health, primary.ping())
            .await;
        let latency_ms = elapsed_ms(start);
        self.monitor.record_operation(
            OperationKind::Health,
            result.is_ok(),
            latency_ms,
            result.as_ref().err().map(ToString::to_string).as_deref(),
        );

        let circuit = self.breaker.state();
        let status = match &result {
            Ok(()) if circuit == crate::resilience::CircuitState::Closed => HealthStatus::Healthy,
            Ok(()) => HealthStatus::Degraded,
            Err(_) if self.remote.is_some() && self.local.ping().await.is_ok() => {
                HealthStatus::Degraded
            },
            Err(_) => HealthStatus::Unhealthy,
        };
        HealthReport {
            status,
            latency_ms,
            backend,
            circuit,
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Returns a breaker snapshot.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Returns monitor metrics.
    #[must_use]
    pub fn monitor_metrics(&self) -> MonitorMetrics {
        self.monitor.metrics()
    }

    /// Forces the breaker closed (operator action).
    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }

    /// Subscribes to failure-rate alerts.
    #[must_use]
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.monitor.subscribe()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    const fn local_tier(&self) -> Tier {
        if self.remote.is_some() {
            Tier::Fallback
        } else {
            Tier::Primary
        }
    }

    fn rewrite(&self, url: &str) -> String {
        self.cdn
            .as_ref()
            .map_or_else(|| url.to_string(), |cdn| cdn.rewrite(url))
    }

    async fn timed<T>(
        &self,
        kind: OperationKind,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Timeout {
                operation: kind.as_str().to_string(),
                after_ms: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Runs a remote call behind the breaker, the retry loop and the timeout.
    async fn guarded<T, F, Fut>(&self, kind: OperationKind, op: F) -> Remote<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backend = self.breaker.backend_name();
        let permit = self.breaker.can_execute();
        if !permit.allowed {
            let err = Error::CircuitOpen {
                retry_after_secs: permit.retry_after_secs.unwrap_or(1),
            };
            let reason = permit.reason.unwrap_or_else(|| err.to_string());
            self.monitor
                .record_operation(kind, false, 0, Some(reason.as_str()));
            metrics::counter!(
                "storage_circuit_breaker_rejections_total",
                "operation" => kind.as_str()
            )
            .increment(1);
            return Remote::Unavailable(err);
        }
        if permit.half_open {
            tracing::debug!(backend = backend, operation = kind.as_str(), "Sending probe");
        }

        let start = Instant::now();
        let result = self
            .retry
            .retry_with_backoff(kind.as_str(), || self.timed(kind, op()))
            .await;
        let latency_ms = elapsed_ms(start);

        match result {
            Ok(value) => {
                self.breaker.record_success();
                self.monitor.record_operation(kind, true, latency_ms, None);
                record_request(backend, kind, "success", latency_ms);
                Remote::Done(value)
            },
            Err(e) if e.is_not_found() && missing_is_answer(kind) => {
                self.breaker.record_success();
                self.monitor.record_operation(kind, true, latency_ms, None);
                record_request(backend, kind, "not_found", latency_ms);
                Remote::Missing(e)
            },
            Err(e) => {
                self.breaker.record_failure();
                let message = e.to_string();
                self.monitor
                    .record_operation(kind, false, latency_ms, Some(message.as_str()));
                record_request(backend, kind, "error", latency_ms);
                Remote::Unavailable(e)
            },
        }
    }

    /// Runs a local call. Fallback successes are not recorded with the
    /// monitor, since the remote failure that caused them already was.
    async fn run_local<T>(
        &self,
        kind: OperationKind,
        tier: Tier,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let backend = self.local.name();
        let start = Instant::now();
        let result = fut.await;
        let latency_ms = elapsed_ms(start);

        match &result {
            Ok(_) => {
                record_request(backend, kind, "success", latency_ms);
                if tier == Tier::Primary {
                    self.monitor.record_operation(kind, true, latency_ms, None);
                }
            },
            Err(e) if e.is_not_found() => {
                record_request(backend, kind, "not_found", latency_ms);
                if tier == Tier::Primary {
                    self.monitor.record_operation(kind, true, latency_ms, None);
                }
            },
            Err(e) => {
                record_request(backend, kind, "error", latency_ms);
                let message = e.to_string();
                self.monitor
                    .record_operation(kind, false, latency_ms, Some(message.as_str()));
                tracing::error!(
                    backend = backend,
                    operation = kind.as_str(),
                    tier = tier.as_str(),
                    error = %e,
                    "Local storage operation failed"
                );
            },
        }
        result
    }

    fn note_fallback(&self, kind: OperationKind, path: &str, cause: &Error) {
        if cause.is_not_found() && missing_is_answer(kind) {
            tracing::debug!(
                operation = kind.as_str(),
                path = path,
                "Object missing remotely, checking local tier"
            );
        } else {
            tracing::warn!(
                backend = self.breaker.backend_name(),
                operation = kind.as_str(),
                path = path,
                error = %cause,
                tier = Tier::Fallback.as_str(),
                "Remote storage unavailable, serving from local tier"
            );
        }
        metrics::counter!("storage_fallbacks_total", "operation" => kind.as_str()).increment(1);
    }
}

fn record_request(backend: &'static str, kind: OperationKind, status: &'static str, latency_ms: u64) {
    metrics::counter!(
        "storage_requests_total",
        "backend" => backend,
        "operation" => kind.as_str(),
        "status" => status
    )
    .increment(1);
    #[allow(clippy::cast_precision_loss)]
    metrics::histogram!(
        "storage_request_duration_ms",
        "backend" => backend,
        "operation" => kind.as_str()
    )
    .record(latency_ms as f64);
}

/// Whether a remote "not found" is a valid answer for `kind`.
///
/// Lookups of a missing key prove the backend is reachable. An upload has no
/// object to look up, so a 404 there means a missing bucket or route.
const fn missing_is_answer(kind: OperationKind) -> bool {
    matches!(
        kind,
        OperationKind::Download
            | OperationKind::Delete
            | OperationKind::Exists
            | OperationKind::Metadata
            | OperationKind::SignedUrl
    )
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObjectEntry;
    use crate::resilience::CircuitState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Remote double that fails every call with a configurable error.
    struct FailingRemote {
        calls: AtomicU32,
        error: fn() -> Error,
    }

    impl FailingRemote {
        fn new(error: fn() -> Error) -> Self {
            Self {
                calls: AtomicU32::new(0),
                error,
            }
        }

        fn fail<T>(&self) -> Result<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    #[async_trait]
    impl ObjectBackend for FailingRemote {
        fn name(&self) -> &'static str {
            "remote"
        }
        async fn upload(&self, _: &str, _: &[u8], _: &str) -> Result<()> {
            self.fail()
        }
        async fn download(&self, _: &str) -> Result<Vec<u8>> {
            self.fail()
        }
        async fn delete(&self, _: &str) -> Result<()> {
            self.fail()
        }
        async fn exists(&self, _: &str) -> Result<bool> {
            self.fail()
        }
        async fn metadata(&self, _: &str) -> Result<Option<ObjectMetadata>> {
            self.fail()
        }
        async fn signed_url(&self, _: &str, _: u64) -> Result<String> {
            self.fail()
        }
        fn public_url(&self, path: &str) -> Option<String> {
            Some(format!("https://origin.example/public/{path}"))
        }
        async fn list(&self, _: &str) -> Result<Vec<ObjectEntry>> {
            self.fail()
        }
        async fn ping(&self) -> Result<()> {
            self.fail()
        }
    }

    fn unavailable() -> Error {
        Error::Backend {
            operation: "test".to_string(),
            status: Some(503),
            cause: "unavailable".to_string(),
        }
    }

    fn unauthorized() -> Error {
        Error::Backend {
            operation: "test".to_string(),
            status: Some(401),
            cause: "invalid key".to_string(),
        }
    }

    fn fast_retry() -> RetryExecutor {
        RetryExecutor::with_seed(
            RetryPolicy::default()
                .with_initial_delay_ms(1)
                .with_max_delay_ms(2),
            7,
        )
    }

    fn facade(dir: &TempDir, remote: Option<Arc<FailingRemote>>) -> StorageFacade {
        let local = LocalBackend::new(dir.path(), "/files").unwrap();
        let remote = remote.map(|r| r as Arc<dyn ObjectBackend>);
        StorageFacade::new(Arc::new(local), remote).with_retry_executor(fast_retry())
    }

    #[tokio::test]
    async fn test_local_only_reports_primary_tier() {
        let dir = TempDir::new().unwrap();
        let storage = facade(&dir, None);
        assert!(storage.is_local_only());

        let stored = storage
            .upload_bytes(b"hello", "user-1", "notes.txt", "text/plain")
            .await
            .unwrap();
        assert_eq!(stored.tier, Tier::Primary);
        assert_eq!(stored.value.size, 5);
        assert!(stored.value.path.starts_with("user-1/"));
        assert_eq!(
            stored.value.public_url,
            Some(format!("/files/{}", stored.value.path))
        );

        let bytes = storage.download_as_buffer(&stored.value.path).await.unwrap();
        assert_eq!(bytes, Tiered::primary(b"hello".to_vec()));
        assert_eq!(storage.monitor_metrics().lifetime.total, 2);
    }

    #[tokio::test]
    async fn test_retryable_failure_falls_back_after_all_attempts() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FailingRemote::new(unavailable));
        let storage = facade(&dir, Some(Arc::clone(&remote)));

        let stored = storage
            .upload_bytes(b"data", "u", "a.bin", "application/octet-stream")
            .await
            .unwrap();
        assert!(stored.is_degraded());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 4);

        let local = storage.download_as_buffer(&stored.value.path).await.unwrap();
        assert_eq!(local.value, b"data");
        assert_eq!(local.tier, Tier::Fallback);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried_but_still_falls_back() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FailingRemote::new(unauthorized));
        let storage = facade(&dir, Some(Arc::clone(&remote)));

        let stored = storage
            .upload_bytes(b"x", "u", "a.txt", "text/plain")
            .await
            .unwrap();
        assert!(stored.is_degraded());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_remote() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FailingRemote::new(unauthorized));
        let storage = facade(&dir, Some(Arc::clone(&remote))).with_circuit_breaker(
            CircuitBreaker::new(&CircuitBreakerConfig::default().with_failure_threshold(2), "remote"),
        );

        for _ in 0..2 {
            storage
                .upload_bytes(b"x", "u", "a.txt", "text/plain")
                .await
                .unwrap();
        }
        assert_eq!(storage.circuit_state().state, CircuitState::Open);

        let before = remote.calls.load(Ordering::SeqCst);
        let stored = storage
            .upload_bytes(b"y", "u", "b.txt", "text/plain")
            .await
            .unwrap();
        assert!(stored.is_degraded());
        assert_eq!(remote.calls.load(Ordering::SeqCst), before);
        assert_eq!(storage.monitor_metrics().lifetime.failures, 3);

        storage.reset_circuit();
        assert_eq!(storage.circuit_state().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_download_url_falls_back_to_public_url_through_cdn() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FailingRemote::new(unauthorized));
        let storage = facade(&dir, Some(remote))
            .with_cdn(CdnRewriter::new("https://cdn.example.com").unwrap());

        let url = storage
            .get_download_url("u/2024/01/a.pdf", DEFAULT_URL_TTL_SECS)
            .await
            .unwrap();
        assert!(url.is_degraded());
        assert_eq!(
            url.value.as_deref(),
            Some("https://cdn.example.com/public/u/2024/01/a.pdf")
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_on_fallback() {
        let dir = TempDir::new().unwrap();
        let storage = facade(&dir, Some(Arc::new(FailingRemote::new(unauthorized))));
        let deleted = storage.delete_file("u/never-existed.txt").await.unwrap();
        assert!(deleted.value);
        assert!(deleted.is_degraded());
    }

    #[tokio::test]
    async fn test_missing_object_on_both_tiers_is_not_found() {
        let dir = TempDir::new().unwrap();
        let storage = facade(&dir, Some(Arc::new(FailingRemote::new(unavailable))));
        let err = storage.download_as_buffer("u/none.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected_before_io() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FailingRemote::new(unavailable));
        let storage = facade(&dir, Some(Arc::clone(&remote)));
        let err = storage.download_as_buffer("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_health_reports_degraded_when_remote_down() {
        let dir = TempDir::new().unwrap();
        let storage = facade(&dir, Some(Arc::new(FailingRemote::new(unavailable))));
        let report = storage.check_health().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.backend, "remote");
        assert!(report.error.is_some());

        let local_only = facade(&dir, None);
        assert_eq!(local_only.check_health().await.status, HealthStatus::Healthy);
    }
}
