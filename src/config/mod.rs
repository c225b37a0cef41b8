//! Configuration management.
//!
//! Configuration is read from a TOML file, then overridden by `STOWAGE_*`
//! environment variables. Every section has usable defaults, so a missing
//! file is not an error.

use crate::resilience::{CircuitBreakerConfig, HalfOpenPolicy, MonitorConfig, RetryPolicy};
use crate::storage::{DEFAULT_BUCKET, DEFAULT_LOCAL_URL_PREFIX, RemoteConfig};
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration for stowage.
#[derive(Debug, Clone, Default)]
pub struct StowageConfig {
    /// Object storage settings.
    pub storage: StorageSettings,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry settings.
    pub retry: RetryPolicy,
    /// Operation monitor settings.
    pub monitor: MonitorConfig,
    /// Versioning settings.
    pub versioning: VersioningSettings,
    /// Logging and metrics settings.
    pub observability: ObservabilitySettings,
}

/// Which backend serves as the primary tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelector {
    /// Hosted object store with local fallback.
    #[default]
    Remote,
    /// Local directory only.
    Local,
}

impl BackendSelector {
    /// Parses a selector string. Unknown values yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "remote" | "supabase" => Some(Self::Remote),
            "local" => Some(Self::Local),
            _ => None,
        }
    }

    /// Returns the selector name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

/// Object storage settings.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Primary backend.
    pub backend: BackendSelector,
    /// Root of the local tier.
    pub local_path: PathBuf,
    /// URL prefix for local objects.
    pub local_url_prefix: String,
    /// Per-call timeout for remote operations.
    pub call_timeout_ms: u64,
    /// Optional CDN origin for download URLs.
    pub cdn_origin: Option<String>,
    /// Remote credentials.
    pub remote: RemoteSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: BackendSelector::Remote,
            local_path: PathBuf::from("./uploads"),
            local_url_prefix: DEFAULT_LOCAL_URL_PREFIX.to_string(),
            call_timeout_ms: 30_000,
            cdn_origin: None,
            remote: RemoteSettings::default(),
        }
    }
}

impl StorageSettings {
    /// Returns the remote configuration, or `None` if the URL or key is
    /// missing.
    #[must_use]
    pub fn remote_config(&self) -> Option<RemoteConfig> {
        let url = self.remote.url.as_deref().filter(|u| !u.trim().is_empty())?;
        let key = self
            .remote
            .api_key
            .as_ref()
            .filter(|k| !k.expose_secret().trim().is_empty())?;
        Some(RemoteConfig::new(url, key.clone()).with_bucket(self.remote.bucket.clone()))
    }
}

/// Remote object store credentials.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    /// Service base URL.
    pub url: Option<String>,
    /// Service key.
    pub api_key: Option<SecretString>,
    /// Bucket name.
    pub bucket: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            bucket: DEFAULT_BUCKET.to_string(),
        }
    }
}

/// Versioning settings.
#[derive(Debug, Clone)]
pub struct VersioningSettings {
    /// Path of the `SQLite` version database.
    pub database: PathBuf,
    /// Versions kept by retention pruning.
    pub keep_versions: usize,
}

impl Default for VersioningSettings {
    fn default() -> Self {
        Self {
            database: default_data_dir().join("stowage.db"),
            keep_versions: crate::services::DEFAULT_KEEP_VERSIONS,
        }
    }
}

/// Observability settings as read from the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObservabilitySettings {
    /// Logging section.
    pub logging: Option<LoggingSettings>,
    /// Metrics section.
    pub metrics: Option<MetricsSettings>,
}

/// Logging section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingSettings {
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// Filter directive, e.g. `info` or `stowage=debug`.
    pub level: Option<String>,
    /// Append logs to this file instead of stderr.
    pub file: Option<String>,
}

/// Metrics section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsSettings {
    /// Whether the Prometheus recorder is installed.
    pub enabled: Option<bool>,
    /// Port of the Prometheus HTTP listener.
    pub port: Option<u16>,
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Storage section.
    pub storage: Option<ConfigFileStorage>,
    /// Circuit breaker section.
    pub circuit_breaker: Option<ConfigFileBreaker>,
    /// Retry section.
    pub retry: Option<ConfigFileRetry>,
    /// Monitor section.
    pub monitor: Option<ConfigFileMonitor>,
    /// Versioning section.
    pub versioning: Option<ConfigFileVersioning>,
    /// Logging section.
    pub logging: Option<LoggingSettings>,
    /// Metrics section.
    pub metrics: Option<MetricsSettings>,
}

/// Storage section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileStorage {
    /// Backend selector.
    pub backend: Option<String>,
    /// Local root.
    pub local_path: Option<String>,
    /// Local URL prefix.
    pub local_url_prefix: Option<String>,
    /// Per-call timeout.
    pub call_timeout_ms: Option<u64>,
    /// CDN origin.
    pub cdn_origin: Option<String>,
    /// Remote credentials.
    pub remote: Option<ConfigFileRemote>,
}

/// Remote subsection in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileRemote {
    /// Service base URL.
    pub url: Option<String>,
    /// Service key.
    pub api_key: Option<String>,
    /// Bucket.
    pub bucket: Option<String>,
}

/// Circuit breaker section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileBreaker {
    /// Failure threshold.
    pub failure_threshold: Option<u32>,
    /// Reset timeout.
    pub reset_timeout_ms: Option<u64>,
    /// Monitoring window.
    pub monitoring_window_ms: Option<u64>,
    /// `threshold` or `immediate`.
    pub half_open_policy: Option<String>,
}

/// Retry section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileRetry {
    /// Retries after the first attempt.
    pub max_retries: Option<u32>,
    /// First backoff delay.
    pub initial_delay_ms: Option<u64>,
    /// Backoff cap.
    pub max_delay_ms: Option<u64>,
    /// Growth factor.
    pub backoff_multiplier: Option<f64>,
}

/// Monitor section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileMonitor {
    /// Alert failure-rate threshold.
    pub alert_failure_rate: Option<f64>,
    /// Minimum failures before alerting.
    pub alert_min_failures: Option<u32>,
    /// Cooldown between alerts.
    pub alert_cooldown_ms: Option<u64>,
    /// Rolling window.
    pub window_ms: Option<u64>,
}

/// Versioning section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileVersioning {
    /// Database path.
    pub database: Option<String>,
    /// Versions kept by pruning.
    pub keep_versions: Option<usize>,
}

impl StowageConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path, then applies environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;
        Ok(Self::from_toml(&contents)?.with_env_overrides())
    }

    /// Parses TOML configuration without applying environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or holds invalid values.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents).map_err(|e| Error::OperationFailed {
            operation: "parse_config_file".to_string(),
            cause: e.to_string(),
        })?;
        Self::from_config_file(file)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks `<platform config dir>/stowage/config.toml`, then
    /// `~/.config/stowage/config.toml`. Falls back to defaults when neither
    /// exists or parses. Environment overrides are applied in every case.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default().with_env_overrides();
        };

        let candidates = [
            base_dirs.config_dir().join("stowage").join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join("stowage")
                .join("config.toml"),
        ];
        for path in candidates.iter().filter(|p| p.exists()) {
            match Self::load_from_file(path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                },
            }
        }

        Self::default().with_env_overrides()
    }

    /// Applies `STOWAGE_*` environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    ///
    /// | Variable | Setting |
    /// |----------|---------|
    /// | `STOWAGE_BACKEND` | `storage.backend` |
    /// | `STOWAGE_LOCAL_PATH` | `storage.local_path` |
    /// | `STOWAGE_LOCAL_URL_PREFIX` | `storage.local_url_prefix` |
    /// | `STOWAGE_CALL_TIMEOUT_MS` | `storage.call_timeout_ms` |
    /// | `STOWAGE_CDN_ORIGIN` | `storage.cdn_origin` |
    /// | `STOWAGE_REMOTE_URL` | `storage.remote.url` |
    /// | `STOWAGE_REMOTE_KEY` | `storage.remote.api_key` |
    /// | `STOWAGE_BUCKET` | `storage.remote.bucket` |
    /// | `STOWAGE_VERSION_DB` | `versioning.database` |
    /// | `STOWAGE_KEEP_VERSIONS` | `versioning.keep_versions` |
    ///
    /// Breaker, retry and monitor variables are read by their own configs.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(v) = var("STOWAGE_BACKEND") {
            match BackendSelector::parse(&v) {
                Some(backend) => self.storage.backend = backend,
                None => tracing::warn!(value = %v, "Unknown STOWAGE_BACKEND, keeping configured backend"),
            }
        }
        if let Some(v) = var("STOWAGE_LOCAL_PATH") {
            self.storage.local_path = PathBuf::from(v);
        }
        if let Some(v) = var("STOWAGE_LOCAL_URL_PREFIX") {
            self.storage.local_url_prefix = v;
        }
        if let Some(v) = var("STOWAGE_CALL_TIMEOUT_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.storage.call_timeout_ms = parsed.max(1);
        }
        if let Some(v) = var("STOWAGE_CDN_ORIGIN") {
            self.storage.cdn_origin = Some(v);
        }
        if let Some(v) = var("STOWAGE_REMOTE_URL") {
            self.storage.remote.url = Some(v);
        }
        if let Some(v) = var("STOWAGE_REMOTE_KEY") {
            self.storage.remote.api_key = Some(SecretString::from(v));
        }
        if let Some(v) = var("STOWAGE_BUCKET") {
            self.storage.remote.bucket = v;
        }
        if let Some(v) = var("STOWAGE_VERSION_DB") {
            self.versioning.database = PathBuf::from(v);
        }
        if let Some(v) = var("STOWAGE_KEEP_VERSIONS")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.versioning.keep_versions = parsed;
        }

        self.circuit_breaker = self.circuit_breaker.with_env_overrides();
        self.retry = self.retry.with_env_overrides();
        self.monitor = self.monitor.with_env_overrides();
        self
    }

    /// Converts a `ConfigFile` to `StowageConfig`.
    fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut config = Self::default();

        if let Some(storage) = file.storage {
            apply_storage(&mut config.storage, storage)?;
        }
        if let Some(breaker) = file.circuit_breaker {
            apply_breaker(&mut config.circuit_breaker, breaker)?;
        }
        if let Some(retry) = file.retry {
            apply_retry(&mut config.retry, retry)?;
        }
        if let Some(monitor) = file.monitor {
            apply_monitor(&mut config.monitor, monitor)?;
        }
        if let Some(versioning) = file.versioning {
            if let Some(database) = versioning.database {
                config.versioning.database = expand_home(&database);
            }
            if let Some(keep) = versioning.keep_versions {
                config.versioning.keep_versions = keep;
            }
        }
        config.observability = ObservabilitySettings {
            logging: file.logging,
            metrics: file.metrics,
        };

        Ok(config)
    }
}

fn apply_storage(settings: &mut StorageSettings, file: ConfigFileStorage) -> Result<()> {
    if let Some(backend) = file.backend {
        settings.backend = BackendSelector::parse(&backend).ok_or_else(|| {
            Error::InvalidInput(format!("storage.backend must be 'remote' or 'local', got '{backend}'"))
        })?;
    }
    if let Some(path) = file.local_path {
        settings.local_path = expand_home(&path);
    }
    if let Some(prefix) = file.local_url_prefix {
        settings.local_url_prefix = prefix;
    }
    if let Some(timeout) = file.call_timeout_ms {
        if timeout == 0 {
            return Err(Error::InvalidInput(
                "storage.call_timeout_ms must be positive".to_string(),
            ));
        }
        settings.call_timeout_ms = timeout;
    }
    if let Some(origin) = file.cdn_origin.filter(|o| !o.trim().is_empty()) {
        settings.cdn_origin = Some(origin);
    }
    if let Some(remote) = file.remote {
        if remote.url.is_some() {
            settings.remote.url = remote.url;
        }
        if let Some(key) = remote.api_key {
            settings.remote.api_key = Some(SecretString::from(key));
        }
        if let Some(bucket) = remote.bucket {
            settings.remote.bucket = bucket;
        }
    }
    Ok(())
}

fn apply_breaker(config: &mut CircuitBreakerConfig, file: ConfigFileBreaker) -> Result<()> {
    if let Some(threshold) = file.failure_threshold {
        if threshold == 0 {
            return Err(Error::InvalidInput(
                "circuit_breaker.failure_threshold must be positive".to_string(),
            ));
        }
        config.failure_threshold = threshold;
    }
    if let Some(reset) = file.reset_timeout_ms {
        config.reset_timeout_ms = reset;
    }
    if let Some(window) = file.monitoring_window_ms {
        config.monitoring_window_ms = window.max(1);
    }
    if let Some(policy) = file.half_open_policy {
        config.half_open_policy = HalfOpenPolicy::parse(&policy).ok_or_else(|| {
            Error::InvalidInput(format!(
                "circuit_breaker.half_open_policy must be 'threshold' or 'immediate', got '{policy}'"
            ))
        })?;
    }
    Ok(())
}

fn apply_retry(policy: &mut RetryPolicy, file: ConfigFileRetry) -> Result<()> {
    if let Some(retries) = file.max_retries {
        policy.max_retries = retries;
    }
    if let Some(initial) = file.initial_delay_ms {
        policy.initial_delay_ms = initial;
    }
    if let Some(max) = file.max_delay_ms {
        policy.max_delay_ms = max;
    }
    if let Some(multiplier) = file.backoff_multiplier {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::InvalidInput(format!(
                "retry.backoff_multiplier must be at least 1.0, got {multiplier}"
            )));
        }
        policy.backoff_multiplier = multiplier;
    }
    if policy.max_delay_ms < policy.initial_delay_ms {
        return Err(Error::InvalidInput(
            "retry.max_delay_ms must not be below retry.initial_delay_ms".to_string(),
        ));
    }
    Ok(())
}

fn apply_monitor(config: &mut MonitorConfig, file: ConfigFileMonitor) -> Result<()> {
    if let Some(rate) = file.alert_failure_rate {
        if !(0.0..=1.0).contains(&rate) {
            return Err(Error::InvalidInput(format!(
                "monitor.alert_failure_rate must be within 0.0..=1.0, got {rate}"
            )));
        }
        config.alert_failure_rate = rate;
    }
    if let Some(min) = file.alert_min_failures {
        config.alert_min_failures = min;
    }
    if let Some(cooldown) = file.alert_cooldown_ms {
        config.alert_cooldown_ms = cooldown;
    }
    if let Some(window) = file.window_ms {
        config.window_ms = window.max(1);
    }
    Ok(())
}

/// Returns the default data directory (`<platform data dir>/stowage`).
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".stowage"),
        |dirs| dirs.data_dir().join("stowage"),
    )
}

/// Expands a leading `~/` to the home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(dirs) = directories::BaseDirs::new()
    {
        return dirs.home_dir().join(rest);
    }
    PathBuf::from(path)
}
