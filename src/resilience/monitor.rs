//! Operation monitor with rolling failure rate and cooldown-gated alerts.
//!
//! Every logical storage operation is recorded once, with its outcome and
//! latency, into a bounded ring buffer. After each record the monitor checks
//! the trailing window: when the failure rate and the absolute failure count
//! both reach their thresholds, and the cooldown since the previous alert has
//! elapsed, an [`Alert`] is emitted. Sustained breaches therefore produce one
//! alert per cooldown period, not one per failure.
//!
//! Alerts are logged, counted in `storage_alerts_total{severity}` and
//! broadcast to any [`OperationMonitor::subscribe`] receivers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Capacity of the operation ring buffer.
pub const RECORD_CAPACITY: usize = 1000;

/// Capacity of the error ring buffer.
pub const ERROR_CAPACITY: usize = 100;

/// Number of recent errors attached to an alert.
const ALERT_ERROR_SAMPLE: usize = 5;

const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Failure rate (0.0 to 1.0) at which an alert fires.
    pub alert_failure_rate: f64,
    /// Minimum failures in the window before an alert may fire.
    pub alert_min_failures: u32,
    /// Minimum time between two alerts.
    pub alert_cooldown_ms: u64,
    /// Width of the rolling window.
    pub window_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            alert_failure_rate: 0.10,
            alert_min_failures: 5,
            alert_cooldown_ms: 300_000,
            window_ms: 60_000,
        }
    }
}

impl MonitorConfig {
    /// Loads monitor configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `STOWAGE_MONITOR_ALERT_FAILURE_RATE` | 0.10 |
    /// | `STOWAGE_MONITOR_ALERT_MIN_FAILURES` | 5 |
    /// | `STOWAGE_MONITOR_ALERT_COOLDOWN_MS` | 300000 |
    /// | `STOWAGE_MONITOR_WINDOW_MS` | 60000 |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("STOWAGE_MONITOR_ALERT_FAILURE_RATE")
            && let Ok(parsed) = v.parse::<f64>()
            && (0.0..=1.0).contains(&parsed)
        {
            self.alert_failure_rate = parsed;
        }
        if let Ok(v) = std::env::var("STOWAGE_MONITOR_ALERT_MIN_FAILURES")
            && let Ok(parsed) = v.parse::<u32>()
        {
            self.alert_min_failures = parsed;
        }
        if let Ok(v) = std::env::var("STOWAGE_MONITOR_ALERT_COOLDOWN_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.alert_cooldown_ms = parsed;
        }
        if let Ok(v) = std::env::var("STOWAGE_MONITOR_WINDOW_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.window_ms = parsed.max(1);
        }
        self
    }

    /// Sets the alert failure rate.
    #[must_use]
    pub const fn with_alert_failure_rate(mut self, rate: f64) -> Self {
        self.alert_failure_rate = rate;
        self
    }

    /// Sets the minimum failure count for alerts.
    #[must_use]
    pub const fn with_alert_min_failures(mut self, failures: u32) -> Self {
        self.alert_min_failures = failures;
        self
    }

    /// Sets the alert cooldown in milliseconds.
    #[must_use]
    pub const fn with_alert_cooldown_ms(mut self, cooldown_ms: u64) -> Self {
        self.alert_cooldown_ms = cooldown_ms;
        self
    }

    /// Sets the rolling window in milliseconds.
    #[must_use]
    pub const fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = window_ms;
        self
    }
}

/// Kind of storage operation being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Object upload.
    Upload,
    /// Object download.
    Download,
    /// Object deletion.
    Delete,
    /// Signed or public URL generation.
    SignedUrl,
    /// Existence check.
    Exists,
    /// Metadata lookup.
    Metadata,
    /// Backend health probe.
    Health,
}

impl OperationKind {
    /// Returns the kind as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Delete => "delete",
            Self::SignedUrl => "signed_url",
            Self::Exists => "exists",
            Self::Metadata => "metadata",
            Self::Health => "health",
        }
    }
}

#[derive(Debug, Clone)]
struct OperationRecord {
    at: Instant,
    kind: OperationKind,
    success: bool,
    latency_ms: u64,
}

/// A recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
    /// The failed operation.
    pub kind: OperationKind,
    /// Error message.
    pub message: String,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Failure rate at or above the threshold.
    Warning,
    /// Failure rate at least twice the threshold.
    Critical,
}

impl AlertSeverity {
    /// Returns the severity as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// A failure-rate alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// Alert severity.
    pub severity: AlertSeverity,
    /// Failure rate in the window (0.0 to 1.0).
    pub failure_rate: f64,
    /// Failures in the window.
    pub failure_count: u64,
    /// Operations in the window.
    pub total_count: u64,
    /// Most recent errors, newest first.
    pub recent_errors: Vec<ErrorEntry>,
    /// When the alert was raised.
    pub raised_at: DateTime<Utc>,
}

/// Coarse health derived from the rolling failure rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthGrade {
    /// Failure rate below half the alert threshold.
    Healthy,
    /// Failure rate below the alert threshold.
    Degraded,
    /// Failure rate at or above the alert threshold.
    Unhealthy,
}

/// Per-kind statistics in the rolling window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindStats {
    /// Operations of this kind.
    pub total: u64,
    /// Failed operations of this kind.
    pub failures: u64,
    /// Mean latency in milliseconds.
    pub avg_latency_ms: u64,
}

/// Totals since construction or the last reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LifetimeTotals {
    /// Recorded operations.
    pub total: u64,
    /// Successful operations.
    pub successes: u64,
    /// Failed operations.
    pub failures: u64,
    /// Successes over total (1.0 with no operations).
    pub success_rate: f64,
}

/// Statistics over the trailing window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollingView {
    /// Window width in milliseconds.
    pub window_ms: u64,
    /// Operations in the window.
    pub total: u64,
    /// Failures in the window.
    pub failures: u64,
    /// Failures over total (0.0 with no operations).
    pub failure_rate: f64,
    /// Mean latency.
    pub avg_latency_ms: u64,
    /// Median latency.
    pub p50_latency_ms: u64,
    /// 95th percentile latency.
    pub p95_latency_ms: u64,
    /// 99th percentile latency.
    pub p99_latency_ms: u64,
    /// Breakdown by operation kind.
    pub by_kind: BTreeMap<OperationKind, KindStats>,
}

/// Snapshot returned by [`OperationMonitor::metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorMetrics {
    /// Lifetime totals.
    pub lifetime: LifetimeTotals,
    /// Rolling window view.
    pub rolling: RollingView,
    /// Health derived from the rolling failure rate.
    pub health: HealthGrade,
    /// Most recent errors, newest first.
    pub recent_errors: Vec<ErrorEntry>,
    /// The last alert raised, if any.
    pub last_alert: Option<Alert>,
}

#[derive(Debug, Default)]
struct MonitorInner {
    records: VecDeque<OperationRecord>,
    errors: VecDeque<ErrorEntry>,
    total: u64,
    successes: u64,
    failures: u64,
    last_alert_at: Option<Instant>,
    last_alert: Option<Alert>,
}

impl MonitorInner {
    fn window<'a>(
        &'a self,
        now: Instant,
        window: Duration,
    ) -> impl Iterator<Item = &'a OperationRecord> + 'a {
        let cutoff = now.checked_sub(window);
        self.records
            .iter()
            .filter(move |record| cutoff.is_none_or(|cutoff| record.at > cutoff))
    }

    fn recent_errors(&self, limit: usize) -> Vec<ErrorEntry> {
        self.errors.iter().rev().take(limit).cloned().collect()
    }
}

/// Records operation outcomes and raises failure-rate alerts.
#[derive(Debug)]
pub struct OperationMonitor {
    config: MonitorConfig,
    inner: Mutex<MonitorInner>,
    alerts: broadcast::Sender<Alert>,
}

impl OperationMonitor {
    /// Creates a new monitor.
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        let (alerts, _receiver) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            config,
            inner: Mutex::new(MonitorInner::default()),
            alerts,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms.max(1))
    }

    /// Records one operation outcome and checks the alert condition.
    ///
    /// Returns the alert if this record raised one.
    pub fn record_operation(
        &self,
        kind: OperationKind,
        success: bool,
        latency_ms: u64,
        error: Option<&str>,
    ) -> Option<Alert> {
        self.record_operation_at(Instant::now(), kind, success, latency_ms, error)
    }

    /// [`Self::record_operation`] evaluated at an explicit instant.
    pub fn record_operation_at(
        &self,
        now: Instant,
        kind: OperationKind,
        success: bool,
        latency_ms: u64,
        error: Option<&str>,
    ) -> Option<Alert> {
        {
            let mut inner = self.lock();
            if inner.records.len() >= RECORD_CAPACITY {
                inner.records.pop_front();
            }
            inner.records.push_back(OperationRecord {
                at: now,
                kind,
                success,
                latency_ms,
            });
            inner.total += 1;
            if success {
                inner.successes += 1;
            } else {
                inner.failures += 1;
                if inner.errors.len() >= ERROR_CAPACITY {
                    inner.errors.pop_front();
                }
                inner.errors.push_back(ErrorEntry {
                    timestamp: Utc::now(),
                    kind,
                    message: error.unwrap_or("unknown error").to_string(),
                });
            }
        }
        self.check_and_alert_at(now)
    }

    /// Evaluates the alert condition over the trailing window.
    pub fn check_and_alert(&self) -> Option<Alert> {
        self.check_and_alert_at(Instant::now())
    }

    /// [`Self::check_and_alert`] evaluated at an explicit instant.
    pub fn check_and_alert_at(&self, now: Instant) -> Option<Alert> {
        let mut inner = self.lock();

        let (total, failures) = inner
            .window(now, self.window())
            .fold((0_u64, 0_u64), |(total, failures), record| {
                (total + 1, failures + u64::from(!record.success))
            });
        if total == 0 {
            return None;
        }
        let failure_rate = ratio(failures, total);
        if failure_rate < self.config.alert_failure_rate
            || failures < u64::from(self.config.alert_min_failures)
        {
            return None;
        }

        let cooldown = Duration::from_millis(self.config.alert_cooldown_ms);
        if let Some(last) = inner.last_alert_at
            && now.saturating_duration_since(last) < cooldown
        {
            return None;
        }

        let severity = if failure_rate >= self.config.alert_failure_rate * 2.0 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        let alert = Alert {
            severity,
            failure_rate,
            failure_count: failures,
            total_count: total,
            recent_errors: inner.recent_errors(ALERT_ERROR_SAMPLE),
            raised_at: Utc::now(),
        };
        inner.last_alert_at = Some(now);
        inner.last_alert = Some(alert.clone());
        drop(inner);

        self.emit(&alert);
        Some(alert)
    }

    fn emit(&self, alert: &Alert) {
        let latest_error = alert
            .recent_errors
            .first()
            .map_or("", |entry| entry.message.as_str());
        match alert.severity {
            AlertSeverity::Critical => tracing::error!(
                failure_rate = alert.failure_rate,
                failures = alert.failure_count,
                total = alert.total_count,
                latest_error = latest_error,
                "Storage failure rate critical"
            ),
            AlertSeverity::Warning => tracing::warn!(
                failure_rate = alert.failure_rate,
                failures = alert.failure_count,
                total = alert.total_count,
                latest_error = latest_error,
                "Storage failure rate above threshold"
            ),
        }
        metrics::counter!(
            "storage_alerts_total",
            "severity" => alert.severity.as_str()
        )
        .increment(1);
        // No receivers is fine; the alert is still logged and kept as last_alert.
        let _ = self.alerts.send(alert.clone());
    }

    /// Subscribes to alerts raised after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Returns the last alert raised, if any.
    #[must_use]
    pub fn last_alert(&self) -> Option<Alert> {
        self.lock().last_alert.clone()
    }

    /// Returns up to `limit` recent errors, newest first.
    #[must_use]
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorEntry> {
        self.lock().recent_errors(limit)
    }

    /// Returns lifetime totals and the rolling window view.
    #[must_use]
    pub fn metrics(&self) -> MonitorMetrics {
        self.metrics_at(Instant::now())
    }

    /// [`Self::metrics`] evaluated at an explicit instant.
    #[must_use]
    pub fn metrics_at(&self, now: Instant) -> MonitorMetrics {
        let inner = self.lock();

        let lifetime = LifetimeTotals {
            total: inner.total,
            successes: inner.successes,
            failures: inner.failures,
            success_rate: if inner.total == 0 {
                1.0
            } else {
                ratio(inner.successes, inner.total)
            },
        };

        let mut latencies = Vec::new();
        let mut by_kind: BTreeMap<OperationKind, (KindStats, u64)> = BTreeMap::new();
        let mut failures = 0_u64;
        for record in inner.window(now, self.window()) {
            latencies.push(record.latency_ms);
            let (stats, latency_sum) = by_kind.entry(record.kind).or_default();
            stats.total += 1;
            *latency_sum += record.latency_ms;
            if !record.success {
                stats.failures += 1;
                failures += 1;
            }
        }
        latencies.sort_unstable();
        let total = latencies.len() as u64;
        let failure_rate = if total == 0 { 0.0 } else { ratio(failures, total) };

        let rolling = RollingView {
            window_ms: self.config.window_ms,
            total,
            failures,
            failure_rate,
            avg_latency_ms: mean(latencies.iter().sum(), total),
            p50_latency_ms: percentile(&latencies, 50),
            p95_latency_ms: percentile(&latencies, 95),
            p99_latency_ms: percentile(&latencies, 99),
            by_kind: by_kind
                .into_iter()
                .map(|(kind, (mut stats, latency_sum))| {
                    stats.avg_latency_ms = mean(latency_sum, stats.total);
                    (kind, stats)
                })
                .collect(),
        };

        MonitorMetrics {
            lifetime,
            health: self.grade(failure_rate),
            rolling,
            recent_errors: inner.recent_errors(ALERT_ERROR_SAMPLE),
            last_alert: inner.last_alert.clone(),
        }
    }

    fn grade(&self, failure_rate: f64) -> HealthGrade {
        let threshold = self.config.alert_failure_rate;
        if failure_rate < threshold / 2.0 {
            HealthGrade::Healthy
        } else if failure_rate < threshold {
            HealthGrade::Degraded
        } else {
            HealthGrade::Unhealthy
        }
    }

    /// Clears all records, errors, totals and the alert cooldown.
    pub fn reset(&self) {
        *self.lock() = MonitorInner::default();
        tracing::info!("Operation monitor reset");
    }
}

impl Default for OperationMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: u64, whole: u64) -> f64 {
    part as f64 / whole as f64
}

fn mean(sum: u64, count: u64) -> u64 {
    sum.checked_div(count).unwrap_or(0)
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[u64], pct: u64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let n = sorted.len() as u64;
    let rank = (pct * n).div_ceil(100).clamp(1, n);
    usize::try_from(rank - 1)
        .ok()
        .and_then(|idx| sorted.get(idx))
        .copied()
        .unwrap_or(0)
}
