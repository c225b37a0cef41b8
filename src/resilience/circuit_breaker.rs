//! Circuit breaker guarding calls to the remote backend.
//!
//! ```text
//! +--------+  failures in window >= threshold  +------+
//! | Closed | --------------------------------> | Open |
//! +--------+                                   +------+
//!     ^                                            |
//!     |  first success                             | now >= next_attempt_time
//!     |                                            v
//!     +------------------------------------  +-----------+
//!                                            | Half-Open |
//!                                            +-----------+
//! ```
//!
//! Failures are counted in a sliding window (`monitoring_window_ms`) rather
//! than as a consecutive streak, so sporadic errors spread over a long period
//! never trip the breaker.
//!
//! While half-open there is no probe limit: every caller that polls
//! [`CircuitBreaker::can_execute`] is admitted, so several probes may be in
//! flight at once.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Every Nth cumulative success clears the failure window.
const SUCCESS_RESET_INTERVAL: u64 = 10;

/// How a failure observed while half-open is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HalfOpenPolicy {
    /// Re-open only if the failure window still holds `failure_threshold` entries.
    #[default]
    Threshold,
    /// Re-open on the first failed probe.
    Immediate,
}

impl HalfOpenPolicy {
    /// Parses a policy name. Unknown names yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "threshold" => Some(Self::Threshold),
            "immediate" => Some(Self::Immediate),
            _ => None,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub reset_timeout_ms: u64,
    /// Width of the sliding failure window.
    pub monitoring_window_ms: u64,
    /// What a failed half-open probe does.
    pub half_open_policy: HalfOpenPolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            monitoring_window_ms: 60_000,
            half_open_policy: HalfOpenPolicy::Threshold,
        }
    }
}

impl CircuitBreakerConfig {
    /// Loads breaker configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `STOWAGE_BREAKER_FAILURE_THRESHOLD` | 5 |
    /// | `STOWAGE_BREAKER_RESET_MS` | 60000 |
    /// | `STOWAGE_BREAKER_WINDOW_MS` | 60000 |
    /// | `STOWAGE_BREAKER_HALF_OPEN_POLICY` | threshold |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("STOWAGE_BREAKER_FAILURE_THRESHOLD")
            && let Ok(parsed) = v.parse::<u32>()
        {
            self.failure_threshold = parsed.max(1);
        }
        if let Ok(v) = std::env::var("STOWAGE_BREAKER_RESET_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.reset_timeout_ms = parsed;
        }
        if let Ok(v) = std::env::var("STOWAGE_BREAKER_WINDOW_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.monitoring_window_ms = parsed.max(1);
        }
        if let Ok(v) = std::env::var("STOWAGE_BREAKER_HALF_OPEN_POLICY")
            && let Some(policy) = HalfOpenPolicy::parse(&v)
        {
            self.half_open_policy = policy;
        }
        self
    }

    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout in milliseconds.
    #[must_use]
    pub const fn with_reset_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.reset_timeout_ms = timeout_ms;
        self
    }

    /// Sets the monitoring window in milliseconds.
    #[must_use]
    pub const fn with_monitoring_window_ms(mut self, window_ms: u64) -> Self {
        self.monitoring_window_ms = window_ms;
        self
    }

    /// Sets the half-open failure policy.
    #[must_use]
    pub const fn with_half_open_policy(mut self, policy: HalfOpenPolicy) -> Self {
        self.half_open_policy = policy;
        self
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast.
    Open,
    /// Calls are admitted as probes.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state as a string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Numeric value for the state gauge (0 closed, 1 open, 2 half-open).
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

/// Answer to "may I call the backend now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Permit {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Why the call was rejected.
    pub reason: Option<String>,
    /// Whole seconds until a probe will be admitted.
    pub retry_after_secs: Option<u64>,
    /// Whether the call is a half-open probe.
    pub half_open: bool,
}

impl Permit {
    const fn allow(half_open: bool) -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_secs: None,
            half_open,
        }
    }
}

/// Read-only view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures that fall inside the monitoring window.
    pub failures_in_window: usize,
    /// Cumulative successes since creation or reset.
    pub success_count: u64,
    /// Milliseconds since the most recent failure.
    pub last_failure_ago_ms: Option<u64>,
    /// Milliseconds until a probe is admitted; only set while open.
    pub next_attempt_in_ms: Option<u64>,
    /// Configured threshold.
    pub failure_threshold: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_timestamps: VecDeque<Instant>,
    last_failure_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
    success_count: u64,
}

impl BreakerInner {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_timestamps: VecDeque::new(),
            last_failure_time: None,
            next_attempt_time: None,
            success_count: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        while self
            .failure_timestamps
            .front()
            .is_some_and(|timestamp| *timestamp <= cutoff)
        {
            self.failure_timestamps.pop_front();
        }
    }
}

/// Tri-state circuit breaker with a sliding failure window.
///
/// All methods take `&self`; state lives behind a mutex so one breaker can be
/// shared by every concurrent request of a facade.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    reset_timeout: Duration,
    monitoring_window: Duration,
    half_open_policy: HalfOpenPolicy,
    backend_name: &'static str,
}

impl CircuitBreaker {
    /// Creates a new, closed circuit breaker.
    #[must_use]
    pub fn new(config: &CircuitBreakerConfig, backend_name: &'static str) -> Self {
        Self {
            inner: Mutex::new(BreakerInner::new()),
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            monitoring_window: Duration::from_millis(config.monitoring_window_ms.max(1)),
            half_open_policy: config.half_open_policy,
            backend_name,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks whether a call may proceed. Never fails.
    ///
    /// May move the breaker from open to half-open as a side effect.
    pub fn can_execute(&self) -> Permit {
        self.can_execute_at(Instant::now())
    }

    /// [`Self::can_execute`] evaluated at an explicit instant.
    pub fn can_execute_at(&self, now: Instant) -> Permit {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Permit::allow(false),
            CircuitState::HalfOpen => Permit::allow(true),
            CircuitState::Open => {
                let next_attempt = inner.next_attempt_time.unwrap_or(now);
                if now >= next_attempt {
                    inner.state = CircuitState::HalfOpen;
                    inner.next_attempt_time = None;
                    drop(inner);
                    tracing::info!(
                        backend = self.backend_name,
                        "Circuit breaker transitioning to half-open"
                    );
                    self.record_state(CircuitState::HalfOpen);
                    return Permit::allow(true);
                }
                let remaining_ms = (next_attempt - now).as_millis();
                let retry_after_secs = u64::try_from(remaining_ms.div_ceil(1000))
                    .unwrap_or(u64::MAX)
                    .max(1);
                Permit {
                    allowed: false,
                    reason: Some(format!(
                        "circuit open for backend '{}' after repeated failures",
                        self.backend_name
                    )),
                    retry_after_secs: Some(retry_after_secs),
                    half_open: false,
                }
            },
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.success_count += 1;

        let closed_from_half_open = inner.state == CircuitState::HalfOpen;
        if closed_from_half_open {
            inner.state = CircuitState::Closed;
            inner.next_attempt_time = None;
            inner.failure_timestamps.clear();
        }
        if inner.success_count % SUCCESS_RESET_INTERVAL == 0 {
            inner.failure_timestamps.clear();
        }
        drop(inner);

        if closed_from_half_open {
            tracing::info!(
                backend = self.backend_name,
                "Circuit breaker closing after successful probe"
            );
            self.record_state(CircuitState::Closed);
        }
    }

    /// Records a failed call.
    ///
    /// Returns `true` if this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        self.record_failure_at(Instant::now())
    }

    /// [`Self::record_failure`] evaluated at an explicit instant.
    pub fn record_failure_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        inner.failure_timestamps.push_back(now);
        inner.last_failure_time = Some(now);
        inner.prune(now, self.monitoring_window);

        let failures = inner.failure_timestamps.len();
        let threshold_reached =
            failures >= usize::try_from(self.failure_threshold).unwrap_or(usize::MAX);
        let should_open = match inner.state {
            CircuitState::Closed => threshold_reached,
            CircuitState::HalfOpen => match self.half_open_policy {
                HalfOpenPolicy::Immediate => true,
                HalfOpenPolicy::Threshold => threshold_reached,
            },
            CircuitState::Open => false,
        };
        if !should_open {
            return false;
        }

        let from = inner.state;
        inner.state = CircuitState::Open;
        inner.next_attempt_time = Some(now + self.reset_timeout);
        drop(inner);

        tracing::warn!(
            backend = self.backend_name,
            failures = failures,
            threshold = self.failure_threshold,
            from = from.as_str(),
            reset_timeout_ms = u64::try_from(self.reset_timeout.as_millis()).unwrap_or(u64::MAX),
            "Circuit breaker opened"
        );
        metrics::counter!(
            "storage_circuit_breaker_trips_total",
            "backend" => self.backend_name
        )
        .increment(1);
        self.record_state(CircuitState::Open);
        true
    }

    /// Returns the current state without side effects.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Returns a read-only snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// [`Self::snapshot`] evaluated at an explicit instant.
    #[must_use]
    pub fn snapshot_at(&self, now: Instant) -> CircuitSnapshot {
        let inner = self.lock();
        let cutoff = now.checked_sub(self.monitoring_window);
        let failures_in_window = inner
            .failure_timestamps
            .iter()
            .filter(|timestamp| cutoff.is_none_or(|cutoff| **timestamp > cutoff))
            .count();
        CircuitSnapshot {
            state: inner.state,
            failures_in_window,
            success_count: inner.success_count,
            last_failure_ago_ms: inner
                .last_failure_time
                .map(|at| duration_to_millis(now.saturating_duration_since(at))),
            next_attempt_in_ms: inner
                .next_attempt_time
                .map(|at| duration_to_millis(at.saturating_duration_since(now))),
            failure_threshold: self.failure_threshold,
        }
    }

    /// Forces the breaker closed and clears its history (operator action).
    pub fn reset(&self) {
        *self.lock() = BreakerInner::new();
        tracing::info!(backend = self.backend_name, "Circuit breaker reset");
        self.record_state(CircuitState::Closed);
    }

    /// Returns the backend name.
    #[must_use]
    pub const fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    fn record_state(&self, state: CircuitState) {
        metrics::gauge!(
            "storage_circuit_breaker_state",
            "backend" => self.backend_name
        )
        .set(f64::from(state.value()));
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64, window_ms: u64) -> CircuitBreaker {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_reset_timeout_ms(reset_ms)
            .with_monitoring_window_ms(window_ms);
        CircuitBreaker::new(&config, "test")
    }

    // =========================================================================
    // State machine
    // =========================================================================

    #[test]
    fn test_starts_closed_and_allows() {
        let breaker = breaker(3, 1_000, 1_000);
        assert_eq!(breaker.state(), CircuitState::Closed);
        let permit = breaker.can_execute();
        assert!(permit.allowed);
        assert!(!permit.half_open);
    }

    #[test]
    fn test_opens_when_threshold_reached_in_window() {
        let breaker = breaker(3, 10_000, 60_000);
        let start = Instant::now();

        assert!(!breaker.record_failure_at(start));
        assert!(!breaker.record_failure_at(start + Duration::from_secs(1)));
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(breaker.record_failure_at(start + Duration::from_secs(2)));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let breaker = breaker(3, 10_000, 1_000);
        let start = Instant::now();

        breaker.record_failure_at(start);
        breaker.record_failure_at(start + Duration::from_millis(500));
        // First two have aged out by now
        let tripped = breaker.record_failure_at(start + Duration::from_millis(2_000));
        assert!(!tripped);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(
            breaker
                .snapshot_at(start + Duration::from_millis(2_000))
                .failures_in_window,
            1
        );
    }

    #[test]
    fn test_rejects_until_reset_timeout() {
        let breaker = breaker(1, 5_000, 60_000);
        let start = Instant::now();
        breaker.record_failure_at(start);

        let permit = breaker.can_execute_at(start + Duration::from_millis(1_200));
        assert!(!permit.allowed);
        assert_eq!(permit.retry_after_secs, Some(4));
        assert!(permit.reason.is_some());

        let permit = breaker.can_execute_at(start + Duration::from_millis(4_999));
        assert!(!permit.allowed);
        assert_eq!(permit.retry_after_secs, Some(1));
    }

    #[test]
    fn test_half_open_after_timeout_then_closes_on_success() {
        let breaker = breaker(1, 1_000, 60_000);
        let start = Instant::now();
        breaker.record_failure_at(start);

        let permit = breaker.can_execute_at(start + Duration::from_millis(1_000));
        assert!(permit.allowed);
        assert!(permit.half_open);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failures_in_window, 0);
    }

    #[test]
    fn test_half_open_admits_concurrent_probes() {
        let breaker = breaker(1, 0, 60_000);
        let start = Instant::now();
        breaker.record_failure_at(start);

        let first = breaker.can_execute_at(start);
        let second = breaker.can_execute_at(start);
        assert!(first.allowed && first.half_open);
        assert!(second.allowed && second.half_open);
    }

    #[test]
    fn test_half_open_failure_threshold_policy_rechecks_window() {
        let breaker = breaker(2, 1_000, 500);
        let start = Instant::now();
        breaker.record_failure_at(start);
        breaker.record_failure_at(start);
        assert_eq!(breaker.state(), CircuitState::Open);

        let probe_at = start + Duration::from_millis(1_000);
        assert!(breaker.can_execute_at(probe_at).half_open);

        // Old failures aged out of the 500ms window: one failure is below threshold
        assert!(!breaker.record_failure_at(probe_at));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // A second failure in the window reaches the threshold again
        assert!(breaker.record_failure_at(probe_at + Duration::from_millis(10)));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_immediate_policy_reopens_on_first_failure() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(3)
            .with_reset_timeout_ms(0)
            .with_monitoring_window_ms(1)
            .with_half_open_policy(HalfOpenPolicy::Immediate);
        let breaker = CircuitBreaker::new(&config, "test");
        let start = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(start);
        }
        assert!(breaker.can_execute_at(start).half_open);

        assert!(breaker.record_failure_at(start + Duration::from_millis(5)));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_every_tenth_success_clears_window() {
        let breaker = breaker(5, 1_000, 60_000);
        let now = Instant::now();
        breaker.record_failure_at(now);
        breaker.record_failure_at(now);

        for _ in 0..9 {
            breaker.record_success();
        }
        assert_eq!(breaker.snapshot_at(now).failures_in_window, 2);

        breaker.record_success();
        assert_eq!(breaker.snapshot_at(now).failures_in_window, 0);
        assert_eq!(breaker.snapshot_at(now).success_count, 10);
    }

    #[test]
    fn test_next_attempt_only_set_while_open() {
        let breaker = breaker(1, 1_000, 60_000);
        let start = Instant::now();
        assert_eq!(breaker.snapshot_at(start).next_attempt_in_ms, None);

        breaker.record_failure_at(start);
        assert_eq!(breaker.snapshot_at(start).next_attempt_in_ms, Some(1_000));

        breaker.can_execute_at(start + Duration::from_millis(1_000));
        assert_eq!(breaker.snapshot_at(start).next_attempt_in_ms, None);
    }

    #[test]
    fn test_reset_closes_and_clears() {
        let breaker = breaker(1, 60_000, 60_000);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failures_in_window, 0);
        assert!(breaker.can_execute().allowed);
    }

    #[test]
    fn test_outage_scenario() {
        // threshold 5, window 60s: five failures in ten seconds
        let breaker = breaker(5, 60_000, 60_000);
        let start = Instant::now();
        for i in 0..5 {
            breaker.record_failure_at(start + Duration::from_secs(i * 2));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        let opened_at = start + Duration::from_secs(8);

        for offset_secs in [0, 1, 30, 59] {
            let permit = breaker.can_execute_at(opened_at + Duration::from_secs(offset_secs));
            assert!(!permit.allowed);
            assert!(permit.retry_after_secs.is_some_and(|secs| secs > 0));
        }

        let permit = breaker.can_execute_at(opened_at + Duration::from_secs(60));
        assert!(permit.allowed);
        assert!(permit.half_open);

        breaker.record_success();
        let snapshot = breaker.snapshot_at(opened_at + Duration::from_secs(60));
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failures_in_window, 0);
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    #[test]
    fn test_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout_ms, 60_000);
        assert_eq!(config.monitoring_window_ms, 60_000);
        assert_eq!(config.half_open_policy, HalfOpenPolicy::Threshold);
    }

    #[test]
    fn test_config_minimum_values() {
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            reset_timeout_ms: 0,
            monitoring_window_ms: 0,
            half_open_policy: HalfOpenPolicy::Threshold,
        };
        let breaker = CircuitBreaker::new(&config, "test");
        assert_eq!(breaker.failure_threshold, 1);
        assert_eq!(breaker.monitoring_window, Duration::from_millis(1));
    }

    #[test]
    fn test_half_open_policy_parse() {
        assert_eq!(HalfOpenPolicy::parse("Immediate"), Some(HalfOpenPolicy::Immediate));
        assert_eq!(HalfOpenPolicy::parse(" threshold "), Some(HalfOpenPolicy::Threshold));
        assert_eq!(HalfOpenPolicy::parse("sometimes"), None);
    }
}
