//! Failure handling primitives for the remote storage tier.
//!
//! - [`CircuitBreaker`]: tri-state gate with a sliding failure window
//! - [`RetryExecutor`]: bounded exponential backoff with seedable jitter
//! - [`OperationMonitor`]: rolling failure rate and cooldown-gated alerts
//!
//! All three are plain values owned by a [`crate::StorageFacade`]; there are
//! no process-wide singletons, so tests construct isolated instances.

mod circuit_breaker;
mod monitor;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState, HalfOpenPolicy, Permit,
};
pub use monitor::{
    Alert, AlertSeverity, ERROR_CAPACITY, ErrorEntry, HealthGrade, KindStats, LifetimeTotals,
    MonitorConfig, MonitorMetrics, OperationKind, OperationMonitor, RECORD_CAPACITY, RollingView,
};
pub use retry::{RetryExecutor, RetryPolicy};
