//! # Stowage
//!
//! Resilient object storage for user files.
//!
//! Stowage puts a hosted object store behind a circuit breaker and a bounded
//! retry executor, and transparently falls back to a rooted local directory
//! when the remote tier is unavailable. A content-addressed versioning service
//! sits on top and keeps a deduplicated history per logical file.
//!
//! ## Features
//!
//! - Tri-state circuit breaker with a sliding failure window
//! - Exponential backoff with seedable jitter and retryable-error classification
//! - Operation monitor with rolling failure rate and cooldown-gated alerts
//! - Dual-tier results (`Tier::Primary` / `Tier::Fallback`) so callers can see degradation
//! - SHA-256 deduplicated file versions with additive restore and retention pruning
//!
//! ## Example
//!
//! ```rust,ignore
//! use stowage::{StorageFacade, StowageConfig};
//!
//! let config = StowageConfig::load_default();
//! let storage = StorageFacade::from_config(&config)?;
//! let stored = storage
//!     .upload(file, "user-42", "resume.pdf", "application/pdf")
//!     .await?;
//! if stored.is_degraded() {
//!     tracing::warn!(path = %stored.value.path, "served from local tier");
//! }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod config;
pub mod models;
pub mod observability;
pub mod resilience;
pub mod services;
pub mod storage;

pub use config::StowageConfig;
pub use models::{FileId, FileVersion, HealthReport, ObjectMetadata, Tier, Tiered, UploadResult};
pub use resilience::{CircuitBreaker, OperationMonitor, RetryExecutor, RetryPolicy};
pub use services::VersioningService;
pub use storage::{LocalBackend, MetadataStore, ObjectBackend, RemoteBackend, StorageFacade};

/// Error type for stowage operations.
///
/// | Variant | Raised When | Retried |
/// |---------|-------------|---------|
/// | `InvalidInput` | Empty, absolute or traversing keys; bad config values | no |
/// | `Transient` | Connection reset, DNS failure, connect refused | yes |
/// | `Backend` | Remote returned an error status | 429/502/503/504 only |
/// | `Timeout` | The per-call timeout elapsed first | yes |
/// | `CircuitOpen` | The breaker rejected the call | no |
/// | `LocalIo` | Disk full, permission denied, path escaping the root | no |
/// | `NotFound` | Object absent on every consulted tier | no |
/// | `OperationFailed` | Config, database or observability failures | no |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A transient network-level failure talking to the remote backend.
    #[error("operation '{operation}' failed transiently: {cause}")]
    Transient {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The remote backend answered with an error.
    #[error("operation '{operation}' rejected by backend{}: {cause}", status_suffix(.status))]
    Backend {
        /// The operation that failed.
        operation: String,
        /// HTTP status code, when one was received.
        status: Option<u16>,
        /// The underlying cause.
        cause: String,
    },

    /// The per-call timeout won the race against the backend.
    #[error("operation '{operation}' timed out after {after_ms}ms")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout that elapsed, in milliseconds.
        after_ms: u64,
    },

    /// The circuit breaker rejected the call.
    #[error("service appears down, retry after {retry_after_secs}s")]
    CircuitOpen {
        /// Seconds until the breaker will admit a probe.
        retry_after_secs: u64,
    },

    /// A local filesystem operation failed.
    ///
    /// Terminal: there is no tier below the local one.
    #[error("local operation '{operation}' failed: {cause}")]
    LocalIo {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

/// Markers that identify a retryable failure in free-form error text.
const RETRYABLE_MARKERS: &[&str] = &[
    "econnreset",
    "etimedout",
    "enotfound",
    "eai_again",
    "timeout",
    "timed out",
    "network",
    "connection",
    "429",
    "502",
    "503",
    "504",
];

impl Error {
    /// Returns `true` when the failure is worth retrying.
    ///
    /// Transport failures, timeouts, 429 and upstream 502/503/504 are
    /// retryable. Everything else, including other 4xx statuses, is fatal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => true,
            Self::Backend { status: Some(status), .. } => {
                matches!(status, 429 | 502 | 503 | 504)
            },
            Self::Backend { status: None, cause, .. } | Self::OperationFailed { cause, .. } => {
                cause_is_retryable(cause)
            },
            Self::InvalidInput(_)
            | Self::CircuitOpen { .. }
            | Self::LocalIo { .. }
            | Self::NotFound(_) => false,
        }
    }

    /// Returns `true` when the backend reported the object as missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::Backend {
                    status: Some(404),
                    ..
                }
        )
    }

    /// Short machine-friendly label used for metrics and operation records.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Transient { .. } => "transient",
            Self::Backend { .. } => "backend",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::LocalIo { .. } => "local_io",
            Self::NotFound(_) => "not_found",
            Self::OperationFailed { .. } => "operation_failed",
        }
    }

    pub(crate) fn local_io(operation: &str, err: &std::io::Error) -> Self {
        Self::LocalIo {
            operation: operation.to_string(),
            cause: err.to_string(),
        }
    }
}

#[allow(clippy::ref_option)]
fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

fn cause_is_retryable(cause: &str) -> bool {
    let lower = cause.to_lowercase();
    RETRYABLE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Result type alias for stowage operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("empty key".to_string());
        assert_eq!(err.to_string(), "invalid input: empty key");

        let err = Error::CircuitOpen {
            retry_after_secs: 42,
        };
        assert_eq!(err.to_string(), "service appears down, retry after 42s");

        let err = Error::Backend {
            operation: "upload".to_string(),
            status: Some(503),
            cause: "unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "operation 'upload' rejected by backend (status 503): unavailable"
        );
    }

    #[test_case(Some(429), true ; "rate limited")]
    #[test_case(Some(502), true ; "bad gateway")]
    #[test_case(Some(503), true ; "unavailable")]
    #[test_case(Some(504), true ; "gateway timeout")]
    #[test_case(Some(500), false ; "internal error")]
    #[test_case(Some(401), false ; "unauthorized")]
    #[test_case(Some(404), false ; "not found")]
    fn test_status_classification(status: Option<u16>, expected: bool) {
        let err = Error::Backend {
            operation: "download".to_string(),
            status,
            cause: "boom".to_string(),
        };
        assert_eq!(err.is_retryable(), expected);
    }

    #[test_case("read ECONNRESET", true ; "connection reset")]
    #[test_case("getaddrinfo ENOTFOUND storage.example", true ; "dns failure")]
    #[test_case("Request Timeout", true ; "timeout text")]
    #[test_case("network unreachable", true ; "network text")]
    #[test_case("invalid signature", false ; "auth failure")]
    #[test_case("bucket not configured", false ; "config failure")]
    fn test_text_classification(cause: &str, expected: bool) {
        let err = Error::OperationFailed {
            operation: "upload".to_string(),
            cause: cause.to_string(),
        };
        assert_eq!(err.is_retryable(), expected);
    }

    #[test]
    fn test_timeouts_and_transients_are_retryable() {
        assert!(
            Error::Timeout {
                operation: "upload".to_string(),
                after_ms: 10,
            }
            .is_retryable()
        );
        assert!(
            Error::Transient {
                operation: "upload".to_string(),
                cause: "connect refused".to_string(),
            }
            .is_retryable()
        );
        assert!(
            !Error::LocalIo {
                operation: "write".to_string(),
                cause: "disk full".to_string(),
            }
            .is_retryable()
        );
        assert!(!Error::CircuitOpen { retry_after_secs: 1 }.is_retryable());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(Error::NotFound("a/b".to_string()).is_not_found());
        assert!(
            Error::Backend {
                operation: "download".to_string(),
                status: Some(404),
                cause: "Object not found".to_string(),
            }
            .is_not_found()
        );
        assert!(!Error::InvalidInput("x".to_string()).is_not_found());
    }
}
