//! Stored objects and tier-tagged results.

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which storage tier served a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// The configured primary backend answered normally.
    Primary,
    /// The primary was unavailable and the local tier answered instead.
    Fallback,
}

impl Tier {
    /// Returns the tier as a string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value tagged with the tier that produced it.
///
/// Degraded operation is visible to callers without changing the success path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tiered<T> {
    /// Tier that served the request.
    pub tier: Tier,
    /// The backend-agnostic result.
    pub value: T,
}

impl<T> Tiered<T> {
    /// Wraps a value served by the primary tier.
    pub const fn primary(value: T) -> Self {
        Self {
            tier: Tier::Primary,
            value,
        }
    }

    /// Wraps a value served by the fallback tier.
    pub const fn fallback(value: T) -> Self {
        Self {
            tier: Tier::Fallback,
            value,
        }
    }

    /// Returns `true` when the value came from the fallback tier.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.tier == Tier::Fallback
    }

    /// Maps the inner value, keeping the tier.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Tiered<U> {
        Tiered {
            tier: self.tier,
            value: f(self.value),
        }
    }

    /// Discards the tier.
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    /// Storage key (`owner/year/month/uuid-millis.ext`).
    pub path: String,
    /// Directly addressable URL, when the serving tier has one.
    pub public_url: Option<String>,
    /// Sanitized human filename, for display only.
    pub display_name: String,
    /// Size of the stored object in bytes.
    pub size: u64,
}

/// Metadata for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Object size in bytes.
    pub size: u64,
    /// MIME type, when known.
    pub content_type: Option<String>,
    /// Last modification time, when known.
    pub last_modified: Option<DateTime<Utc>>,
    /// Backend-specific entity tag.
    pub etag: Option<String>,
}

/// An entry returned by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Entry name relative to the listed prefix.
    pub name: String,
    /// Metadata, when the backend reports it inline.
    pub metadata: Option<ObjectMetadata>,
}

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The primary tier responds.
    Healthy,
    /// The primary tier is down but the local tier can serve.
    Degraded,
    /// Neither tier can serve.
    Unhealthy,
}

impl HealthStatus {
    /// Returns the status as a string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Output of a storage health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    /// Probe latency in milliseconds.
    pub latency_ms: u64,
    /// Backend type that was probed first (`remote` or `local`).
    pub backend: String,
    /// Circuit breaker state at probe time.
    pub circuit: CircuitState,
    /// Error from the failed probe, if any.
    pub error: Option<String>,
}
