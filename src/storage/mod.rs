//! Storage layer.
//!
//! This module provides a two-tier object storage architecture:
//! - **Remote**: Hosted object store reached over REST ([`RemoteBackend`])
//! - **Local**: Rooted directory used as primary or fallback ([`LocalBackend`])
//! - **Metadata**: Version history and file heads ([`MetadataStore`])
//!
//! [`StorageFacade`] composes the two object tiers with the resilience layer.

// Allow significant_drop_tightening - dropping database connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]
// Allow match_same_arms for explicit enum handling.
#![allow(clippy::match_same_arms)]

pub mod cdn;
pub mod facade;
pub mod keys;
pub mod local;
pub mod metadata;
pub mod remote;
pub mod traits;

pub use cdn::CdnRewriter;
pub use facade::{DEFAULT_CALL_TIMEOUT, DEFAULT_URL_TTL_SECS, StorageFacade};
pub use keys::{GeneratedKey, generate_key, sanitize_filename, validate_key};
pub use local::{DEFAULT_LOCAL_URL_PREFIX, LocalBackend};
pub use metadata::{InMemoryMetadataStore, MetadataStore, SqliteMetadataStore, VersionCommit};
pub use remote::{DEFAULT_BUCKET, RemoteBackend, RemoteConfig};
pub use traits::{ObjectBackend, ObjectReader};
