//! Storage key generation and validation.
//!
//! Keys have the shape `{owner}/{yyyy}/{mm}/{uuid}-{epoch_millis}{ext}`. The
//! caller's filename never becomes part of the key apart from its extension;
//! a sanitized copy is kept only for display.

use crate::{Error, Result};
use chrono::{DateTime, Datelike, Utc};
use std::path::Path;
use uuid::Uuid;

/// Maximum length of a sanitized display name, in characters.
pub const MAX_DISPLAY_NAME_LEN: usize = 100;

/// Maximum length of a kept file extension, including the dot.
const MAX_EXTENSION_LEN: usize = 16;

/// A freshly generated storage key and its display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKey {
    /// The storage key.
    pub path: String,
    /// Sanitized, human-readable filename.
    pub display_name: String,
}

/// Replaces every character outside `[A-Za-z0-9.-]` with `_` and truncates
/// to [`MAX_DISPLAY_NAME_LEN`] characters.
#[must_use]
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_DISPLAY_NAME_LEN)
        .collect()
}

/// Generates a collision-resistant key for `owner_id` and `filename`.
pub fn generate_key(owner_id: &str, filename: &str) -> Result<GeneratedKey> {
    generate_key_at(owner_id, filename, Utc::now(), Uuid::new_v4())
}

/// [`generate_key`] with an explicit clock reading and identifier.
pub fn generate_key_at(
    owner_id: &str,
    filename: &str,
    now: DateTime<Utc>,
    id: Uuid,
) -> Result<GeneratedKey> {
    validate_owner(owner_id)?;
    let path = format!(
        "{owner_id}/{:04}/{:02}/{id}-{}{}",
        now.year(),
        now.month(),
        now.timestamp_millis(),
        extension_of(filename)
    );
    Ok(GeneratedKey {
        path,
        display_name: sanitize_filename(filename),
    })
}

/// Returns `.ext` for `filename`, sanitized, or an empty string.
#[must_use]
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| sanitize_filename(&format!(".{ext}")))
        .map(|ext| ext.chars().take(MAX_EXTENSION_LEN).collect())
        .unwrap_or_default()
}

/// Rejects keys that are empty, absolute or that traverse upwards.
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::InvalidInput("storage key is empty".to_string()));
    }
    if key.starts_with('/') || key.starts_with('\\') || key.contains(':') {
        return Err(Error::InvalidInput(format!(
            "storage key must be relative: {key}"
        )));
    }
    if key.contains('\0') {
        return Err(Error::InvalidInput(
            "storage key contains a NUL byte".to_string(),
        ));
    }
    if key.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(Error::InvalidInput(format!(
            "storage key traverses upwards: {key}"
        )));
    }
    Ok(())
}

fn validate_owner(owner_id: &str) -> Result<()> {
    if owner_id.trim().is_empty() {
        return Err(Error::InvalidInput("owner id is empty".to_string()));
    }
    if owner_id.contains(['/', '\\', '\0']) || owner_id == "." || owner_id == ".." {
        return Err(Error::InvalidInput(format!(
            "owner id is not a single path segment: {owner_id}"
        )));
    }
    Ok(())
}

/// Splits a key into its parent prefix and final segment.
#[must_use]
pub fn split_key(key: &str) -> (&str, &str) {
    key.rsplit_once('/').unwrap_or(("", key))
}
