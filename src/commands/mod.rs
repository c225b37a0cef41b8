//! Command handlers module.
//!
//! This module organizes the CLI command implementations into separate files:
//! - `files.rs`: Object commands (upload, download, delete, url, exists, stat)
//! - `status.rs`: Health and resilience state
//! - `version.rs`: File version history

mod files;
mod status;
mod version;

use std::path::PathBuf;

use clap::Subcommand;

// Re-export command functions
pub use files::{cmd_delete, cmd_download, cmd_exists, cmd_stat, cmd_upload, cmd_url};
pub use status::{cmd_health, cmd_status};
pub use version::cmd_version;

/// Result type shared by command handlers.
pub type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// Version subcommands.
#[derive(Subcommand)]
pub enum VersionAction {
    /// Record new content for a file, registering it on first use.
    Create {
        /// Logical file identifier.
        file_id: String,

        /// Path of the new content.
        input: PathBuf,

        /// Actor recorded on the version.
        #[arg(short, long, default_value = "cli")]
        actor: String,

        /// Change note.
        #[arg(short, long)]
        note: Option<String>,

        /// Owner for storage keys when registering (defaults to the actor).
        #[arg(long)]
        owner: Option<String>,

        /// MIME type when registering (inferred from the extension if omitted).
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Make an earlier version live again.
    Restore {
        /// Logical file identifier.
        file_id: String,

        /// Version number to restore.
        version: u32,

        /// Actor recorded on the safety snapshot.
        #[arg(short, long, default_value = "cli")]
        actor: String,
    },

    /// Delete all but the newest versions.
    Prune {
        /// Logical file identifier.
        file_id: String,

        /// Versions to keep (defaults to the configured retention).
        #[arg(short, long)]
        keep: Option<usize>,
    },

    /// List versions newest first.
    List {
        /// Logical file identifier.
        file_id: String,
    },

    /// Compare two versions.
    Diff {
        /// Logical file identifier.
        file_id: String,

        /// Older version.
        from: u32,

        /// Newer version.
        to: u32,
    },
}

/// Prints a value as pretty JSON.
fn print_json<T: serde::Serialize>(value: &T) -> CommandResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
