//! Binary entry point for stowage.
//!
//! This binary provides the CLI interface for resilient object storage and
//! file versioning.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

mod commands;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use commands::{CommandResult, VersionAction};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use stowage::config::StowageConfig;
use stowage::observability::{self, InitOptions};
use stowage::storage::{DEFAULT_URL_TTL_SECS, SqliteMetadataStore};
use stowage::{StorageFacade, VersioningService};

/// Stowage - resilient object storage with local fallback and versioning.
#[derive(Parser)]
#[command(name = "stowage")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "STOWAGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Upload a file under a generated key.
    Upload {
        /// File to upload.
        input: PathBuf,

        /// Owner used as the first key segment.
        #[arg(short, long)]
        owner: String,

        /// MIME type (inferred from the extension if omitted).
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Download an object.
    Download {
        /// Storage key.
        path: String,

        /// Output file (stdout if omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete an object.
    Delete {
        /// Storage key.
        path: String,
    },

    /// Print a time-boxed download URL.
    Url {
        /// Storage key.
        path: String,

        /// URL lifetime in seconds.
        #[arg(long, default_value_t = DEFAULT_URL_TTL_SECS)]
        ttl: u64,
    },

    /// Check whether an object exists.
    Exists {
        /// Storage key.
        path: String,
    },

    /// Show object metadata.
    Stat {
        /// Storage key.
        path: String,
    },

    /// Probe the primary backend.
    Health,

    /// Show circuit breaker and monitor state.
    Status,

    /// Manage file versions.
    Version {
        /// Version subcommand.
        #[command(subcommand)]
        action: VersionAction,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

/// Main entry point.
#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "stowage", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    let _observability = match observability::init_from_config(
        &config.observability,
        InitOptions {
            verbose: cli.verbose,
            metrics_expose: false,
        },
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run_command(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Loads configuration from an explicit path or the default location.
fn load_config(path: Option<&Path>) -> stowage::Result<StowageConfig> {
    match path {
        Some(path) => StowageConfig::load_from_file(path),
        None => Ok(StowageConfig::load_default()),
    }
}

/// Runs the selected command.
async fn run_command(command: Commands, config: StowageConfig) -> CommandResult {
    let storage = Arc::new(StorageFacade::from_config(&config)?);

    match command {
        Commands::Upload {
            input,
            owner,
            content_type,
        } => commands::cmd_upload(&storage, input, owner, content_type).await,
        Commands::Download { path, output } => {
            commands::cmd_download(&storage, path, output).await
        },
        Commands::Delete { path } => commands::cmd_delete(&storage, path).await,
        Commands::Url { path, ttl } => commands::cmd_url(&storage, path, ttl).await,
        Commands::Exists { path } => commands::cmd_exists(&storage, path).await,
        Commands::Stat { path } => commands::cmd_stat(&storage, path).await,
        Commands::Health => commands::cmd_health(&storage).await,
        Commands::Status => commands::cmd_status(&storage).await,
        Commands::Version { action } => {
            let store = SqliteMetadataStore::new(config.versioning.database.clone())?;
            let service = VersioningService::new(storage, Arc::new(store));
            commands::cmd_version(&service, &config, action).await
        },
        Commands::Completions { .. } => Ok(()),
    }
}
