//! opsync CLI
//!
//! Command-line tools for opsync queue directories.
//!
//! # Commands
//!
//! - `inspect` - Display queue statistics and log metadata
//! - `list` - List queue entries
//! - `verify` - Verify log checksums and payload encoding
//! - `compact` - Rewrite the log keeping one record per entry
//! - `requeue` - Move a failed entry back to pending

mod commands;

use clap::{Parser, Subcommand};
use opsync_protocol::{ClientId, QueueStatus};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// opsync queue tools.
#[derive(Parser)]
#[command(name = "opsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the queue directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display queue statistics and log metadata
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queue entries, oldest first
    List {
        /// Only show entries with this status
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of entries to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify log checksums and payload encoding
    Verify,

    /// Rewrite the log keeping only the latest record per entry
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Move a failed entry back to pending
    Requeue {
        /// Client id of the entry
        client_id: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Queue path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::List {
            status,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Queue path required for list")?;
            let status = status.map(|s| s.parse::<QueueStatus>()).transpose()?;
            commands::list::run(&path, status, limit, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Queue path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Queue path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Requeue { client_id } => {
            let path = cli.path.ok_or("Queue path required for requeue")?;
            commands::requeue::run(&path, client_id.parse::<ClientId>()?)?;
        }
        Commands::Version => {
            println!("opsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
