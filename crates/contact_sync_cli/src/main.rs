//! Contact Sync CLI
//!
//! Command-line tools for inspecting persisted contact sync state.
//!
//! # Commands
//!
//! - `inspect` - Display the manifest version, identifier map and pending changes
//! - `verify` - Verify the sync state decodes and is consistent

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Contact sync state tools.
#[derive(Parser)]
#[command(name = "contact-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the sync state directory
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
    /// Display the persisted sync state
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify sync state integrity
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("State path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("State path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Version => {
            println!("contact-sync v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "state format v{}",
                contact_sync_storage::IMAGE_FORMAT_VERSION
            );
        }
    }

    Ok(())
}
