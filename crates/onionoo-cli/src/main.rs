//! # Onionoo CLI
//!
//! Command-line interface for the Onionoo node index.
//!
//! ## Commands
//!
//! - `onionoo query <resource> [QUERY]` - Run a query against a fresh index
//! - `onionoo status` - Build the index and show its statistics
//! - `onionoo watch` - Keep the index current and log each publication
//!
//! ## Example Usage
//!
//! ```bash
//! # Ten heaviest running relays
//! onionoo query summary "type=relay&running=true&order=-consensus_weight&limit=10"
//!
//! # Same, as JSON, against a specific summary document
//! onionoo query details "country=de" --data ./summary.json --output json
//!
//! # Refresh every minute for an hour
//! onionoo watch --ticks 60
//! ```

mod app;
mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Onionoo - Tor relay and bridge search
#[derive(Parser)]
#[command(name = "onionoo")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Summary document to index (overrides the configured path)
    #[arg(short, long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query, e.g. `onionoo query summary "type=relay&limit=5"`
    Query {
        /// Resource name (summary, details, bandwidth, weights, clients, uptime)
        resource: String,

        /// URL query string
        #[arg(default_value = "")]
        query: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// Build the index and show statistics
    Status,

    /// Keep the index up to date, logging each new snapshot
    Watch {
        /// Stop after this many refresh intervals
        #[arg(short, long)]
        ticks: Option<u64>,
    },
}

#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => onionoo_core::Config::load_from(path)?,
        None => onionoo_core::Config::load()?,
    };
    if let Some(data) = cli.data {
        config.general.data_path = Some(data);
    }

    // Setup logging
    let log_level = if cli.quiet {
        "error".to_string()
    } else {
        match cli.verbose {
            0 => config.general.log_level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    // Execute command
    match cli.command {
        Commands::Query {
            resource,
            query,
            output,
        } => commands::query::run(config, &resource, &query, output),
        Commands::Status => commands::status::run(config),
        Commands::Watch { ticks } => commands::watch::run(config, ticks),
    }
}
