//! SQLPort CLI
//!
//! Command-line interface for SQLPort - run SQL against the configured
//! storage backend and watch the change notifications it produces.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use sqlport_core::{Config, Store};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "sqlport")]
#[command(about = "SQLPort - SQLite storage with in-process or worker backends")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log engine activity to stderr (repeat for more detail)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run statements that return no rows
    Exec {
        /// SQL to run; several statements may be separated by `;`
        sql: String,
        /// Positional parameter (JSON literal, or plain text)
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
    /// Run a query and print its rows
    Query {
        /// SQL to run
        sql: String,
        /// Positional parameter (JSON literal, or plain text)
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
    /// Delete the primary database and recreate it empty
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Run statements and print the change notifications they produce
    Watch {
        /// Statements to run, in order
        #[arg(required = true)]
        statements: Vec<String>,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show backend, location and table sizes
    Status,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, database, backend)
        key: String,
        /// Value to set
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_deref();

    // Commands that don't need the store
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config = match config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;
    debug!(backend = %config.backend, path = ?config.database_path(), "opening store");

    let store = Store::new(config);
    store.init().await.context("Failed to initialize storage")?;

    let result = match cli.command {
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Exec { sql, params } => commands::sql::exec(&store, &sql, &params, &output).await,
        Commands::Query { sql, params } => {
            commands::sql::query(&store, &sql, &params, &output).await
        }
        Commands::Reset { yes } => commands::reset::reset(&store, yes, &output).await,
        Commands::Watch { statements } => {
            commands::watch::watch(&store, &statements, &output).await
        }
        Commands::Status => commands::status::show(&store, &output).await,
    };

    store.shutdown().await.context("Failed to close storage")?;
    result
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&std::path::Path>,
    output: &Output,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(&key, &value, config_path, output)
        }
    }
}

/// Send logs to stderr so they never mix with command output
///
/// `RUST_LOG` overrides the level picked from `-v`.
fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("sqlport_core={},sqlport_cli={}", log_level, log_level))
    });

    // Ignore the error if a subscriber is already installed
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
