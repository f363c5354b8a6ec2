//! Strata CLI - Command-line interface for feature provisioning
//!
//! This CLI drives a features service over a local data directory:
//! - Register and remove feature repositories
//! - Install, uninstall and change the state of features per region
//! - Inspect stored requirements and the units on the host
//! - Simulate any transaction before applying it

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod error;
mod output;
mod workspace;

use commands::{feature, repo, requirements, status};
use config::CliConfig;
use error::CliResult;
use workspace::Workspace;

/// Strata CLI application
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata - Feature provisioning for modular runtimes", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "STRATA_CONFIG")]
    config: Option<String>,

    /// Data directory (state, host image, engine data files)
    #[arg(short, long, env = "STRATA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format (table, json, yaml)
    #[arg(short, long)]
    output: Option<output::OutputFormat>,

    /// Log format
    #[arg(long, env = "STRATA_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Manage feature repositories
    Repo {
        #[command(subcommand)]
        command: repo::RepoCommands,
    },

    /// Query and provision features
    Feature {
        #[command(subcommand)]
        command: feature::FeatureCommands,
    },

    /// Inspect and edit stored requirements
    Requirements {
        #[command(subcommand)]
        command: requirements::RequirementCommands,
    },

    /// Show the units installed on the host
    Status,

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "strata=debug" } else { "strata=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    match cli.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }

    if let Err(e) = run(cli).await {
        output::print_error(&e.to_string());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    // Load config
    let config = CliConfig::load(cli.config.as_deref())?;
    let data_dir = config.resolve_data_dir(cli.data_dir.as_deref());
    let engine = config.engine(&data_dir)?;
    let region = config.region();
    let format = config.output(cli.output);

    if let Commands::Config = cli.command {
        println!("Data directory: {}", data_dir.display());
        println!("Default region: {}", region);
        return output::print_single(&engine, format);
    }

    // Open the workspace
    let workspace = Workspace::open(engine, format).await?;
    tracing::debug!(data_dir = %workspace.data_dir().display(), "Workspace opened");

    // Execute command
    let result = match cli.command {
        Commands::Repo { command } => repo::execute(command, &workspace, format).await,
        Commands::Feature { command } => {
            feature::execute(command, &workspace, &region, cli.verbose, format).await
        }
        Commands::Requirements { command } => {
            requirements::execute(command, &workspace, &region, cli.verbose, format).await
        }
        Commands::Status => status::execute(&workspace, format).await,
        Commands::Config => Ok(()),
    };

    // A failed transaction may still have changed the host
    workspace.save().await?;
    result
}
