//! Repository commands

use clap::Subcommand;
use serde::Serialize;
use strata_deployer::FeatureRepository;
use tabled::Tabled;

use crate::error::CliResult;
use crate::output::{self, print_success, OutputFormat};
use crate::workspace::Workspace;

/// Repository subcommands
#[derive(Subcommand)]
pub enum RepoCommands {
    /// Register a feature repository
    Add {
        /// Repository location (path or file: URI)
        uri: String,

        /// Also install every feature the repository lists
        #[arg(short, long)]
        install: bool,
    },

    /// Unregister a feature repository
    Remove {
        /// Repository location
        uri: String,

        /// Uninstall its installed features first
        #[arg(short, long)]
        uninstall: bool,
    },

    /// Reload a registered repository
    Refresh {
        /// Repository location
        uri: String,
    },

    /// List registered repositories
    List,
}

/// Table row for repository display
#[derive(Debug, Serialize, Tabled)]
struct RepositoryRow {
    uri: String,
    name: String,
    features: usize,
    bundles: usize,
}

impl From<FeatureRepository> for RepositoryRow {
    fn from(repository: FeatureRepository) -> Self {
        Self {
            uri: repository.uri,
            name: repository.name.unwrap_or_else(|| "-".to_string()),
            features: repository.features.len(),
            bundles: repository.bundles.len(),
        }
    }
}

/// Execute a repository command
pub async fn execute(
    command: RepoCommands,
    workspace: &Workspace,
    format: OutputFormat,
) -> CliResult<()> {
    let service = &workspace.service;
    match command {
        RepoCommands::Add { uri, install } => {
            let outcome = service.add_repository(&uri, install).await?;
            if install {
                output::print_outcome("Repository install", &outcome, format)?;
            }
            print_success(&format!("Added repository {}", uri));
        }
        RepoCommands::Remove { uri, uninstall } => {
            let outcome = service.remove_repository(&uri, uninstall).await?;
            if uninstall {
                output::print_outcome("Repository uninstall", &outcome, format)?;
            }
            print_success(&format!("Removed repository {}", uri));
        }
        RepoCommands::Refresh { uri } => {
            let repository = service.refresh_repository(&uri).await?;
            print_success(&format!(
                "Reloaded {} ({} features)",
                uri,
                repository.features.len()
            ));
        }
        RepoCommands::List => {
            let rows: Vec<RepositoryRow> = service
                .list_repositories()
                .into_iter()
                .map(RepositoryRow::from)
                .collect();
            output::print_output(rows, format)?;
        }
    }
    Ok(())
}
