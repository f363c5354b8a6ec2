//! Requirement commands

use clap::Subcommand;
use serde::Serialize;
use strata_deployer::Requirements;
use tabled::Tabled;

use super::DeployFlags;
use crate::error::CliResult;
use crate::output::{self, OutputFormat};
use crate::workspace::Workspace;

/// Requirement subcommands
#[derive(Subcommand)]
pub enum RequirementCommands {
    /// List stored requirements per region
    List,

    /// Add raw requirements without checking them against repositories
    Add {
        #[arg(required = true)]
        requirements: Vec<String>,

        #[arg(long)]
        region: Option<String>,

        #[command(flatten)]
        flags: DeployFlags,
    },

    /// Remove requirements exactly as stored
    Remove {
        #[arg(required = true)]
        requirements: Vec<String>,

        #[arg(long)]
        region: Option<String>,

        #[command(flatten)]
        flags: DeployFlags,
    },
}

/// Table row for requirement display
#[derive(Debug, Serialize, Tabled)]
struct RequirementRow {
    region: String,
    requirement: String,
}

fn rows(requirements: Requirements) -> Vec<RequirementRow> {
    requirements
        .into_iter()
        .flat_map(|(region, reqs)| {
            reqs.into_iter().map(move |requirement| RequirementRow {
                region: region.clone(),
                requirement,
            })
        })
        .collect()
}

fn single_region(region: String, requirements: Vec<String>) -> Requirements {
    Requirements::from([(region, requirements.into_iter().collect())])
}

/// Execute a requirement command
pub async fn execute(
    command: RequirementCommands,
    workspace: &Workspace,
    default_region: &str,
    verbose: bool,
    format: OutputFormat,
) -> CliResult<()> {
    let service = &workspace.service;
    match command {
        RequirementCommands::List => {
            output::print_output(rows(service.list_requirements().await), format)?;
        }
        RequirementCommands::Add {
            requirements,
            region,
            flags,
        } => {
            let region = region.unwrap_or_else(|| default_region.to_string());
            let outcome = service
                .add_requirements(single_region(region, requirements), flags.options(verbose))
                .await?;
            output::print_outcome("Requirement update", &outcome, format)?;
        }
        RequirementCommands::Remove {
            requirements,
            region,
            flags,
        } => {
            let region = region.unwrap_or_else(|| default_region.to_string());
            let outcome = service
                .remove_requirements(single_region(region, requirements), flags.options(verbose))
                .await?;
            output::print_outcome("Requirement update", &outcome, format)?;
        }
    }
    Ok(())
}
