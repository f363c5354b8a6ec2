//! Feature commands

use clap::{Subcommand, ValueEnum};
use serde::Serialize;
use strata_deployer::StateChanges;
use strata_types::{Feature, FeatureState};
use tabled::Tabled;

use super::DeployFlags;
use crate::error::{CliError, CliResult};
use crate::output::{self, print_info, OutputFormat};
use crate::workspace::Workspace;

/// Feature subcommands
#[derive(Subcommand)]
pub enum FeatureCommands {
    /// List available features
    List {
        /// Only installed features
        #[arg(short, long)]
        installed: bool,

        /// Only features matched by a requirement
        #[arg(long)]
        required: bool,
    },

    /// Show a feature definition
    Info {
        /// Feature name
        name: String,

        /// Version or range; the highest match is shown
        #[arg(short = 'V', long)]
        version: Option<String>,
    },

    /// Install features (`name` or `name/range`)
    Install {
        #[arg(required = true)]
        features: Vec<String>,

        /// Target region
        #[arg(long)]
        region: Option<String>,

        /// Replace requirements on other versions of the same features
        #[arg(short, long)]
        upgrade: bool,

        #[command(flatten)]
        flags: DeployFlags,
    },

    /// Uninstall features
    Uninstall {
        #[arg(required = true)]
        features: Vec<String>,

        /// Region the features were installed into
        #[arg(long)]
        region: Option<String>,

        /// Also remove the features' configurations
        #[arg(long)]
        delete_configs: bool,

        #[command(flatten)]
        flags: DeployFlags,
    },

    /// Move an installed feature to another lifecycle state
    State {
        /// Feature id (`name/version`)
        feature_id: String,

        /// Requested state
        #[arg(value_enum)]
        state: TargetState,

        #[arg(long)]
        region: Option<String>,

        #[command(flatten)]
        flags: DeployFlags,
    },
}

/// Lifecycle state accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TargetState {
    Installed,
    Resolved,
    Started,
}

impl From<TargetState> for FeatureState {
    fn from(state: TargetState) -> Self {
        match state {
            TargetState::Installed => FeatureState::Installed,
            TargetState::Resolved => FeatureState::Resolved,
            TargetState::Started => FeatureState::Started,
        }
    }
}

/// Table row for feature display
#[derive(Debug, Serialize, Tabled)]
struct FeatureRow {
    name: String,
    version: String,
    installed: String,
    required: String,
    description: String,
}

fn mark(flag: bool) -> String {
    if flag { "x" } else { "" }.to_string()
}

/// Execute a feature command
pub async fn execute(
    command: FeatureCommands,
    workspace: &Workspace,
    default_region: &str,
    verbose: bool,
    format: OutputFormat,
) -> CliResult<()> {
    let service = &workspace.service;
    match command {
        FeatureCommands::List {
            installed,
            required,
        } => {
            let features = if installed {
                service.list_installed_features().await
            } else if required {
                service.list_required_features().await
            } else {
                service.list_features()
            };
            let mut rows = Vec::with_capacity(features.len());
            for feature in features {
                rows.push(FeatureRow {
                    installed: mark(service.is_installed(&feature).await),
                    required: mark(service.is_required(&feature).await),
                    name: feature.name,
                    version: feature.version.to_string(),
                    description: feature.description.unwrap_or_default(),
                });
            }
            output::print_output(rows, format)?;
        }
        FeatureCommands::Info { name, version } => {
            let feature: Feature = service
                .feature(&name, version.as_deref())?
                .ok_or_else(|| CliError::InvalidInput(format!("no feature named {}", name)))?;
            output::print_single(&feature, format)?;
        }
        FeatureCommands::Install {
            features,
            region,
            upgrade,
            flags,
        } => {
            let region = region.unwrap_or_else(|| default_region.to_string());
            let mut options = flags.options(verbose);
            options.upgrade = upgrade;
            if format == OutputFormat::Table {
                print_info(&format!("Installing {} into {}", features.join(", "), region));
            }
            let outcome = service.install_features(&features, &region, options).await?;
            output::print_outcome("Install", &outcome, format)?;
        }
        FeatureCommands::Uninstall {
            features,
            region,
            delete_configs,
            flags,
        } => {
            let region = region.unwrap_or_else(|| default_region.to_string());
            let mut options = flags.options(verbose);
            options.delete_configurations = delete_configs;
            if format == OutputFormat::Table {
                print_info(&format!("Uninstalling {} from {}", features.join(", "), region));
            }
            let outcome = service
                .uninstall_features(&features, &region, options)
                .await?;
            output::print_outcome("Uninstall", &outcome, format)?;
        }
        FeatureCommands::State {
            feature_id,
            state,
            region,
            flags,
        } => {
            let region = region.unwrap_or_else(|| default_region.to_string());
            if service.feature_state(&region, &feature_id).await.is_none() {
                return Err(CliError::InvalidInput(format!(
                    "feature {} is not installed in {}",
                    feature_id, region
                )));
            }
            let mut changes = StateChanges::new();
            changes
                .entry(region)
                .or_default()
                .insert(feature_id, state.into());
            let outcome = service
                .update_features_state(changes, flags.options(verbose))
                .await?;
            output::print_outcome("State change", &outcome, format)?;
        }
    }
    Ok(())
}
