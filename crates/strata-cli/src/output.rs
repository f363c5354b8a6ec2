//! Output formatting utilities

use colored::*;
use serde::{Deserialize, Serialize};
use strata_deployer::{DeployOutcome, DeploymentReport};
use tabled::{Table, Tabled};

use crate::error::CliResult;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Pretty-printed table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Print a list of rows in the requested format
pub fn print_output<T: Serialize + Tabled>(data: Vec<T>, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No results".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&data)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&data)?),
    }
    Ok(())
}

/// Print a single document; tables fall back to JSON
pub fn print_single<T: Serialize>(data: &T, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Table | OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(data)?)
        }
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(data)?),
    }
    Ok(())
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue(), message);
}

/// Report how a provisioning transaction ended
pub fn print_outcome(action: &str, outcome: &DeployOutcome, format: OutputFormat) -> CliResult<()> {
    match outcome {
        DeployOutcome::Completed => print_success(&format!("{} completed", action)),
        DeployOutcome::Simulated(report) => print_report(report, format)?,
        DeployOutcome::Partial { missing } => print_warning(&format!(
            "{} deployed prerequisites only: {}",
            action,
            missing.iter().cloned().collect::<Vec<_>>().join(", ")
        )),
        DeployOutcome::NeedsRetry { reason } => {
            print_warning(&format!("{} not applied: {}", action, reason))
        }
        DeployOutcome::SelfUpdated => {
            print_info("Engine unit updated; the request resumes on the next invocation")
        }
        DeployOutcome::RestartScheduled => {
            print_info("System unit refresh required; host restart scheduled")
        }
    }
    Ok(())
}

/// Simulation report: the plan lines, or the whole report as a document
fn print_report(report: &DeploymentReport, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Table => {
            if report.lines.is_empty() {
                println!("{}", "No changes".dimmed());
            }
            for line in &report.lines {
                println!("{}", line);
            }
            Ok(())
        }
        _ => print_single(report, format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_default() {
        assert_eq!(OutputFormat::default(), OutputFormat::Table);
    }

    #[test]
    fn test_print_single_serializes() {
        let report = DeploymentReport::default();
        assert!(print_single(&report, OutputFormat::Json).is_ok());
        assert!(print_single(&report, OutputFormat::Yaml).is_ok());
    }
}
