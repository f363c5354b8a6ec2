//! Deployer error types

use crate::host::HostError;
use crate::repository::RepositoryError;
use crate::resolver::ResolveError;
use std::collections::BTreeSet;
use std::fmt;
use strata_state::StateError;
use strata_types::{TopologyError, VersionError};
use thiserror::Error;

/// One failed primitive operation inside a phase
#[derive(Debug)]
pub struct UnitFailure {
    /// Unit identity, `name/version` or `#id`
    pub unit: String,
    pub error: HostError,
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.unit, self.error)
    }
}

/// Deployer errors
#[derive(Debug, Error)]
pub enum DeployerError {
    #[error("Unable to resolve requirements: {0}")]
    Resolution(#[from] ResolveError),

    #[error("Circular prerequisites: {}", join(.0))]
    CircularPrerequisite(BTreeSet<String>),

    #[error("Loop in missing prerequisites: {}", join(.0))]
    PrerequisiteLoop(BTreeSet<String>),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("No content available for {0}")]
    MissingContent(String),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("{phase}: {}", join_failures(.failures))]
    Aggregate {
        phase: String,
        failures: Vec<UnitFailure>,
    },

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Invalid requirement: {0}")]
    InvalidRequirement(#[from] VersionError),

    #[error("No matching feature for {0}")]
    FeatureNotFound(String),

    #[error("Feature {0} is not installed")]
    NotInstalled(String),

    #[error("Repository {uri} is still required by {features}")]
    RepositoryInUse { uri: String, features: String },

    #[error("Provisioning task failed: {0}")]
    Internal(String),
}

fn join(items: &BTreeSet<String>) -> String {
    items.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn join_failures(failures: &[UnitFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl DeployerError {
    /// Collapse per-unit failures of a phase into an error, if any
    pub fn aggregate(phase: &str, failures: Vec<UnitFailure>) -> Result<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Self::Aggregate {
                phase: phase.to_string(),
                failures,
            })
        }
    }
}

/// Result type for deployer operations
pub type Result<T> = std::result::Result<T, DeployerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::UnitId;

    #[test]
    fn test_aggregate_lists_every_failure() {
        assert!(DeployerError::aggregate("Error starting units", Vec::new()).is_ok());

        let err = DeployerError::aggregate(
            "Error starting units",
            vec![
                UnitFailure {
                    unit: "a/1.0.0".to_string(),
                    error: HostError::UnitNotFound(UnitId(4)),
                },
                UnitFailure {
                    unit: "b/1.0.0".to_string(),
                    error: HostError::UnitNotFound(UnitId(5)),
                },
            ],
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Error starting units: a/1.0.0"));
        assert!(message.contains("b/1.0.0"));
    }

    #[test]
    fn test_circular_prerequisite_message() {
        let err = DeployerError::CircularPrerequisite(BTreeSet::from(["baz/1.0.0".to_string()]));
        assert_eq!(err.to_string(), "Circular prerequisites: baz/1.0.0");
    }
}
