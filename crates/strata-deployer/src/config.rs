//! Configuration for the provisioning service

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use strata_types::{DeploymentRequest, RangePolicy, SnapshotUpdatePolicy};

/// Provisioning service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployerConfig {
    /// How far an installed unit may be from a desired version and still be updated in place
    #[serde(default)]
    pub bundle_update_range: RangePolicy,

    /// How installed prerequisite features are matched
    #[serde(default = "default_feature_resolution_range")]
    pub feature_resolution_range: RangePolicy,

    /// Snapshot unit update policy
    #[serde(default)]
    pub update_snapshots: SnapshotUpdatePolicy,

    /// Refresh units whose wiring changed
    #[serde(default = "default_true")]
    pub auto_refresh: bool,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Directory for engine data files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// State document location, relative to `data_dir` unless absolute
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Feature requirements that are never installed
    #[serde(default)]
    pub blacklist: BTreeSet<String>,

    /// Bundle locations replacing their older counterparts
    #[serde(default)]
    pub overrides: BTreeSet<String>,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            bundle_update_range: RangePolicy::default(),
            feature_resolution_range: default_feature_resolution_range(),
            update_snapshots: SnapshotUpdatePolicy::default(),
            auto_refresh: true,
            event_capacity: default_event_capacity(),
            data_dir: default_data_dir(),
            state_file: default_state_file(),
            blacklist: BTreeSet::new(),
            overrides: BTreeSet::new(),
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_feature_resolution_range() -> RangePolicy {
    RangePolicy::Exact
}

fn default_event_capacity() -> usize {
    4096
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("state.json")
}

impl DeployerConfig {
    /// Load configuration: defaults, then an optional file, then `STRATA_` variables
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DeployerConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Add environment variables with STRATA_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("STRATA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Resolved state document path
    pub fn state_path(&self) -> PathBuf {
        if self.state_file.is_absolute() {
            self.state_file.clone()
        } else {
            self.data_dir.join(&self.state_file)
        }
    }

    /// A request template carrying the configured policies
    pub fn request_template(&self) -> DeploymentRequest {
        DeploymentRequest {
            bundle_update_range: self.bundle_update_range,
            feature_resolution_range: self.feature_resolution_range,
            update_snapshots: self.update_snapshots,
            auto_refresh: self.auto_refresh,
            overrides: self.overrides.clone(),
            blacklist: self.blacklist.clone(),
            ..DeploymentRequest::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeployerConfig::default();
        assert_eq!(config.bundle_update_range, RangePolicy::SameMinor);
        assert_eq!(config.feature_resolution_range, RangePolicy::Exact);
        assert_eq!(config.update_snapshots, SnapshotUpdatePolicy::Crc);
        assert!(config.auto_refresh);
        assert_eq!(config.state_path(), PathBuf::from("data").join("state.json"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(
            &path,
            "update_snapshots = \"always\"\nbundle_update_range = \"same-major\"\n",
        )
        .unwrap();

        let config = DeployerConfig::load(path.to_str()).unwrap();
        assert_eq!(config.update_snapshots, SnapshotUpdatePolicy::Always);
        assert_eq!(config.bundle_update_range, RangePolicy::SameMajor);
        assert_eq!(config.event_capacity, 4096);
    }

    #[test]
    fn test_request_template_carries_policies() {
        let config = DeployerConfig {
            auto_refresh: false,
            ..Default::default()
        };
        let request = config.request_template();
        assert!(!request.auto_refresh);
        assert!(request.requirements.is_empty());
    }
}
