//! Deployment requests

use crate::feature::FeatureState;
use crate::version::RangePolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// What to do with snapshot units whose version did not change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotUpdatePolicy {
    /// Never update in place
    None,
    /// Update when the content checksum changed
    #[default]
    Crc,
    /// Always update
    Always,
}

impl FromStr for SnapshotUpdatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "crc" => Ok(Self::Crc),
            "always" => Ok(Self::Always),
            other => Err(format!("unknown snapshot update policy: {}", other)),
        }
    }
}

impl fmt::Display for SnapshotUpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Crc => "crc",
            Self::Always => "always",
        };
        f.write_str(name)
    }
}

/// Flags controlling one deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployOptions {
    /// Do not refresh anything
    pub no_refresh: bool,
    /// Do not refresh units other than deleted or updated ones
    pub no_refresh_managed: bool,
    /// Never refresh units this engine does not manage
    pub no_refresh_unmanaged: bool,
    /// Leave newly installed features in the installed state
    pub no_start: bool,
    /// Do not adopt unmanaged units required by features
    pub no_manage: bool,
    /// Compute and report the plan without touching the host
    pub simulate: bool,
    pub verbose: bool,
    /// Remove configurations of uninstalled features
    pub delete_configurations: bool,
    /// Log the computed wiring
    pub display_wiring: bool,
    /// Replace other versions of the same feature on install
    pub upgrade: bool,
}

/// Desired state for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Region to feature requirements (`name/range`)
    pub requirements: BTreeMap<String, BTreeSet<String>>,
    /// Region to feature id to requested state
    #[serde(default)]
    pub state_changes: BTreeMap<String, BTreeMap<String, FeatureState>>,
    #[serde(default)]
    pub options: DeployOptions,
    #[serde(default)]
    pub bundle_update_range: RangePolicy,
    #[serde(default = "default_feature_resolution_range")]
    pub feature_resolution_range: RangePolicy,
    #[serde(default)]
    pub update_snapshots: SnapshotUpdatePolicy,
    #[serde(default = "default_auto_refresh")]
    pub auto_refresh: bool,
    #[serde(default)]
    pub overrides: BTreeSet<String>,
    #[serde(default)]
    pub blacklist: BTreeSet<String>,
}

fn default_feature_resolution_range() -> RangePolicy {
    RangePolicy::Exact
}

fn default_auto_refresh() -> bool {
    true
}

impl Default for DeploymentRequest {
    fn default() -> Self {
        Self {
            requirements: BTreeMap::new(),
            state_changes: BTreeMap::new(),
            options: DeployOptions::default(),
            bundle_update_range: RangePolicy::default(),
            feature_resolution_range: default_feature_resolution_range(),
            update_snapshots: SnapshotUpdatePolicy::default(),
            auto_refresh: default_auto_refresh(),
            overrides: BTreeSet::new(),
            blacklist: BTreeSet::new(),
        }
    }
}

impl DeploymentRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, region: impl Into<String>, requirement: impl Into<String>) -> Self {
        self.requirements
            .entry(region.into())
            .or_default()
            .insert(requirement.into());
        self
    }

    pub fn with_options(mut self, options: DeployOptions) -> Self {
        self.options = options;
        self
    }

    /// Options with refresh flags normalized
    ///
    /// Without auto refresh only deleted and updated units are stopped and
    /// nothing is refreshed.
    pub fn effective_options(&self) -> DeployOptions {
        let mut options = self.options.clone();
        if !self.auto_refresh {
            options.no_refresh = true;
            options.no_refresh_managed = true;
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = DeploymentRequest::new()
            .require("root", "foo/[1,2)")
            .require("root", "bar");
        assert_eq!(request.requirements["root"].len(), 2);
        assert_eq!(request.update_snapshots, SnapshotUpdatePolicy::Crc);
        assert_eq!(request.feature_resolution_range, RangePolicy::Exact);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: DeploymentRequest =
            serde_json::from_str(r#"{"requirements": {"root": ["foo"]}}"#).unwrap();
        assert!(request.auto_refresh);
        assert_eq!(request.bundle_update_range, RangePolicy::SameMinor);
        assert!(!request.options.simulate);
    }

    #[test]
    fn test_disabled_auto_refresh_suppresses_refresh() {
        let mut request = DeploymentRequest::new();
        request.auto_refresh = false;
        let options = request.effective_options();
        assert!(options.no_refresh);
        assert!(options.no_refresh_managed);
    }

    #[test]
    fn test_snapshot_policy_parse() {
        assert_eq!("ALWAYS".parse::<SnapshotUpdatePolicy>().unwrap(), SnapshotUpdatePolicy::Always);
        assert!("sometimes".parse::<SnapshotUpdatePolicy>().is_err());
    }
}
