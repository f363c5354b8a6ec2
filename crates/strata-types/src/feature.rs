//! Features: named, versioned aggregates of bundles, configs and libraries

use crate::version::{VersionError, VersionRange, parse_version};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of a feature version: `name/version`
pub fn feature_id(name: &str, version: &Version) -> String {
    format!("{}/{}", name, version)
}

/// A bundle referenced by a feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub location: String,
    #[serde(default = "default_true")]
    pub start: bool,
    /// 0 means the host's initial start level
    #[serde(default)]
    pub start_level: u32,
    /// Only installed when nothing else provides its capabilities
    #[serde(default)]
    pub dependency: bool,
}

fn default_true() -> bool {
    true
}

impl BundleInfo {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            start: true,
            start_level: 0,
            dependency: false,
        }
    }
}

/// A configuration carried by a feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub pid: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Keep existing values when the configuration is already present
    #[serde(default)]
    pub append: bool,
}

/// A dependency of one feature on another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// `name`, `name/version` or `name/range`
    pub requirement: String,
    /// Must be fully deployed before the dependent feature is resolved
    #[serde(default)]
    pub prerequisite: bool,
}

/// A named, versioned aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub bundles: Vec<BundleInfo>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub configs: Vec<ConfigInfo>,
    #[serde(default)]
    pub config_files: Vec<String>,
    #[serde(default)]
    pub libraries: Vec<String>,
    /// Parts installed only once their condition features are present
    #[serde(default)]
    pub conditionals: Vec<Conditional>,
}

/// A conditional part of a feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditional {
    /// Feature requirements that must be installed
    pub condition: Vec<String>,
    #[serde(default)]
    pub bundles: Vec<BundleInfo>,
    #[serde(default)]
    pub configs: Vec<ConfigInfo>,
    #[serde(default)]
    pub libraries: Vec<String>,
}

impl Feature {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: None,
            bundles: Vec::new(),
            dependencies: Vec::new(),
            configs: Vec::new(),
            config_files: Vec::new(),
            libraries: Vec::new(),
            conditionals: Vec::new(),
        }
    }

    pub fn id(&self) -> String {
        feature_id(&self.name, &self.version)
    }

    pub fn with_bundle(mut self, bundle: BundleInfo) -> Self {
        self.bundles.push(bundle);
        self
    }

    pub fn with_dependency(mut self, requirement: impl Into<String>, prerequisite: bool) -> Self {
        self.dependencies.push(Dependency {
            requirement: requirement.into(),
            prerequisite,
        });
        self
    }

    pub fn with_config(mut self, config: ConfigInfo) -> Self {
        self.configs.push(config);
        self
    }

    /// Every config, conditional ones included
    pub fn all_configs(&self) -> impl Iterator<Item = &ConfigInfo> {
        self.configs
            .iter()
            .chain(self.conditionals.iter().flat_map(|c| c.configs.iter()))
    }

    /// Every library, conditional ones included
    pub fn all_libraries(&self) -> impl Iterator<Item = &String> {
        self.libraries
            .iter()
            .chain(self.conditionals.iter().flat_map(|c| c.libraries.iter()))
    }
}

/// Lifecycle state of an installed feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureState {
    Uninstalled,
    Installed,
    Resolved,
    Started,
}

impl fmt::Display for FeatureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninstalled => "Uninstalled",
            Self::Installed => "Installed",
            Self::Resolved => "Resolved",
            Self::Started => "Started",
        };
        f.write_str(name)
    }
}

/// A requirement on a feature: a name and an accepted version range
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeatureReq {
    pub name: String,
    pub range: VersionRange,
}

impl FeatureReq {
    /// Parse `name`, `name/version` or `name/range`
    ///
    /// A bare version is an exact match unless it is `0.0.0`, which
    /// accepts anything.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        let (name, range) = match trimmed.split_once('/') {
            None => (trimmed, VersionRange::any()),
            Some((name, version_part)) => {
                let version_part = version_part.trim();
                let range = if version_part.starts_with('[') || version_part.starts_with('(') {
                    VersionRange::parse(version_part)?
                } else {
                    let version = parse_version(version_part)?;
                    if version == Version::new(0, 0, 0) {
                        VersionRange::any()
                    } else {
                        VersionRange::exact(version)
                    }
                };
                (name, range)
            }
        };
        if name.is_empty() {
            return Err(VersionError::Invalid(input.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            range,
        })
    }

    pub fn for_feature(feature: &Feature) -> Self {
        Self {
            name: feature.name.clone(),
            range: VersionRange::exact(feature.version.clone()),
        }
    }

    pub fn matches(&self, feature: &Feature) -> bool {
        self.name == feature.name && self.range.contains(&feature.version)
    }

    /// Requirement string as stored in provisioning state
    pub fn to_requirement(&self) -> String {
        format!("{}/{}", self.name, self.range)
    }
}

impl fmt::Display for FeatureReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_requirement())
    }
}

impl FromStr for FeatureReq {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_req_parse() {
        let any = FeatureReq::parse("foo").unwrap();
        assert_eq!(any.name, "foo");
        assert!(any.range.is_any());

        let exact = FeatureReq::parse("foo/1.3.0").unwrap();
        assert_eq!(exact.to_requirement(), "foo/[1.3.0,1.3.0]");

        let range = FeatureReq::parse("foo/[1,2)").unwrap();
        let feature = Feature::new("foo", Version::new(1, 3, 0));
        assert!(range.matches(&feature));
        assert!(!range.matches(&Feature::new("foo", Version::new(2, 0, 0))));
        assert!(!range.matches(&Feature::new("bar", Version::new(1, 3, 0))));

        assert!(FeatureReq::parse("foo/0.0.0").unwrap().range.is_any());
        assert!(FeatureReq::parse("/1.0.0").is_err());
    }

    #[test]
    fn test_requirement_round_trips_through_parse() {
        let req = FeatureReq::parse("foo/[1,2)").unwrap();
        assert_eq!(FeatureReq::parse(&req.to_requirement()).unwrap(), req);
    }

    #[test]
    fn test_feature_id_and_conditionals() {
        let mut feature = Feature::new("web", Version::new(2, 1, 0)).with_config(ConfigInfo {
            pid: "org.web".to_string(),
            properties: BTreeMap::new(),
            append: false,
        });
        feature.conditionals.push(Conditional {
            condition: vec!["security".to_string()],
            bundles: Vec::new(),
            configs: vec![ConfigInfo {
                pid: "org.web.security".to_string(),
                properties: BTreeMap::new(),
                append: false,
            }],
            libraries: vec!["lib/web-sec.jar".to_string()],
        });

        assert_eq!(feature.id(), "web/2.1.0");
        assert_eq!(feature.all_configs().count(), 2);
        assert_eq!(feature.all_libraries().count(), 1);
    }
}
