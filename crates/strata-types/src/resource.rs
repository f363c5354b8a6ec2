//! Resources, capabilities and wires
//!
//! A [`Resource`] is what the resolver wants deployed; a [`Wire`] is a
//! resolved link from a requirer to the provider satisfying one of its
//! requirements.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Kind of deployable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A runtime-loadable unit
    Bundle,
    /// A feature aggregate
    Feature,
    /// A nested region subsystem
    Subsystem,
}

/// Identity of a resource: kind, name and version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
    pub version: Version,
}

impl ResourceKey {
    pub fn bundle(name: impl Into<String>, version: Version) -> Self {
        Self {
            kind: ResourceKind::Bundle,
            name: name.into(),
            version,
        }
    }

    pub fn feature(name: impl Into<String>, version: Version) -> Self {
        Self {
            kind: ResourceKind::Feature,
            name: name.into(),
            version,
        }
    }

    pub fn is_bundle(&self) -> bool {
        self.kind == ResourceKind::Bundle
    }

    pub fn is_feature(&self) -> bool {
        self.kind == ResourceKind::Feature
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Requirement and capability namespaces
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Identity,
    Package,
    Bundle,
    Host,
    ExecutionEnvironment,
    Service,
    Other(String),
}

impl Namespace {
    /// Namespaces whose wires bind class loading at resolve time
    pub fn is_wiring(&self) -> bool {
        matches!(self, Self::Package | Self::Bundle | Self::Host)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Identity => "osgi.identity",
            Self::Package => "osgi.wiring.package",
            Self::Bundle => "osgi.wiring.bundle",
            Self::Host => "osgi.wiring.host",
            Self::ExecutionEnvironment => "osgi.ee",
            Self::Service => "osgi.service",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a requirement is considered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effective {
    #[default]
    Resolve,
    Active,
}

/// Something a resource offers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub namespace: Namespace,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Something a resource needs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    pub namespace: Namespace,
    /// Target expression, e.g. a package name or `name/range`
    pub target: String,
    #[serde(default)]
    pub effective: Effective,
    #[serde(default)]
    pub optional: bool,
    /// Only active while the owning feature's condition holds
    #[serde(default)]
    pub conditional: bool,
}

impl Requirement {
    pub fn new(namespace: Namespace, target: impl Into<String>) -> Self {
        Self {
            namespace,
            target: target.into(),
            effective: Effective::Resolve,
            optional: false,
            conditional: false,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}; {}", self.namespace, self.target)
    }
}

/// A desired deployable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub key: ResourceKey,
    /// Source location; features have none
    pub uri: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    /// Declared start flag
    #[serde(default = "default_start")]
    pub start: bool,
    /// Declared start level, 0 means the host default
    #[serde(default)]
    pub start_level: u32,
}

fn default_start() -> bool {
    true
}

impl Resource {
    pub fn bundle(name: impl Into<String>, version: Version, uri: impl Into<String>) -> Self {
        Self {
            key: ResourceKey::bundle(name, version),
            uri: Some(uri.into()),
            capabilities: Vec::new(),
            requirements: Vec::new(),
            start: true,
            start_level: 0,
        }
    }

    pub fn feature(name: impl Into<String>, version: Version) -> Self {
        Self {
            key: ResourceKey::feature(name, version),
            uri: None,
            capabilities: Vec::new(),
            requirements: Vec::new(),
            start: true,
            start_level: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn version(&self) -> &Version {
        &self.key.version
    }

    /// Whether the content behind this resource may change at a fixed version
    ///
    /// Maven artifacts are immutable unless they are snapshots; any other
    /// location is assumed mutable.
    pub fn is_updateable(&self) -> bool {
        match &self.uri {
            Some(uri) if uri.starts_with("mvn:") => uri.ends_with("SNAPSHOT"),
            Some(_) => true,
            None => false,
        }
    }
}

/// A resolved link from a requirer to a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Wire {
    pub requirer: ResourceKey,
    pub provider: ResourceKey,
    pub requirement: Requirement,
}

impl Wire {
    pub fn new(requirer: ResourceKey, provider: ResourceKey, requirement: Requirement) -> Self {
        Self {
            requirer,
            provider,
            requirement,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.requirement.namespace
    }
}

/// Wiring graph: requirer to its outbound wires
pub type Wiring = BTreeMap<ResourceKey, Vec<Wire>>;

/// Providers reached from `requirer` over wires matching `filter`
pub fn providers_of<'a>(
    wiring: &'a Wiring,
    requirer: &ResourceKey,
    filter: impl Fn(&Wire) -> bool,
) -> BTreeSet<&'a ResourceKey> {
    wiring
        .get(requirer)
        .into_iter()
        .flatten()
        .filter(|wire| filter(wire))
        .map(|wire| &wire.provider)
        .collect()
}
