//! In-memory host runtime
//!
//! Unit content is a small JSON manifest naming the unit. The whole host
//! can be exported as a [`HostImage`] and restored from one, which lets
//! the CLI keep a simulated host between invocations.

use crate::host::{FrameworkInfo, HostError, HostRuntime, RefreshGate};
use crate::repository::BundleEntry;
use async_trait::async_trait;
use bytes::Bytes;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use strata_state::content_checksum;
use strata_types::{
    Feature, InstalledUnit, Namespace, RegionDigraph, RegionPolicies, ResourceKey, ServiceRef,
    UnitId, UnitState, UnitWire, Wiring, ROOT_REGION,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Name of the always-present system unit
pub const SYSTEM_UNIT_NAME: &str = "strata.system";

/// Content format understood by [`InMemoryHost`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitManifest {
    pub name: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// Manifest content for a repository bundle
pub fn manifest_bytes(entry: &BundleEntry) -> Bytes {
    let manifest = UnitManifest {
        name: entry.name.clone(),
        version: entry.version.clone(),
        revision: entry.revision.clone(),
    };
    // A manifest of plain strings always serializes
    Bytes::from(serde_json::to_vec(&manifest).unwrap_or_default())
}

/// Serializable picture of the whole host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostImage {
    pub units: BTreeMap<UnitId, InstalledUnit>,
    pub topology: RegionDigraph,
    #[serde(default)]
    pub contents: BTreeMap<UnitId, Bytes>,
    /// Configuration pid to properties
    #[serde(default)]
    pub configs: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub libraries: BTreeSet<String>,
    pub next_id: u64,
    #[serde(default)]
    pub clock: i64,
    #[serde(default)]
    pub host_unit: Option<UnitId>,
    pub initial_start_level: u32,
    pub current_start_level: u32,
    /// Policies written by the last topology save
    #[serde(default)]
    pub saved_topology: Option<RegionPolicies>,
    #[serde(default)]
    pub restart_pending: bool,
}

impl HostImage {
    /// A host with only the system unit, active in the root region
    pub fn bootstrap() -> Self {
        let system = InstalledUnit {
            id: UnitId::SYSTEM,
            name: SYSTEM_UNIT_NAME.to_string(),
            version: Version::new(1, 0, 0),
            location: "system:strata".to_string(),
            state: UnitState::Active,
            start_level: 0,
            fragment_host: None,
            wires: Vec::new(),
            services: Vec::new(),
            last_modified: 0,
        };
        let mut topology = RegionDigraph::new();
        // A fresh digraph accepts its first region and unit
        let _ = topology.create_region(ROOT_REGION);
        let _ = topology.add_unit(ROOT_REGION, UnitId::SYSTEM);

        Self {
            units: BTreeMap::from([(UnitId::SYSTEM, system)]),
            topology,
            next_id: 1,
            initial_start_level: 80,
            current_start_level: 100,
            ..Default::default()
        }
    }
}

/// A primitive the host was asked to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Install { region: String, uri: String },
    Update(UnitId),
    Uninstall(UnitId),
    Start(UnitId),
    Stop { unit: UnitId, persistent: bool },
    SetStartLevel { unit: UnitId, level: u32 },
    Resolve(BTreeSet<UnitId>),
    Refresh(BTreeSet<UnitId>),
    ReplaceTopology,
    SaveTopology,
    InstallConfigs(String),
    DeleteConfigs(String),
    InstallLibraries(String),
    Restart,
}

#[derive(Debug, Default)]
struct Inner {
    image: HostImage,
    calls: Vec<HostCall>,
    /// Operation name to unit names or locations that fail
    failures: BTreeMap<&'static str, BTreeSet<String>>,
    abort_refresh: bool,
}

impl Inner {
    fn unit(&self, id: UnitId) -> Result<&InstalledUnit, HostError> {
        self.image.units.get(&id).ok_or(HostError::UnitNotFound(id))
    }

    fn unit_mut(&mut self, id: UnitId) -> Result<&mut InstalledUnit, HostError> {
        self.image
            .units
            .get_mut(&id)
            .ok_or(HostError::UnitNotFound(id))
    }

    fn check_failure(&self, operation: &'static str, target: &str) -> Result<(), HostError> {
        if self
            .failures
            .get(operation)
            .is_some_and(|targets| targets.contains(target))
        {
            return Err(HostError::operation(operation, target, "injected failure"));
        }
        Ok(())
    }

    fn tick(&mut self) -> i64 {
        self.image.clock += 1;
        self.image.clock
    }
}

fn parse_manifest(uri: &str, content: &[u8]) -> Result<UnitManifest, HostError> {
    serde_json::from_slice(content)
        .map_err(|e| HostError::operation("install", uri, format!("invalid manifest: {}", e)))
}

/// In-memory host runtime for development and testing
#[derive(Debug, Clone)]
pub struct InMemoryHost {
    inner: Arc<RwLock<Inner>>,
    data_dir: Option<PathBuf>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::from_image(HostImage::bootstrap())
    }

    pub fn from_image(image: HostImage) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                image,
                ..Default::default()
            })),
            data_dir: None,
        }
    }

    /// Store engine data files under `dir`
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub async fn image(&self) -> HostImage {
        self.inner.read().await.image.clone()
    }

    /// Every primitive performed so far, in order
    pub async fn calls(&self) -> Vec<HostCall> {
        self.inner.read().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.inner.write().await.calls.clear();
    }

    /// Make `operation` fail for a unit name or location
    pub async fn fail_operation(&self, operation: &'static str, target: impl Into<String>) {
        self.inner
            .write()
            .await
            .failures
            .entry(operation)
            .or_default()
            .insert(target.into());
    }

    /// Drop refresh gates instead of completing them
    pub async fn abort_refreshes(&self, abort: bool) {
        self.inner.write().await.abort_refresh = abort;
    }

    /// Declare which unit hosts the engine itself
    pub async fn set_host_unit(&self, unit: UnitId) {
        self.inner.write().await.image.host_unit = Some(unit);
    }

    pub async fn register_service(&self, unit: UnitId, service: ServiceRef) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.unit_mut(unit)?.services.push(service);
        Ok(())
    }

    pub async fn unit(&self, id: UnitId) -> Option<InstalledUnit> {
        self.inner.read().await.image.units.get(&id).cloned()
    }

    /// First unit with the given name
    pub async fn unit_named(&self, name: &str) -> Option<InstalledUnit> {
        self.inner
            .read()
            .await
            .image
            .units
            .values()
            .find(|unit| unit.name == name)
            .cloned()
    }

    pub async fn restart_pending(&self) -> bool {
        self.inner.read().await.image.restart_pending
    }
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostRuntime for InMemoryHost {
    async fn install_unit(
        &self,
        region: &str,
        uri: &str,
        content: Bytes,
    ) -> Result<InstalledUnit, HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::Install {
            region: region.to_string(),
            uri: uri.to_string(),
        });
        inner.check_failure("install", uri)?;
        let manifest = parse_manifest(uri, &content)?;

        if inner.image.topology.region(region).is_none() {
            return Err(HostError::Topology(
                strata_types::TopologyError::UnknownRegion(region.to_string()),
            ));
        }

        let id = UnitId(inner.image.next_id);
        inner.image.next_id += 1;
        let last_modified = inner.tick();
        inner.image.topology.add_unit(region, id)?;

        let unit = InstalledUnit {
            id,
            name: manifest.name,
            version: manifest.version,
            location: uri.to_string(),
            state: UnitState::Installed,
            start_level: inner.image.initial_start_level,
            fragment_host: None,
            wires: Vec::new(),
            services: Vec::new(),
            last_modified,
        };
        inner.image.units.insert(id, unit.clone());
        inner.image.contents.insert(id, content);
        debug!(unit = %id, region, uri, "Unit installed");
        Ok(unit)
    }

    async fn update_unit(&self, unit: UnitId, uri: &str, content: Bytes) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::Update(unit));
        let name = inner.unit(unit)?.name.clone();
        inner.check_failure("update", &name)?;
        let manifest = parse_manifest(uri, &content)?;
        let last_modified = inner.tick();

        let record = inner.unit_mut(unit)?;
        record.name = manifest.name;
        record.version = manifest.version;
        record.location = uri.to_string();
        record.state = UnitState::Installed;
        record.wires.clear();
        record.fragment_host = None;
        record.last_modified = last_modified;
        inner.image.contents.insert(unit, content);
        Ok(())
    }

    async fn uninstall(&self, unit: UnitId) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::Uninstall(unit));
        let name = inner.unit(unit)?.name.clone();
        inner.check_failure("uninstall", &name)?;

        inner.image.units.remove(&unit);
        inner.image.contents.remove(&unit);
        inner.image.topology.remove_unit(unit);
        for other in inner.image.units.values_mut() {
            if other.fragment_host == Some(unit) {
                other.fragment_host = None;
            }
        }
        Ok(())
    }

    async fn start(&self, unit: UnitId) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::Start(unit));
        let record = inner.unit(unit)?;
        let name = record.name.clone();
        if record.is_fragment() {
            return Err(HostError::operation("start", name, "fragments cannot be started"));
        }
        inner.check_failure("start", &name)?;
        inner.unit_mut(unit)?.state = UnitState::Active;
        Ok(())
    }

    async fn stop(&self, unit: UnitId, persistent: bool) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::Stop { unit, persistent });
        let name = inner.unit(unit)?.name.clone();
        inner.check_failure("stop", &name)?;
        let record = inner.unit_mut(unit)?;
        if record.state == UnitState::Active {
            record.state = UnitState::Resolved;
        }
        Ok(())
    }

    async fn set_start_level(&self, unit: UnitId, level: u32) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::SetStartLevel { unit, level });
        let name = inner.unit(unit)?.name.clone();
        inner.check_failure("start-level", &name)?;
        inner.unit_mut(unit)?.start_level = level;
        Ok(())
    }

    async fn resolve_units(
        &self,
        units: &BTreeSet<UnitId>,
        wiring: &Wiring,
        resource_units: &BTreeMap<ResourceKey, UnitId>,
    ) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::Resolve(units.clone()));

        let by_key: BTreeMap<ResourceKey, UnitId> = inner
            .image
            .units
            .values()
            .map(|unit| (unit.key(), unit.id))
            .collect();
        let lookup = |key: &ResourceKey| resource_units.get(key).or_else(|| by_key.get(key)).copied();

        for id in units {
            let record = inner.unit(*id)?;
            if record.state != UnitState::Installed {
                continue;
            }
            let key = resource_units
                .iter()
                .find(|(_, unit)| *unit == id)
                .map(|(key, _)| key.clone())
                .unwrap_or_else(|| record.key());

            let mut wires = Vec::new();
            let mut fragment_host = None;
            for wire in wiring.get(&key).into_iter().flatten() {
                if !wire.namespace().is_wiring() || !wire.provider.is_bundle() {
                    continue;
                }
                let Some(provider) = lookup(&wire.provider) else {
                    continue;
                };
                if wire.namespace() == &Namespace::Host {
                    fragment_host = Some(provider);
                } else {
                    wires.push(UnitWire {
                        provider,
                        namespace: wire.namespace().clone(),
                    });
                }
            }

            let record = inner.unit_mut(*id)?;
            record.wires = wires;
            record.fragment_host = fragment_host;
            record.state = UnitState::Resolved;
        }
        Ok(())
    }

    async fn refresh_units(
        &self,
        units: &BTreeSet<UnitId>,
        gate: RefreshGate,
    ) -> Result<(), HostError> {
        let abort = {
            let mut inner = self.inner.write().await;
            inner.calls.push(HostCall::Refresh(units.clone()));
            for id in units {
                let record = inner.unit_mut(*id)?;
                if record.state == UnitState::Uninstalled {
                    continue;
                }
                // Active units come back active, the others keep their state
                if record.state == UnitState::Resolved && !record.is_fragment() {
                    record.state = UnitState::Installed;
                }
            }
            inner.abort_refresh
        };

        tokio::spawn(async move {
            if abort {
                drop(gate);
            } else {
                gate.complete();
            }
        });
        Ok(())
    }

    async fn replace_topology(
        &self,
        policies: &RegionPolicies,
        placement: &BTreeMap<String, BTreeSet<UnitId>>,
    ) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::ReplaceTopology);
        inner.image.topology = RegionDigraph::from_parts(policies, placement)?;
        Ok(())
    }

    async fn save_topology(&self) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::SaveTopology);
        inner.image.saved_topology = Some(inner.image.topology.policies());
        Ok(())
    }

    async fn topology_snapshot(&self) -> Result<RegionDigraph, HostError> {
        Ok(self.inner.read().await.image.topology.clone())
    }

    async fn install_configs(&self, feature: &Feature) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::InstallConfigs(feature.id()));
        inner.check_failure("configs", &feature.id())?;
        for config in feature.all_configs() {
            let properties = inner.image.configs.entry(config.pid.clone()).or_default();
            if !config.append {
                properties.clear();
            }
            properties.extend(config.properties.clone());
        }
        Ok(())
    }

    async fn delete_configs(&self, feature: &Feature) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::DeleteConfigs(feature.id()));
        for config in feature.all_configs() {
            inner.image.configs.remove(&config.pid);
        }
        Ok(())
    }

    async fn install_libraries(&self, feature: &Feature) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::InstallLibraries(feature.id()));
        let libraries: Vec<String> = feature.all_libraries().cloned().collect();
        inner.image.libraries.extend(libraries);
        Ok(())
    }

    fn data_file(&self, name: &str) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(name))
    }

    async fn framework_info(&self) -> Result<FrameworkInfo, HostError> {
        let inner = self.inner.read().await;
        let image = &inner.image;
        Ok(FrameworkInfo {
            host_unit: image.host_unit,
            system_unit: image
                .units
                .contains_key(&UnitId::SYSTEM)
                .then_some(UnitId::SYSTEM),
            initial_start_level: image.initial_start_level,
            current_start_level: image.current_start_level,
            units: image.units.clone(),
        })
    }

    async fn content_checksum(&self, unit: UnitId) -> Option<u64> {
        self.inner
            .read()
            .await
            .image
            .contents
            .get(&unit)
            .map(|content| content_checksum(content))
    }

    async fn restart(&self) -> Result<(), HostError> {
        let mut inner = self.inner.write().await;
        inner.calls.push(HostCall::Restart);
        inner.image.restart_pending = true;
        info!("Host restart scheduled");
        Ok(())
    }
}
