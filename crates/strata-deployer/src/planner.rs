//! Deployment planner
//!
//! Diffs the snapshot against the resolver's placement and produces, per
//! region, the units to install, update in place and delete.

use crate::error::{DeployerError, Result};
use crate::host::HostRuntime;
use crate::resolver::Resolution;
use crate::snapshot::DeploymentState;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use strata_state::content_checksum;
use strata_types::{DeploymentRequest, Resource, ResourceKey, SnapshotUpdatePolicy, UnitId};
use tracing::debug;

/// Plan for one region
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegionDeployment {
    /// Sorted by name, then version
    pub to_install: Vec<Resource>,
    pub to_update: BTreeMap<UnitId, Resource>,
    pub to_delete: Vec<UnitId>,
}

impl RegionDeployment {
    pub fn is_empty(&self) -> bool {
        self.to_install.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// A complete transaction plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Deployment {
    /// Unit to content checksum observed while planning
    pub checksums: BTreeMap<UnitId, u64>,
    /// Resource to the live unit backing it
    pub resource_units: BTreeMap<ResourceKey, UnitId>,
    /// Only regions with something to do
    pub regions: BTreeMap<String, RegionDeployment>,
}

impl Deployment {
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn deleted_units(&self) -> BTreeSet<UnitId> {
        self.regions
            .values()
            .flat_map(|r| r.to_delete.iter().copied())
            .collect()
    }

    pub fn updated_units(&self) -> BTreeSet<UnitId> {
        self.regions
            .values()
            .flat_map(|r| r.to_update.keys().copied())
            .collect()
    }

    /// Human readable plan, one line per entry
    pub fn describe(&self, dstate: &DeploymentState) -> Vec<String> {
        let label = |id: &UnitId| match dstate.unit(*id) {
            Some(unit) => format!("{}/{}", unit.name, unit.version),
            None => id.to_string(),
        };
        let mut lines = Vec::new();
        for (region, plan) in &self.regions {
            lines.push(format!("  Region: {}", region));
            if !plan.to_delete.is_empty() {
                lines.push("    Bundles to uninstall:".to_string());
                lines.extend(plan.to_delete.iter().map(|id| format!("      {}", label(id))));
            }
            if !plan.to_update.is_empty() {
                lines.push("    Bundles to update:".to_string());
                lines.extend(plan.to_update.iter().map(|(id, resource)| {
                    format!("      {} -> {}", label(id), resource.key)
                }));
            }
            if !plan.to_install.is_empty() {
                lines.push("    Bundles to install:".to_string());
                lines.extend(plan.to_install.iter().map(|r| {
                    format!("      {}", r.uri.as_deref().unwrap_or(&r.key.name))
                }));
            }
        }
        lines
    }
}

/// Compute the deployment plan
pub async fn compute_deployment(
    dstate: &DeploymentState,
    request: &DeploymentRequest,
    resolution: &Resolution,
    host: &dyn HostRuntime,
) -> Result<Deployment> {
    let mut result = Deployment::default();

    // Old regions and new ones
    let mut regions: BTreeSet<&String> = dstate.state.managed_bundles.keys().collect();
    regions.extend(resolution.resources_per_region.keys());

    let system_key = dstate
        .system_unit
        .and_then(|id| dstate.unit(id))
        .map(|unit| unit.key());

    for region in regions {
        let mut plan = RegionDeployment::default();

        let mut to_deploy: Vec<&Resource> = resolution
            .resources_per_region
            .get(region)
            .into_iter()
            .flatten()
            .filter_map(|key| resolution.resource(key))
            .filter(|resource| resource.key.is_bundle())
            .collect();
        if let Some(system_key) = &system_key {
            to_deploy.retain(|resource| &resource.key != system_key);
        }

        // First pass: keep, refresh or delete every managed unit
        let managed = dstate.state.managed_bundles.get(region);
        for id in managed.into_iter().flatten() {
            let Some(unit) = dstate.unit(*id) else {
                debug!(unit = %id, region = %region, "Managed unit no longer installed");
                continue;
            };
            let key = unit.key();
            let Some(position) = to_deploy.iter().position(|resource| resource.key == key) else {
                plan.to_delete.push(*id);
                continue;
            };
            let resource = to_deploy.remove(position);
            if resource.is_updateable()
                && snapshot_changed(*id, resource, dstate, request, resolution, host, &mut result)
                    .await?
            {
                debug!(unit = %id, location = %unit.location, "Snapshot out of date");
                plan.to_update.insert(*id, resource.clone());
            }
            result.resource_units.insert(resource.key.clone(), *id);
        }

        // Second pass: reuse the highest deletion candidate within the update range
        for resource in to_deploy {
            let range = request.bundle_update_range.range_for(resource.version());
            let candidate = plan
                .to_delete
                .iter()
                .filter_map(|id| dstate.unit(*id))
                .filter(|unit| unit.name == resource.name() && range.contains(&unit.version))
                .max_by(|a, b| a.version.cmp(&b.version))
                .map(|unit| unit.id);
            match candidate {
                Some(id) => {
                    plan.to_delete.retain(|d| *d != id);
                    plan.to_update.insert(id, resource.clone());
                    result.resource_units.insert(resource.key.clone(), id);
                }
                None => plan.to_install.push(resource.clone()),
            }
        }

        plan.to_install.sort_by(|a, b| {
            a.key
                .name
                .cmp(&b.key.name)
                .then_with(|| a.key.version.cmp(&b.key.version))
        });

        if !plan.is_empty() {
            result.regions.insert(region.clone(), plan);
        }
    }

    Ok(result)
}

/// Whether a snapshot unit's content differs from the desired resource
///
/// A unit whose previous checksum is unknown is updated.
async fn snapshot_changed(
    id: UnitId,
    resource: &Resource,
    dstate: &DeploymentState,
    request: &DeploymentRequest,
    resolution: &Resolution,
    host: &dyn HostRuntime,
    result: &mut Deployment,
) -> Result<bool> {
    match request.update_snapshots {
        SnapshotUpdatePolicy::None => Ok(false),
        SnapshotUpdatePolicy::Always => Ok(true),
        SnapshotUpdatePolicy::Crc => {
            let uri = resource.uri.as_deref().unwrap_or_default();
            let content = resolution
                .content(uri)
                .ok_or_else(|| DeployerError::MissingContent(uri.to_string()))?;

            let old = match dstate.state.bundle_checksums.get(&id) {
                Some(crc) => Some(*crc),
                None => host.content_checksum(id).await,
            };
            let new = content_checksum(&content);
            result.checksums.insert(id, new);

            match old {
                Some(old) => Ok(old != new),
                None => {
                    debug!(unit = %id, "Previous checksum unknown");
                    Ok(true)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryHost;
    use bytes::Bytes;
    use semver::Version;
    use strata_types::{InstalledUnit, RangePolicy, UnitState};

    fn unit(id: u64, name: &str, version: &str) -> InstalledUnit {
        InstalledUnit {
            id: UnitId(id),
            name: name.to_string(),
            version: Version::parse(version).unwrap(),
            location: format!("mvn:org.test/{name}/{version}"),
            state: UnitState::Active,
            start_level: 80,
            fragment_host: None,
            wires: Vec::new(),
            services: Vec::new(),
            last_modified: id as i64,
        }
    }

    fn managed(units: Vec<InstalledUnit>) -> DeploymentState {
        let mut dstate = DeploymentState::default();
        for unit in units {
            dstate
                .state
                .managed_bundles
                .entry("root".to_string())
                .or_default()
                .insert(unit.id);
            dstate
                .units_per_region
                .entry("root".to_string())
                .or_default()
                .insert(unit.id);
            dstate.units.insert(unit.id, unit);
        }
        dstate
    }

    fn wanted(resources: Vec<Resource>) -> Resolution {
        let mut resolution = Resolution::default();
        for resource in resources {
            let uri = resource.uri.clone().unwrap_or_default();
            resolution
                .stream_providers
                .insert(uri.clone(), Bytes::from(format!("content of {uri}")));
            resolution
                .resources_per_region
                .entry("root".to_string())
                .or_default()
                .insert(resource.key.clone());
            resolution.resources.insert(resource.key.clone(), resource);
        }
        resolution
    }

    fn bundle(name: &str, version: &str) -> Resource {
        Resource::bundle(
            name,
            Version::parse(version).unwrap(),
            format!("mvn:org.test/{name}/{version}"),
        )
    }

    #[tokio::test]
    async fn test_installs_ordered_by_name_then_version() {
        let resolution = wanted(vec![
            bundle("c", "1.0.0"),
            bundle("a", "1.10.0"),
            bundle("b", "2.0.0"),
            bundle("a", "1.9.0"),
        ]);
        let host = InMemoryHost::new();

        let plan = compute_deployment(
            &DeploymentState::default(),
            &DeploymentRequest::new(),
            &resolution,
            &host,
        )
        .await
        .unwrap();
        let order: Vec<String> = plan.regions["root"]
            .to_install
            .iter()
            .map(|resource| format!("{}/{}", resource.key.name, resource.key.version))
            .collect();
        assert_eq!(order, vec!["a/1.9.0", "a/1.10.0", "b/2.0.0", "c/1.0.0"]);
    }

    #[tokio::test]
    async fn test_update_in_place_within_range() {
        let dstate = managed(vec![unit(1, "foo", "1.3.0")]);
        let resolution = wanted(vec![bundle("foo", "1.3.2")]);
        let host = InMemoryHost::new();

        let plan = compute_deployment(&dstate, &DeploymentRequest::new(), &resolution, &host)
            .await
            .unwrap();
        let root = &plan.regions["root"];
        assert!(root.to_install.is_empty());
        assert!(root.to_delete.is_empty());
        assert_eq!(root.to_update[&UnitId(1)].key.version, Version::new(1, 3, 2));
        assert_eq!(
            plan.resource_units[&ResourceKey::bundle("foo", Version::new(1, 3, 2))],
            UnitId(1)
        );
    }

    #[tokio::test]
    async fn test_highest_candidate_is_reused() {
        let dstate = managed(vec![unit(1, "foo", "1.3.0"), unit(2, "foo", "1.3.5")]);
        let resolution = wanted(vec![bundle("foo", "1.3.9")]);
        let host = InMemoryHost::new();

        let plan = compute_deployment(&dstate, &DeploymentRequest::new(), &resolution, &host)
            .await
            .unwrap();
        let root = &plan.regions["root"];
        assert!(root.to_update.contains_key(&UnitId(2)));
        assert_eq!(root.to_delete, vec![UnitId(1)]);
    }

    #[tokio::test]
    async fn test_out_of_range_is_replaced() {
        let dstate = managed(vec![unit(1, "foo", "1.2.0")]);
        let resolution = wanted(vec![bundle("foo", "2.0.0")]);
        let host = InMemoryHost::new();

        let plan = compute_deployment(&dstate, &DeploymentRequest::new(), &resolution, &host)
            .await
            .unwrap();
        let root = &plan.regions["root"];
        assert_eq!(root.to_delete, vec![UnitId(1)]);
        assert_eq!(root.to_install.len(), 1);

        // A wider update range turns the same change into an update
        let mut request = DeploymentRequest::new();
        request.bundle_update_range = RangePolicy::Any;
        let plan = compute_deployment(&dstate, &request, &resolution, &host)
            .await
            .unwrap();
        assert!(plan.regions["root"].to_update.contains_key(&UnitId(1)));
    }

    #[tokio::test]
    async fn test_unchanged_plan_is_empty() {
        let dstate = managed(vec![unit(1, "foo", "1.3.0")]);
        let resolution = wanted(vec![bundle("foo", "1.3.0")]);
        let host = InMemoryHost::new();

        let plan = compute_deployment(&dstate, &DeploymentRequest::new(), &resolution, &host)
            .await
            .unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.resource_units.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_checksum_policy() {
        let dstate_with = |crc: Option<u64>| {
            let mut dstate = managed(vec![unit(1, "foo", "1.0.0-SNAPSHOT")]);
            if let Some(crc) = crc {
                dstate.state.bundle_checksums.insert(UnitId(1), crc);
            }
            dstate
        };
        let resolution = wanted(vec![bundle("foo", "1.0.0-SNAPSHOT")]);
        let uri = "mvn:org.test/foo/1.0.0-SNAPSHOT";
        let current = content_checksum(&resolution.content(uri).unwrap());
        let host = InMemoryHost::new();
        let request = DeploymentRequest::new();

        // Same content: nothing to do, checksum recorded
        let plan = compute_deployment(&dstate_with(Some(current)), &request, &resolution, &host)
            .await
            .unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.checksums[&UnitId(1)], current);

        // Different content
        let plan = compute_deployment(&dstate_with(Some(current ^ 1)), &request, &resolution, &host)
            .await
            .unwrap();
        assert!(plan.updated_units().contains(&UnitId(1)));

        // Unknown previous checksum
        let plan = compute_deployment(&dstate_with(None), &request, &resolution, &host)
            .await
            .unwrap();
        assert!(plan.updated_units().contains(&UnitId(1)));

        // Never update
        let mut never = DeploymentRequest::new();
        never.update_snapshots = SnapshotUpdatePolicy::None;
        let plan = compute_deployment(&dstate_with(None), &never, &resolution, &host)
            .await
            .unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_system_unit_is_never_installed() {
        let mut dstate = DeploymentState::default();
        dstate.units.insert(UnitId(0), unit(0, "system", "1.0.0"));
        dstate.system_unit = Some(UnitId(0));
        let resolution = wanted(vec![bundle("system", "1.0.0"), bundle("bar", "1.0.0")]);
        let host = InMemoryHost::new();

        let plan = compute_deployment(&dstate, &DeploymentRequest::new(), &resolution, &host)
            .await
            .unwrap();
        let installs: Vec<&str> = plan.regions["root"]
            .to_install
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(installs, vec!["bar"]);
    }
}
