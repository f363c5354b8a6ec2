//! Deployment-state snapshots
//!
//! A [`DeploymentState`] is an immutable picture of the live host taken at
//! the start of a transaction: every installed unit, its region, the
//! sharing policies between regions, and the provisioning state copy the
//! transaction computes against.

use crate::host::{HostError, HostRuntime};
use crate::repository::BundleEntry;
use std::collections::{BTreeMap, BTreeSet};
use strata_state::State;
use strata_types::{Feature, InstalledUnit, RegionPolicies, ResourceKey, UnitId};
use tracing::debug;

/// What the engine knows about the live host
#[derive(Debug, Clone, Default)]
pub struct DeploymentState {
    /// Copy of the provisioning state
    pub state: State,
    pub host_unit: Option<UnitId>,
    pub system_unit: Option<UnitId>,
    pub initial_start_level: u32,
    pub current_start_level: u32,
    pub units: BTreeMap<UnitId, InstalledUnit>,
    /// Available features by id
    pub features: BTreeMap<String, Feature>,
    /// Available bundles by location
    pub bundles: BTreeMap<String, BundleEntry>,
    pub units_per_region: BTreeMap<String, BTreeSet<UnitId>>,
    pub filters_per_region: RegionPolicies,
}

impl DeploymentState {
    /// Read the live host into a snapshot
    pub async fn capture(
        host: &dyn HostRuntime,
        state: State,
        features: impl IntoIterator<Item = Feature>,
    ) -> Result<Self, HostError> {
        let info = host.framework_info().await?;
        let topology = host.topology_snapshot().await?;

        let snapshot = Self {
            state,
            host_unit: info.host_unit,
            system_unit: info.system_unit,
            initial_start_level: info.initial_start_level,
            current_start_level: info.current_start_level,
            units: info.units,
            features: features.into_iter().map(|f| (f.id(), f)).collect(),
            bundles: BTreeMap::new(),
            units_per_region: topology.units_per_region(),
            filters_per_region: topology.policies(),
        };
        debug!(
            units = snapshot.units.len(),
            regions = snapshot.units_per_region.len(),
            "Captured deployment state"
        );
        Ok(snapshot)
    }

    /// Attach the bundle catalog the resolver picks from
    pub fn with_bundles(mut self, bundles: impl IntoIterator<Item = BundleEntry>) -> Self {
        self.bundles = bundles
            .into_iter()
            .map(|entry| (entry.uri.clone(), entry))
            .collect();
        self
    }

    pub fn unit(&self, id: UnitId) -> Option<&InstalledUnit> {
        self.units.get(&id)
    }

    /// Region to units present in the host but not managed by the engine
    pub fn unmanaged_units(&self) -> BTreeMap<String, BTreeSet<UnitId>> {
        self.units_per_region
            .iter()
            .filter_map(|(region, units)| {
                let managed = self.state.managed_bundles.get(region);
                let unmanaged: BTreeSet<UnitId> = units
                    .iter()
                    .filter(|id| !managed.is_some_and(|m| m.contains(id)))
                    .filter(|id| self.units.contains_key(id))
                    .copied()
                    .collect();
                (!unmanaged.is_empty()).then(|| (region.clone(), unmanaged))
            })
            .collect()
    }

    /// Region to unmanaged units, resolved to their live records
    pub fn unmanaged_records(&self) -> BTreeMap<String, Vec<InstalledUnit>> {
        self.unmanaged_units()
            .into_iter()
            .map(|(region, ids)| {
                let records = ids.iter().filter_map(|id| self.units.get(id)).cloned().collect();
                (region, records)
            })
            .collect()
    }

    /// Live unit carrying `key`, lowest id first
    pub fn unit_by_key(&self, key: &ResourceKey) -> Option<UnitId> {
        self.units
            .values()
            .find(|unit| &unit.key() == key)
            .map(|unit| unit.id)
    }

    pub fn region_of(&self, unit: UnitId) -> Option<&str> {
        self.units_per_region
            .iter()
            .find(|(_, units)| units.contains(&unit))
            .map(|(region, _)| region.as_str())
    }

    /// Features with the given name, any version
    pub fn features_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Feature> + 'a {
        self.features.values().filter(move |f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use strata_types::UnitState;

    pub(crate) fn unit(id: u64, name: &str) -> InstalledUnit {
        InstalledUnit {
            id: UnitId(id),
            name: name.to_string(),
            version: Version::new(1, 0, 0),
            location: format!("mvn:org.test/{name}/1.0.0"),
            state: UnitState::Active,
            start_level: 80,
            fragment_host: None,
            wires: Vec::new(),
            services: Vec::new(),
            last_modified: 0,
        }
    }

    #[test]
    fn test_unmanaged_is_placed_minus_managed() {
        let mut dstate = DeploymentState::default();
        for (id, name) in [(0, "system"), (1, "a"), (2, "b"), (3, "c")] {
            dstate.units.insert(UnitId(id), unit(id, name));
        }
        dstate.units_per_region.insert(
            "root".to_string(),
            BTreeSet::from([UnitId(0), UnitId(1), UnitId(2)]),
        );
        dstate
            .units_per_region
            .insert("app".to_string(), BTreeSet::from([UnitId(3)]));
        dstate
            .state
            .managed_bundles
            .insert("root".to_string(), BTreeSet::from([UnitId(1)]));
        dstate
            .state
            .managed_bundles
            .insert("app".to_string(), BTreeSet::from([UnitId(3)]));

        let unmanaged = dstate.unmanaged_units();
        assert_eq!(unmanaged.len(), 1);
        assert_eq!(unmanaged["root"], BTreeSet::from([UnitId(0), UnitId(2)]));
        assert_eq!(dstate.unmanaged_records()["root"].len(), 2);
        assert_eq!(dstate.region_of(UnitId(3)), Some("app"));
        assert_eq!(
            dstate.unit_by_key(&ResourceKey::bundle("b", Version::new(1, 0, 0))),
            Some(UnitId(2))
        );
    }
}
