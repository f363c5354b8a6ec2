//! Isolation regions and the region digraph
//!
//! Every installed unit belongs to exactly one region. Regions are linked by
//! directed edges carrying a sharing policy: per capability namespace, the
//! filters a capability must match to be visible across the edge.
//!
//! The digraph is treated as a value: readers work on a clone and writers
//! build a complete replacement that is validated before it is swapped in.

use crate::UnitId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Namespace to filters allowed across one edge
pub type SharingPolicy = BTreeMap<String, BTreeSet<String>>;

/// Region to target region to sharing policy
pub type RegionPolicies = BTreeMap<String, BTreeMap<String, SharingPolicy>>;

/// Topology errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("region not found: {0}")]
    UnknownRegion(String),

    #[error("region already exists: {0}")]
    RegionExists(String),

    #[error("unit {unit} already belongs to region {region}")]
    UnitAlreadyPlaced { unit: UnitId, region: String },

    #[error("region {0} cannot be connected to itself")]
    SelfEdge(String),
}

/// A named isolation domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub units: BTreeSet<UnitId>,
    /// Outbound edges keyed by target region
    pub edges: BTreeMap<String, SharingPolicy>,
}

/// Regions and their sharing edges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDigraph {
    regions: BTreeMap<String, Region>,
}

impl RegionDigraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a digraph from policies and unit placement
    ///
    /// Regions named by either map are created. Edges may only target
    /// regions that exist in the result.
    pub fn from_parts(
        policies: &RegionPolicies,
        placement: &BTreeMap<String, BTreeSet<UnitId>>,
    ) -> Result<Self, TopologyError> {
        let mut digraph = Self::new();
        for name in policies.keys().chain(placement.keys()) {
            if digraph.region(name).is_none() {
                digraph.create_region(name)?;
            }
        }
        for (region, units) in placement {
            for unit in units {
                digraph.add_unit(region, *unit)?;
            }
        }
        for (region, edges) in policies {
            for (target, policy) in edges {
                digraph.connect(region, target, policy.clone())?;
            }
        }
        Ok(digraph)
    }

    pub fn create_region(&mut self, name: &str) -> Result<&mut Region, TopologyError> {
        if self.regions.contains_key(name) {
            return Err(TopologyError::RegionExists(name.to_string()));
        }
        Ok(self.regions.entry(name.to_string()).or_insert_with(|| Region {
            name: name.to_string(),
            ..Default::default()
        }))
    }

    /// Remove a region and every edge pointing at it
    pub fn remove_region(&mut self, name: &str) -> Option<Region> {
        let removed = self.regions.remove(name)?;
        for region in self.regions.values_mut() {
            region.edges.remove(name);
        }
        Some(removed)
    }

    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.get(name)
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Add or extend the edge `from -> to`
    pub fn connect(
        &mut self,
        from: &str,
        to: &str,
        policy: SharingPolicy,
    ) -> Result<(), TopologyError> {
        if from == to {
            return Err(TopologyError::SelfEdge(from.to_string()));
        }
        if !self.regions.contains_key(to) {
            return Err(TopologyError::UnknownRegion(to.to_string()));
        }
        let region = self
            .regions
            .get_mut(from)
            .ok_or_else(|| TopologyError::UnknownRegion(from.to_string()))?;
        let edge = region.edges.entry(to.to_string()).or_default();
        for (namespace, filters) in policy {
            edge.entry(namespace).or_default().extend(filters);
        }
        Ok(())
    }

    pub fn add_unit(&mut self, region: &str, unit: UnitId) -> Result<(), TopologyError> {
        if let Some(owner) = self.region_of(unit) {
            if owner != region {
                return Err(TopologyError::UnitAlreadyPlaced {
                    unit,
                    region: owner.to_string(),
                });
            }
            return Ok(());
        }
        self.regions
            .get_mut(region)
            .ok_or_else(|| TopologyError::UnknownRegion(region.to_string()))?
            .units
            .insert(unit);
        Ok(())
    }

    pub fn remove_unit(&mut self, unit: UnitId) -> bool {
        self.regions
            .values_mut()
            .any(|region| region.units.remove(&unit))
    }

    pub fn region_of(&self, unit: UnitId) -> Option<&str> {
        self.regions
            .values()
            .find(|region| region.units.contains(&unit))
            .map(|region| region.name.as_str())
    }

    /// Every unit placed in the digraph
    pub fn units(&self) -> BTreeSet<UnitId> {
        self.regions
            .values()
            .flat_map(|region| region.units.iter().copied())
            .collect()
    }

    pub fn units_per_region(&self) -> BTreeMap<String, BTreeSet<UnitId>> {
        self.regions
            .values()
            .map(|region| (region.name.clone(), region.units.clone()))
            .collect()
    }

    pub fn policies(&self) -> RegionPolicies {
        self.regions
            .values()
            .map(|region| (region.name.clone(), region.edges.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(namespace: &str, filter: &str) -> SharingPolicy {
        let mut policy = SharingPolicy::new();
        policy
            .entry(namespace.to_string())
            .or_default()
            .insert(filter.to_string());
        policy
    }

    #[test]
    fn test_unit_belongs_to_one_region() {
        let mut digraph = RegionDigraph::new();
        digraph.create_region("root").unwrap();
        digraph.create_region("app").unwrap();
        digraph.add_unit("root", UnitId(1)).unwrap();

        assert!(digraph.add_unit("root", UnitId(1)).is_ok());
        assert_eq!(
            digraph.add_unit("app", UnitId(1)),
            Err(TopologyError::UnitAlreadyPlaced {
                unit: UnitId(1),
                region: "root".to_string()
            })
        );
        assert_eq!(digraph.region_of(UnitId(1)), Some("root"));
    }

    #[test]
    fn test_connect_merges_filters() {
        let mut digraph = RegionDigraph::new();
        digraph.create_region("root").unwrap();
        digraph.create_region("app").unwrap();
        digraph.connect("app", "root", policy("pkg", "(a)")).unwrap();
        digraph.connect("app", "root", policy("pkg", "(b)")).unwrap();

        let edge = &digraph.region("app").unwrap().edges["root"];
        assert_eq!(edge["pkg"].len(), 2);
        assert!(digraph.connect("app", "missing", SharingPolicy::new()).is_err());
        assert!(digraph.connect("app", "app", SharingPolicy::new()).is_err());
    }

    #[test]
    fn test_from_parts_and_remove_region() {
        let mut policies = RegionPolicies::new();
        policies
            .entry("app".to_string())
            .or_default()
            .insert("root".to_string(), policy("pkg", "*"));
        let mut placement = BTreeMap::new();
        placement.insert("root".to_string(), BTreeSet::from([UnitId(1)]));
        placement.insert("app".to_string(), BTreeSet::from([UnitId(2)]));

        let mut digraph = RegionDigraph::from_parts(&policies, &placement).unwrap();
        assert_eq!(digraph.units().len(), 2);
        assert_eq!(digraph.policies(), {
            let mut expected = policies.clone();
            expected.insert("root".to_string(), BTreeMap::new());
            expected
        });

        digraph.remove_region("root");
        assert!(digraph.region("app").unwrap().edges.is_empty());
    }
}
