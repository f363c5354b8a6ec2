//! Region-topology updates
//!
//! The new digraph is computed from the persisted policies and the
//! resolver's flattened graph, built as a scratch copy, validated, and only
//! then handed to the host as a whole.

use crate::error::Result;
use crate::host::HostRuntime;
use crate::snapshot::DeploymentState;
use std::collections::{BTreeMap, BTreeSet};
use strata_types::{RegionDigraph, RegionPolicies, UnitId};
use tracing::{debug, info};

/// A validated replacement topology
#[derive(Debug, Clone)]
pub struct TopologyPlan {
    pub policies: RegionPolicies,
    pub placement: BTreeMap<String, BTreeSet<UnitId>>,
    /// The scratch digraph built from `policies` and `placement`
    pub digraph: RegionDigraph,
}

/// Policies for the new topology
///
/// Regions without units are dropped, as are edges into dropped regions;
/// every region of the flattened graph gets its outbound edges from it.
pub fn compute_policies(
    current: &RegionPolicies,
    placement: &BTreeMap<String, BTreeSet<UnitId>>,
    flat: &RegionPolicies,
) -> RegionPolicies {
    let mut policies: RegionPolicies = current
        .iter()
        .filter(|(region, _)| placement.get(*region).is_some_and(|units| !units.is_empty()))
        .map(|(region, edges)| (region.clone(), edges.clone()))
        .collect();

    for (region, edges) in flat {
        let policy = policies.entry(region.clone()).or_default();
        for (target, sharing) in edges {
            let edge = policy.entry(target.clone()).or_default();
            for (namespace, filters) in sharing {
                edge.entry(namespace.clone())
                    .or_default()
                    .extend(filters.iter().cloned());
            }
        }
    }

    let regions: BTreeSet<String> = policies.keys().cloned().collect();
    for edges in policies.values_mut() {
        edges.retain(|target, _| regions.contains(target));
    }
    policies
}

/// Build and validate the replacement topology
pub fn plan_topology(
    dstate: &DeploymentState,
    placement: BTreeMap<String, BTreeSet<UnitId>>,
    flat: &RegionPolicies,
) -> Result<TopologyPlan> {
    let placement: BTreeMap<String, BTreeSet<UnitId>> = placement
        .into_iter()
        .filter(|(_, units)| !units.is_empty())
        .collect();
    let policies = compute_policies(&dstate.filters_per_region, &placement, flat);
    let digraph = RegionDigraph::from_parts(&policies, &placement)?;
    debug!(
        regions = policies.len(),
        units = digraph.units().len(),
        "Planned region topology"
    );
    Ok(TopologyPlan {
        policies,
        placement,
        digraph,
    })
}

/// Units present in the live topology that the snapshot does not know
///
/// A non-empty result means something was installed behind the engine's
/// back and the transaction must be resolved again.
pub async fn topology_drift(
    host: &dyn HostRuntime,
    dstate: &DeploymentState,
) -> Result<BTreeSet<UnitId>> {
    let live = host.topology_snapshot().await?;
    Ok(live
        .units()
        .into_iter()
        .filter(|id| !dstate.units.contains_key(id))
        .collect())
}

/// Swap the live digraph for the planned one and persist it
pub async fn commit_topology(host: &dyn HostRuntime, plan: &TopologyPlan) -> Result<()> {
    host.replace_topology(&plan.policies, &plan.placement).await?;
    host.save_topology().await?;
    info!(regions = plan.policies.len(), "Region topology replaced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::SharingPolicy;

    fn sharing(namespace: &str, filter: &str) -> SharingPolicy {
        SharingPolicy::from([(namespace.to_string(), BTreeSet::from([filter.to_string()]))])
    }

    fn edges(target: &str, policy: SharingPolicy) -> BTreeMap<String, SharingPolicy> {
        BTreeMap::from([(target.to_string(), policy)])
    }

    #[test]
    fn test_empty_regions_are_dropped_with_their_edges() {
        let current = RegionPolicies::from([
            ("root".to_string(), BTreeMap::new()),
            ("old".to_string(), edges("root", sharing("pkg", "*"))),
            ("app".to_string(), edges("old", sharing("pkg", "*"))),
        ]);
        let placement = BTreeMap::from([
            ("root".to_string(), BTreeSet::from([UnitId(1)])),
            ("app".to_string(), BTreeSet::from([UnitId(2)])),
        ]);

        let policies = compute_policies(&current, &placement, &RegionPolicies::new());
        assert_eq!(policies.keys().cloned().collect::<Vec<_>>(), vec!["app", "root"]);
        assert!(policies["app"].is_empty());
    }

    #[test]
    fn test_flat_graph_filters_are_merged() {
        let current = RegionPolicies::from([
            ("root".to_string(), BTreeMap::new()),
            ("app".to_string(), edges("root", sharing("pkg", "(a)"))),
        ]);
        let placement = BTreeMap::from([
            ("root".to_string(), BTreeSet::from([UnitId(1)])),
            ("app".to_string(), BTreeSet::from([UnitId(2)])),
        ]);
        let flat = RegionPolicies::from([
            ("app".to_string(), edges("root", sharing("pkg", "(b)"))),
            ("fresh".to_string(), edges("root", sharing("svc", "*"))),
        ]);

        let policies = compute_policies(&current, &placement, &flat);
        assert_eq!(policies["app"]["root"]["pkg"].len(), 2);
        // Regions of the flattened graph survive even before their first unit
        assert!(policies.contains_key("fresh"));
    }

    #[test]
    fn test_plan_builds_valid_digraph() {
        let mut dstate = DeploymentState::default();
        dstate.filters_per_region = RegionPolicies::from([("root".to_string(), BTreeMap::new())]);
        let placement = BTreeMap::from([
            ("root".to_string(), BTreeSet::from([UnitId(0), UnitId(1)])),
            ("empty".to_string(), BTreeSet::new()),
        ]);

        let plan = plan_topology(&dstate, placement, &RegionPolicies::new()).unwrap();
        assert_eq!(plan.digraph.units(), BTreeSet::from([UnitId(0), UnitId(1)]));
        assert!(!plan.placement.contains_key("empty"));
    }
}
