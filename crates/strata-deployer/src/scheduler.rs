//! Execution scheduler: stop and start ordering
//!
//! Stopping walks start levels downwards and, inside a level, stops units
//! whose services nobody else in the level still uses. Starting walks start
//! levels upwards, providers before their dependents, and always starts the
//! unit hosting the engine last.

use crate::error::{DeployerError, Result, UnitFailure};
use crate::host::HostRuntime;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use std::collections::{BTreeMap, BTreeSet};
use strata_types::{InstalledUnit, ServiceRef, UnitId};
use tracing::{debug, warn};

fn start_level(units: &BTreeMap<UnitId, InstalledUnit>, id: UnitId) -> u32 {
    units.get(&id).map(|unit| unit.start_level).unwrap_or_default()
}

fn label(units: &BTreeMap<UnitId, InstalledUnit>, id: UnitId) -> String {
    units
        .get(&id)
        .map(|unit| format!("{}/{}", unit.name, unit.version))
        .unwrap_or_else(|| id.to_string())
}

/// In-use services of `unit`, restricted to consumers inside `group`
fn services_in_use<'a>(
    unit: &'a InstalledUnit,
    group: &'a BTreeSet<UnitId>,
) -> impl Iterator<Item = &'a ServiceRef> + 'a {
    unit.services.iter().filter(move |service| {
        service
            .using_units
            .iter()
            .any(|user| *user != unit.id && group.contains(user))
    })
}

/// Next batch of units to stop out of `remaining`
///
/// Only the highest start-level group is considered. Units without live
/// consumers in the group are returned together, newest first; when every
/// unit has consumers, the single least preferred service provider is
/// returned.
pub fn units_to_stop(
    remaining: &BTreeSet<UnitId>,
    units: &BTreeMap<UnitId, InstalledUnit>,
) -> Vec<UnitId> {
    let Some(level) = remaining.iter().map(|id| start_level(units, *id)).max() else {
        return Vec::new();
    };
    let group: BTreeSet<UnitId> = remaining
        .iter()
        .copied()
        .filter(|id| start_level(units, *id) == level)
        .collect();

    let mut idle: Vec<&InstalledUnit> = Vec::new();
    let mut busy: Vec<(&InstalledUnit, &ServiceRef)> = Vec::new();
    for id in &group {
        let Some(unit) = units.get(id) else {
            // Unknown units have no consumers
            return vec![*id];
        };
        match services_in_use(unit, &group).min_by(|a, b| a.cmp_preference(b)) {
            None => idle.push(unit),
            Some(service) => busy.push((unit, service)),
        }
    }

    if !idle.is_empty() {
        idle.sort_by(|a, b| b.last_modified.cmp(&a.last_modified).then(a.id.cmp(&b.id)));
        return idle.into_iter().map(|unit| unit.id).collect();
    }

    // Every unit is in use: break the cycle at the least preferred provider
    busy.into_iter()
        .min_by(|(_, a), (_, b)| a.cmp_preference(b))
        .map(|(unit, _)| vec![unit.id])
        .unwrap_or_default()
}

/// Full start order for `to_start`
///
/// Groups ascend by start level; inside a group providers come before the
/// units wired to them. `host_unit`, when part of the set, is last.
pub fn units_to_start(
    to_start: &BTreeSet<UnitId>,
    units: &BTreeMap<UnitId, InstalledUnit>,
    host_unit: Option<UnitId>,
) -> Vec<UnitId> {
    let mut groups: BTreeMap<u32, BTreeSet<UnitId>> = BTreeMap::new();
    for id in to_start {
        if Some(*id) == host_unit {
            continue;
        }
        groups.entry(start_level(units, *id)).or_default().insert(*id);
    }

    let mut order = Vec::with_capacity(to_start.len());
    for group in groups.values() {
        order.extend(requirement_sort(group, units));
    }
    if let Some(host) = host_unit.filter(|id| to_start.contains(id)) {
        order.push(host);
    }
    order
}

/// Providers first, restricted to wires inside `group`
///
/// Units wired in a cycle come out together, lowest id first.
fn requirement_sort(
    group: &BTreeSet<UnitId>,
    units: &BTreeMap<UnitId, InstalledUnit>,
) -> Vec<UnitId> {
    // Edges run from provider to consumer
    let mut graph: DiGraphMap<UnitId, ()> = DiGraphMap::with_capacity(group.len(), 0);
    for id in group {
        graph.add_node(*id);
    }
    for id in group {
        let Some(unit) = units.get(id) else {
            continue;
        };
        for provider in unit.wired_providers() {
            if provider != *id && group.contains(&provider) {
                graph.add_edge(provider, *id, ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => order,
        Err(cycle) => {
            debug!(unit = %cycle.node_id(), "Wiring cycle in start group");
            // Components come out consumers first
            tarjan_scc(&graph)
                .into_iter()
                .rev()
                .flat_map(|mut component| {
                    component.sort();
                    component
                })
                .collect()
        }
    }
}

/// Applies stop and start phases through the host
pub struct ExecutionScheduler<'a> {
    host: &'a dyn HostRuntime,
}

impl<'a> ExecutionScheduler<'a> {
    pub fn new(host: &'a dyn HostRuntime) -> Self {
        Self { host }
    }

    /// Stop every unit of `to_stop`
    ///
    /// Units in `persistent` get a persistent stop, the others a transient
    /// one. Failures are collected and raised once the phase is done.
    pub async fn stop_units(
        &self,
        to_stop: &BTreeSet<UnitId>,
        units: &BTreeMap<UnitId, InstalledUnit>,
        persistent: &BTreeSet<UnitId>,
    ) -> Result<()> {
        let mut remaining = to_stop.clone();
        let mut failures = Vec::new();

        while !remaining.is_empty() {
            let batch = units_to_stop(&remaining, units);
            if batch.is_empty() {
                break;
            }
            for id in batch {
                remaining.remove(&id);
                let persist = persistent.contains(&id);
                debug!(unit = %id, persistent = persist, "Stopping unit");
                if let Err(error) = self.host.stop(id, persist).await {
                    warn!(unit = %id, error = %error, "Unable to stop unit");
                    failures.push(UnitFailure {
                        unit: label(units, id),
                        error,
                    });
                }
            }
        }

        DeployerError::aggregate("Error stopping units", failures)
    }

    /// Start every unit of `to_start`, in start order
    pub async fn start_units(
        &self,
        to_start: &BTreeSet<UnitId>,
        units: &BTreeMap<UnitId, InstalledUnit>,
        host_unit: Option<UnitId>,
    ) -> Result<()> {
        let mut failures = Vec::new();
        for id in units_to_start(to_start, units, host_unit) {
            debug!(unit = %id, "Starting unit");
            if let Err(error) = self.host.start(id).await {
                warn!(unit = %id, error = %error, "Unable to start unit");
                failures.push(UnitFailure {
                    unit: label(units, id),
                    error,
                });
            }
        }
        DeployerError::aggregate("Error starting units", failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use strata_types::{Namespace, UnitState, UnitWire};

    fn unit(id: u64, level: u32) -> InstalledUnit {
        InstalledUnit {
            id: UnitId(id),
            name: format!("u{id}"),
            version: Version::new(1, 0, 0),
            location: format!("mvn:org.test/u{id}/1.0.0"),
            state: UnitState::Active,
            start_level: level,
            fragment_host: None,
            wires: Vec::new(),
            services: Vec::new(),
            last_modified: id as i64,
        }
    }

    fn service(id: u64, ranking: i32, users: &[u64]) -> ServiceRef {
        ServiceRef {
            service_id: id,
            ranking,
            using_units: users.iter().map(|u| UnitId(*u)).collect(),
        }
    }

    fn wired(mut unit: InstalledUnit, providers: &[u64]) -> InstalledUnit {
        unit.wires = providers
            .iter()
            .map(|p| UnitWire {
                provider: UnitId(*p),
                namespace: Namespace::Package,
            })
            .collect();
        unit
    }

    fn table(list: Vec<InstalledUnit>) -> BTreeMap<UnitId, InstalledUnit> {
        list.into_iter().map(|u| (u.id, u)).collect()
    }

    fn ids(list: &[u64]) -> BTreeSet<UnitId> {
        list.iter().map(|id| UnitId(*id)).collect()
    }

    #[test]
    fn test_highest_level_stops_first() {
        let units = table(vec![unit(1, 80), unit(2, 90), unit(3, 90)]);
        let batch = units_to_stop(&ids(&[1, 2, 3]), &units);
        // Newest first inside the group
        assert_eq!(batch, vec![UnitId(3), UnitId(2)]);
        assert_eq!(units_to_stop(&ids(&[1]), &units), vec![UnitId(1)]);
    }

    #[test]
    fn test_unit_without_consumers_stops_before_provider() {
        let mut provider = unit(1, 80);
        provider.services.push(service(10, 0, &[2]));
        let units = table(vec![provider, unit(2, 80)]);

        assert_eq!(units_to_stop(&ids(&[1, 2]), &units), vec![UnitId(2)]);
        // Once the consumer is gone the provider is free
        assert_eq!(units_to_stop(&ids(&[1]), &units), vec![UnitId(1)]);
    }

    #[test]
    fn test_consumers_outside_the_group_do_not_count() {
        let mut provider = unit(1, 80);
        provider.services.push(service(10, 0, &[5]));
        let units = table(vec![provider, unit(5, 80)]);
        assert_eq!(units_to_stop(&ids(&[1]), &units), vec![UnitId(1)]);
    }

    #[test]
    fn test_usage_cycle_stops_least_preferred_provider() {
        let mut a = unit(1, 80);
        a.services.push(service(10, 5, &[2]));
        let mut b = unit(2, 80);
        b.services.push(service(11, 0, &[1]));
        let units = table(vec![a, b]);

        assert_eq!(units_to_stop(&ids(&[1, 2]), &units), vec![UnitId(2)]);
    }

    #[test]
    fn test_start_order_providers_first_and_host_last() {
        let units = table(vec![
            wired(unit(1, 80), &[2]),
            unit(2, 80),
            unit(3, 70),
            wired(unit(4, 80), &[1]),
            unit(9, 60),
        ]);
        let order = units_to_start(&ids(&[1, 2, 3, 4, 9]), &units, Some(UnitId(9)));
        assert_eq!(
            order,
            vec![UnitId(3), UnitId(2), UnitId(1), UnitId(4), UnitId(9)]
        );
    }

    #[test]
    fn test_start_order_with_wiring_cycle() {
        let units = table(vec![
            wired(unit(1, 80), &[2, 4]),
            wired(unit(2, 80), &[1]),
            wired(unit(3, 80), &[1]),
            unit(4, 80),
        ]);
        let order = units_to_start(&ids(&[1, 2, 3, 4]), &units, None);
        assert_eq!(order, vec![UnitId(4), UnitId(1), UnitId(2), UnitId(3)]);
    }

    #[test]
    fn test_start_order_is_deterministic() {
        let units = table(vec![unit(3, 80), unit(1, 80), unit(2, 80)]);
        let set = ids(&[1, 2, 3]);
        assert_eq!(units_to_start(&set, &units, None), units_to_start(&set, &units, None));
        assert_eq!(units_to_start(&set, &units, None), vec![UnitId(1), UnitId(2), UnitId(3)]);
    }
}
