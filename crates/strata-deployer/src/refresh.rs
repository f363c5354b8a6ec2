//! Refresh-set calculation
//!
//! Starting from units known to be deleted or updated, walk the live and
//! the newly computed wiring until no further unit needs to be refreshed.
//! The set only grows and the universe of units is finite, so the walk
//! terminates.

use std::collections::{BTreeMap, BTreeSet};
use strata_types::{
    Effective, InstalledUnit, Namespace, Requirement, ResourceKey, UnitId, Wiring,
};

/// Unit to the reason it is refreshed
pub type RefreshSet = BTreeMap<UnitId, String>;

/// Grow `to_refresh` to its fixed point
///
/// With `wiring` set, resolved units are also compared against their new
/// wiring. Without it only units wired to an already refreshed unit are
/// added.
pub fn compute_units_to_refresh(
    to_refresh: &mut RefreshSet,
    units: &BTreeMap<UnitId, InstalledUnit>,
    resource_units: &BTreeMap<ResourceKey, UnitId>,
    wiring: Option<&Wiring>,
) {
    let mut unit_by_key: BTreeMap<ResourceKey, UnitId> = BTreeMap::new();
    for unit in units.values() {
        unit_by_key.entry(unit.key()).or_insert(unit.id);
    }
    let resource_by_unit: BTreeMap<UnitId, &ResourceKey> =
        resource_units.iter().map(|(key, id)| (*id, key)).collect();

    let new_fragments = wiring
        .map(|wiring| new_fragments(wiring, units, resource_units, &unit_by_key))
        .unwrap_or_default();

    loop {
        let size = to_refresh.len();

        for unit in units.values() {
            if to_refresh.contains_key(&unit.id) || !unit.state.is_resolved() {
                continue;
            }
            let resource = resource_by_unit
                .get(&unit.id)
                .map(|key| (*key).clone())
                .unwrap_or_else(|| unit.key());

            // Units absent from the new wiring keep their current one
            let new_wires = match wiring {
                Some(wiring) => match wiring.get(&resource) {
                    Some(wires) => Some(wires),
                    None => continue,
                },
                None => None,
            };

            if new_wires.is_some() {
                let old: BTreeSet<ResourceKey> = units
                    .values()
                    .filter(|u| u.fragment_host == Some(unit.id))
                    .map(|u| u.key())
                    .collect();
                let new = new_fragments.get(&unit.id).cloned().unwrap_or_default();
                // Only newly attached fragments need a refresh
                if !new.is_subset(&old) {
                    let list: Vec<String> = new.iter().map(|k| k.to_string()).collect();
                    to_refresh.insert(
                        unit.id,
                        format!("Attached fragments changed: [{}]", list.join(", ")),
                    );
                    continue;
                }
            }

            let providers = unit.wired_providers();
            if let Some(provider) = providers.iter().find(|p| to_refresh.contains_key(*p)) {
                let name = units
                    .get(provider)
                    .map(|p| format!("{}/{}", p.name, p.version))
                    .unwrap_or_else(|| provider.to_string());
                to_refresh.insert(
                    unit.id,
                    format!("Wired to {} which is being refreshed", name),
                );
                continue;
            }

            let Some(new_wires) = new_wires else {
                continue;
            };

            let mut wired: BTreeSet<ResourceKey> = providers
                .iter()
                .filter_map(|id| units.get(id))
                .map(|u| u.key())
                .collect();
            wired.insert(unit.key());

            let mut missing: BTreeMap<&ResourceKey, &Requirement> = BTreeMap::new();
            for wire in new_wires {
                if !wire.namespace().is_wiring()
                    || wire.requirement.effective != Effective::Resolve
                    || !wire.provider.is_bundle()
                {
                    continue;
                }
                if !wired.contains(&wire.provider) {
                    missing.entry(&wire.provider).or_insert(&wire.requirement);
                }
            }
            if !missing.is_empty() {
                let targets: Vec<String> = missing
                    .iter()
                    .map(|(key, req)| format!("{} (through {})", key, req))
                    .collect();
                to_refresh.insert(
                    unit.id,
                    format!("Should be wired to: {}", targets.join(", ")),
                );
            }
        }

        if to_refresh.len() == size {
            break;
        }
    }
}

/// Host unit to the fragments the new wiring attaches to it
fn new_fragments(
    wiring: &Wiring,
    units: &BTreeMap<UnitId, InstalledUnit>,
    resource_units: &BTreeMap<ResourceKey, UnitId>,
    unit_by_key: &BTreeMap<ResourceKey, UnitId>,
) -> BTreeMap<UnitId, BTreeSet<ResourceKey>> {
    let mut fragments: BTreeMap<UnitId, BTreeSet<ResourceKey>> = BTreeMap::new();
    for wire in wiring.values().flatten() {
        if wire.namespace() != &Namespace::Host {
            continue;
        }
        let host = resource_units
            .get(&wire.provider)
            .or_else(|| unit_by_key.get(&wire.provider));
        let Some(host) = host else {
            continue;
        };
        let fragment = resource_units
            .get(&wire.requirer)
            .and_then(|id| units.get(id))
            .map(|u| u.key())
            .unwrap_or_else(|| wire.requirer.clone());
        fragments.entry(*host).or_default().insert(fragment);
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use strata_types::{UnitState, UnitWire, Wire};

    fn unit(id: u64, name: &str, wires: &[u64]) -> InstalledUnit {
        InstalledUnit {
            id: UnitId(id),
            name: name.to_string(),
            version: Version::new(1, 0, 0),
            location: format!("mvn:org.test/{name}/1.0.0"),
            state: UnitState::Active,
            start_level: 80,
            fragment_host: None,
            wires: wires
                .iter()
                .map(|p| UnitWire {
                    provider: UnitId(*p),
                    namespace: Namespace::Package,
                })
                .collect(),
            services: Vec::new(),
            last_modified: 0,
        }
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::bundle(name, Version::new(1, 0, 0))
    }

    fn package_wire(from: &str, to: &str) -> Wire {
        Wire::new(key(from), key(to), Requirement::new(Namespace::Package, format!("org.{to}")))
    }

    fn units(list: Vec<InstalledUnit>) -> BTreeMap<UnitId, InstalledUnit> {
        list.into_iter().map(|u| (u.id, u)).collect()
    }

    /// Wiring identical to the live wiring of `units`
    fn current_wiring(units: &BTreeMap<UnitId, InstalledUnit>) -> Wiring {
        units
            .values()
            .map(|u| {
                let wires = u
                    .wires
                    .iter()
                    .map(|w| package_wire(&u.name, &units[&w.provider].name))
                    .collect();
                (u.key(), wires)
            })
            .collect()
    }

    #[test]
    fn test_refresh_is_transitive() {
        // z -> y -> x, x is updated
        let live = units(vec![unit(1, "x", &[]), unit(2, "y", &[1]), unit(3, "z", &[2]), unit(4, "w", &[])]);
        let wiring = current_wiring(&live);
        let mut to_refresh = RefreshSet::from([(UnitId(1), "Unit will be updated".to_string())]);

        compute_units_to_refresh(&mut to_refresh, &live, &BTreeMap::new(), Some(&wiring));

        assert!(to_refresh.contains_key(&UnitId(2)));
        assert!(to_refresh.contains_key(&UnitId(3)));
        assert!(!to_refresh.contains_key(&UnitId(4)));
        assert_eq!(to_refresh[&UnitId(2)], "Wired to x/1.0.0 which is being refreshed");
    }

    #[test]
    fn test_unchanged_wiring_adds_nothing() {
        let live = units(vec![unit(1, "x", &[]), unit(2, "y", &[1])]);
        let wiring = current_wiring(&live);
        let mut to_refresh = RefreshSet::new();

        compute_units_to_refresh(&mut to_refresh, &live, &BTreeMap::new(), Some(&wiring));
        assert!(to_refresh.is_empty());
    }

    #[test]
    fn test_new_wire_target_triggers_refresh() {
        let live = units(vec![unit(1, "x", &[]), unit(2, "y", &[]), unit(3, "new", &[])]);
        let mut wiring = current_wiring(&live);
        wiring.get_mut(&key("y")).unwrap().push(package_wire("y", "new"));

        let mut optional = package_wire("x", "new");
        optional.requirement.effective = Effective::Active;
        wiring.get_mut(&key("x")).unwrap().push(optional);

        let mut to_refresh = RefreshSet::new();
        compute_units_to_refresh(&mut to_refresh, &live, &BTreeMap::new(), Some(&wiring));

        assert_eq!(to_refresh.len(), 1);
        assert_eq!(
            to_refresh[&UnitId(2)],
            "Should be wired to: new/1.0.0 (through osgi.wiring.package; org.new)"
        );
    }

    #[test]
    fn test_attached_fragment_change() {
        let live = units(vec![unit(1, "host", &[])]);
        let mut wiring = current_wiring(&live);
        wiring.insert(
            key("frag"),
            vec![Wire::new(key("frag"), key("host"), Requirement::new(Namespace::Host, "host"))],
        );

        let mut to_refresh = RefreshSet::new();
        compute_units_to_refresh(&mut to_refresh, &live, &BTreeMap::new(), Some(&wiring));
        assert_eq!(to_refresh[&UnitId(1)], "Attached fragments changed: [frag/1.0.0]");
    }

    #[test]
    fn test_detached_fragment_keeps_host() {
        let mut fragment = unit(2, "frag", &[]);
        fragment.fragment_host = Some(UnitId(1));
        let live = units(vec![unit(1, "host", &[]), fragment, unit(3, "extra", &[])]);
        let wiring = current_wiring(&live);

        let mut to_refresh = RefreshSet::new();
        compute_units_to_refresh(&mut to_refresh, &live, &BTreeMap::new(), Some(&wiring));
        assert!(to_refresh.is_empty());

        // One more fragment on top of the attached one
        let mut wiring = current_wiring(&live);
        for name in ["frag", "extra"] {
            wiring.insert(
                key(name),
                vec![Wire::new(key(name), key("host"), Requirement::new(Namespace::Host, "host"))],
            );
        }
        compute_units_to_refresh(&mut to_refresh, &live, &BTreeMap::new(), Some(&wiring));
        assert_eq!(
            to_refresh[&UnitId(1)],
            "Attached fragments changed: [extra/1.0.0, frag/1.0.0]"
        );
    }

    #[test]
    fn test_unresolved_and_unwired_units_are_skipped() {
        let mut installed = unit(2, "y", &[1]);
        installed.state = UnitState::Installed;
        let live = units(vec![unit(1, "x", &[]), installed, unit(3, "z", &[1])]);
        // z is not part of the new wiring
        let mut wiring = current_wiring(&live);
        wiring.remove(&key("z"));

        let mut to_refresh = RefreshSet::from([(UnitId(1), "Unit will be updated".to_string())]);
        compute_units_to_refresh(&mut to_refresh, &live, &BTreeMap::new(), Some(&wiring));
        assert_eq!(to_refresh.len(), 1);
    }

    #[test]
    fn test_without_wiring_only_dependents_are_added() {
        let live = units(vec![unit(1, "engine", &[]), unit(2, "client", &[1]), unit(3, "other", &[])]);
        let mut to_refresh = RefreshSet::from([(UnitId(1), "Engine update".to_string())]);

        compute_units_to_refresh(&mut to_refresh, &live, &BTreeMap::new(), None);
        assert_eq!(
            to_refresh.keys().copied().collect::<Vec<_>>(),
            vec![UnitId(1), UnitId(2)]
        );
    }
}
