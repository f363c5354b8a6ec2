//! The persisted provisioning state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strata_types::{FeatureState, UnitId};

/// What the engine believes is installed.
///
/// Field names of the serialized document are kept short and stable:
/// `bootDone`, `repositories`, `requested`, `installed`, `state`, `managed`
/// and `checksums`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// The first provisioning after boot has completed.
    #[serde(rename = "bootDone", default)]
    pub boot_done: bool,

    /// Registered repository URIs.
    #[serde(default)]
    pub repositories: BTreeSet<String>,

    /// Region to requested feature requirements.
    #[serde(rename = "requested", default)]
    pub requirements: BTreeMap<String, BTreeSet<String>>,

    /// Region to installed feature ids.
    #[serde(rename = "installed", default)]
    pub installed_features: BTreeMap<String, BTreeSet<String>>,

    /// Region to feature id to lifecycle state.
    #[serde(rename = "state", default)]
    pub state_features: BTreeMap<String, BTreeMap<String, FeatureState>>,

    /// Region to units owned by the engine.
    #[serde(rename = "managed", default)]
    pub managed_bundles: BTreeMap<String, BTreeSet<UnitId>>,

    /// Unit to last known content checksum.
    #[serde(rename = "checksums", default)]
    pub bundle_checksums: BTreeMap<UnitId, u64>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// An independent snapshot to compute on.
    pub fn copy(&self) -> State {
        self.clone()
    }

    /// Swap in a complete new state.
    pub fn replace(&mut self, other: State) {
        *self = other;
    }

    /// Every managed unit regardless of region.
    pub fn managed_units(&self) -> BTreeSet<UnitId> {
        self.managed_bundles.values().flatten().copied().collect()
    }

    pub fn is_managed(&self, unit: UnitId) -> bool {
        self.managed_bundles.values().any(|units| units.contains(&unit))
    }

    /// Whether the feature id is installed in any region.
    pub fn is_installed(&self, feature_id: &str) -> bool {
        self.installed_features
            .values()
            .any(|ids| ids.contains(feature_id))
    }

    pub fn feature_state(&self, region: &str, feature_id: &str) -> Option<FeatureState> {
        self.state_features
            .get(region)
            .and_then(|states| states.get(feature_id))
            .copied()
    }
}

/// Insert `value` into the set stored under `key`.
pub fn add_to_set<K: Ord, V: Ord>(map: &mut BTreeMap<K, BTreeSet<V>>, key: K, value: V) -> bool {
    map.entry(key).or_default().insert(value)
}

/// Remove `value` from the set stored under `key`, dropping the set once empty.
pub fn remove_from_set<K: Ord, V: Ord>(map: &mut BTreeMap<K, BTreeSet<V>>, key: &K, value: &V) -> bool {
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(value);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> State {
        let mut state = State::new();
        state.repositories.insert("file:/repo/features.json".to_string());
        add_to_set(&mut state.requirements, "root".to_string(), "foo/[1,2)".to_string());
        add_to_set(&mut state.installed_features, "root".to_string(), "foo/1.3.0".to_string());
        state
            .state_features
            .entry("root".to_string())
            .or_default()
            .insert("foo/1.3.0".to_string(), FeatureState::Started);
        add_to_set(&mut state.managed_bundles, "root".to_string(), UnitId(12));
        state.bundle_checksums.insert(UnitId(12), 0xfeed);
        state
    }

    #[test]
    fn test_serialized_field_names() {
        let value = serde_json::to_value(sample()).unwrap();
        let object = value.as_object().unwrap();
        for field in ["bootDone", "repositories", "requested", "installed", "state", "managed", "checksums"] {
            assert!(object.contains_key(field), "missing {field}");
        }
        assert_eq!(value["checksums"]["12"], 0xfeed);
    }

    #[test]
    fn test_round_trip_preserves_state() {
        let state = sample();
        let json = serde_json::to_string(&state).unwrap();
        let decoded: State = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_copy_is_independent() {
        let live = sample();
        let mut scratch = live.copy();
        scratch.managed_bundles.clear();
        assert!(live.is_managed(UnitId(12)));
        assert!(!scratch.is_managed(UnitId(12)));
    }

    #[test]
    fn test_remove_from_set_drops_empty_entries() {
        let mut state = sample();
        assert!(remove_from_set(&mut state.managed_bundles, &"root".to_string(), &UnitId(12)));
        assert!(!state.managed_bundles.contains_key("root"));
        assert!(!remove_from_set(&mut state.managed_bundles, &"root".to_string(), &UnitId(12)));
    }

    #[test]
    fn test_queries() {
        let state = sample();
        assert!(state.is_installed("foo/1.3.0"));
        assert_eq!(state.feature_state("root", "foo/1.3.0"), Some(FeatureState::Started));
        assert_eq!(state.managed_units().len(), 1);
    }
}
