//! Installed units as seen in the live host

use crate::{Namespace, ResourceKey, UnitId};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Lifecycle state of an installed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

impl UnitState {
    /// Whether the unit has wiring
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            Self::Resolved | Self::Starting | Self::Active | Self::Stopping
        )
    }
}

/// An outbound wire of a live unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitWire {
    pub provider: UnitId,
    pub namespace: Namespace,
}

/// A service registered by a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub service_id: u64,
    #[serde(default)]
    pub ranking: i32,
    /// Units currently holding this service
    #[serde(default)]
    pub using_units: BTreeSet<UnitId>,
}

impl ServiceRef {
    /// Preference order between two services
    ///
    /// Higher ranking is preferred; on equal ranking the older service
    /// (lower id) is preferred. `Less` means `self` is less preferred.
    pub fn cmp_preference(&self, other: &ServiceRef) -> Ordering {
        self.ranking
            .cmp(&other.ranking)
            .then_with(|| other.service_id.cmp(&self.service_id))
    }
}

/// A live unit inside the host runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledUnit {
    pub id: UnitId,
    pub name: String,
    pub version: Version,
    pub location: String,
    pub state: UnitState,
    pub start_level: u32,
    /// Host this fragment is attached to
    #[serde(default)]
    pub fragment_host: Option<UnitId>,
    /// Required wires of the current revision
    #[serde(default)]
    pub wires: Vec<UnitWire>,
    #[serde(default)]
    pub services: Vec<ServiceRef>,
    /// Milliseconds since the epoch
    #[serde(default)]
    pub last_modified: i64,
}

impl InstalledUnit {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::bundle(self.name.clone(), self.version.clone())
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_host.is_some()
    }

    /// Providers of the unit's required wires, fragment host included
    pub fn wired_providers(&self) -> BTreeSet<UnitId> {
        self.wires
            .iter()
            .map(|wire| wire.provider)
            .chain(self.fragment_host)
            .collect()
    }
}
