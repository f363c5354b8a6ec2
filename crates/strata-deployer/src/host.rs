//! Host runtime primitives
//!
//! Everything the engine does to the live system goes through
//! [`HostRuntime`]. Implementations are expected to be blocking from the
//! engine's point of view: a call returns once the primitive completed,
//! except for [`HostRuntime::refresh_units`], which reports completion
//! through a [`RefreshGate`].

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use strata_types::{
    Feature, InstalledUnit, RegionDigraph, RegionPolicies, ResourceKey, TopologyError, UnitId,
    Wiring,
};
use thiserror::Error;
use tokio::sync::oneshot;

/// Host primitive errors
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Unit not found: {0}")]
    UnitNotFound(UnitId),

    #[error("{operation} failed for {unit}: {reason}")]
    Operation {
        operation: &'static str,
        unit: String,
        reason: String,
    },

    #[error("Topology rejected: {0}")]
    Topology(#[from] TopologyError),

    #[error("Refresh did not complete: {0}")]
    RefreshAborted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Host error: {0}")]
    Other(String),
}

impl HostError {
    pub fn operation(operation: &'static str, unit: impl ToString, reason: impl ToString) -> Self {
        Self::Operation {
            operation,
            unit: unit.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Framework-level facts captured with each snapshot
#[derive(Debug, Clone, Default)]
pub struct FrameworkInfo {
    /// Unit hosting this engine
    pub host_unit: Option<UnitId>,
    /// The always-present system unit
    pub system_unit: Option<UnitId>,
    pub initial_start_level: u32,
    pub current_start_level: u32,
    pub units: BTreeMap<UnitId, InstalledUnit>,
}

/// Single-shot completion signal for an asynchronous refresh
#[derive(Debug)]
pub struct RefreshGate {
    done: oneshot::Sender<()>,
}

impl RefreshGate {
    /// A gate and the receiver the engine waits on
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (done, waiter) = oneshot::channel();
        (Self { done }, waiter)
    }

    /// Signal that the refresh finished
    pub fn complete(self) {
        let _ = self.done.send(());
    }
}

/// Primitive operations of the host runtime
#[async_trait]
pub trait HostRuntime: Send + Sync {
    /// Install a unit into `region`
    async fn install_unit(
        &self,
        region: &str,
        uri: &str,
        content: Bytes,
    ) -> Result<InstalledUnit, HostError>;

    /// Replace a unit's content in place
    async fn update_unit(&self, unit: UnitId, uri: &str, content: Bytes) -> Result<(), HostError>;

    async fn uninstall(&self, unit: UnitId) -> Result<(), HostError>;

    async fn start(&self, unit: UnitId) -> Result<(), HostError>;

    /// Stop a unit; a transient stop keeps its autostart setting
    async fn stop(&self, unit: UnitId, persistent: bool) -> Result<(), HostError>;

    async fn set_start_level(&self, unit: UnitId, level: u32) -> Result<(), HostError>;

    /// Resolve units, expecting the given wiring
    async fn resolve_units(
        &self,
        units: &BTreeSet<UnitId>,
        wiring: &Wiring,
        resource_units: &BTreeMap<ResourceKey, UnitId>,
    ) -> Result<(), HostError>;

    /// Start refreshing units; `gate` is completed once the refresh is done
    async fn refresh_units(
        &self,
        units: &BTreeSet<UnitId>,
        gate: RefreshGate,
    ) -> Result<(), HostError>;

    /// Atomically replace the live region digraph
    async fn replace_topology(
        &self,
        policies: &RegionPolicies,
        placement: &BTreeMap<String, BTreeSet<UnitId>>,
    ) -> Result<(), HostError>;

    async fn save_topology(&self) -> Result<(), HostError>;

    /// An independent copy of the live region digraph
    async fn topology_snapshot(&self) -> Result<RegionDigraph, HostError>;

    async fn install_configs(&self, feature: &Feature) -> Result<(), HostError>;

    async fn delete_configs(&self, feature: &Feature) -> Result<(), HostError>;

    async fn install_libraries(&self, feature: &Feature) -> Result<(), HostError>;

    /// Location of an engine-owned data file, if the host provides storage
    fn data_file(&self, name: &str) -> Option<PathBuf>;

    async fn framework_info(&self) -> Result<FrameworkInfo, HostError>;

    /// Checksum of the unit's current content
    ///
    /// Best effort: `None` when the content cannot be read back.
    async fn content_checksum(&self, unit: UnitId) -> Option<u64>;

    /// Schedule a restart of the whole host
    async fn restart(&self) -> Result<(), HostError>;
}
