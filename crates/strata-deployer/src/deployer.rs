//! Reconciliation orchestrator
//!
//! [`Deployer::deploy`] takes a snapshot of the host and a desired state and
//! applies one transaction:
//!
//! resolve, plan, compute the refresh set, adopt unmanaged units, then
//! stop, delete, replace the topology, update, set start levels, install,
//! persist the state, install configurations, refresh, resolve and start.
//!
//! Two situations leave the pipeline early: missing prerequisites are
//! deployed by a nested transaction first, and an update of the unit
//! hosting the engine is applied on its own and completed on the next boot.

use crate::error::{DeployerError, Result, UnitFailure};
use crate::host::{HostError, HostRuntime, RefreshGate};
use crate::planner::{compute_deployment, Deployment};
use crate::refresh::{compute_units_to_refresh, RefreshSet};
use crate::resolver::{FeatureResolver, ResolveRequest, Resolution};
use crate::scheduler::ExecutionScheduler;
use crate::snapshot::DeploymentState;
use crate::topology::{commit_topology, plan_topology, topology_drift, TopologyPlan};
use async_trait::async_trait;
use futures::future::BoxFuture;
use semver::Version;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strata_state::{add_to_set, content_checksum, remove_from_set, State};
use strata_types::{
    feature_id, parse_version, DeployOptions, DeploymentEvent, DeploymentRequest, FeatureEventKind,
    FeatureState, InstalledUnit, Namespace, RangePolicy, ResourceKey, SnapshotUpdatePolicy,
    StrataEvent, UnitId, UnitState, VersionRange, ROOT_REGION,
};
use tracing::{debug, info, instrument, warn};

/// Region to feature ids
type FeatureSets = BTreeMap<String, BTreeSet<String>>;
/// Region to feature id to state
type FeatureStates = BTreeMap<String, BTreeMap<String, FeatureState>>;

/// What the engine reports back to the provisioning service
#[async_trait]
pub trait DeployCallback: Send + Sync {
    /// Persist a complete new provisioning state
    async fn save_state(&self, state: State) -> Result<()>;

    /// Remember a request to resume after the engine restarts
    async fn persist_resolve_request(&self, request: &DeploymentRequest) -> Result<()>;

    fn emit(&self, event: StrataEvent);

    /// User facing progress output
    fn print(&self, message: &str, verbose: bool);
}

/// The plan of a simulated transaction
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeploymentReport {
    pub plan: Deployment,
    pub to_refresh: RefreshSet,
    pub to_manage: BTreeMap<String, BTreeSet<UnitId>>,
    pub features_to_install: FeatureSets,
    pub features_to_uninstall: FeatureSets,
    pub lines: Vec<String>,
}

/// How a transaction ended
#[derive(Debug, Clone)]
pub enum DeployOutcome {
    Completed,
    /// Nothing was applied
    Simulated(DeploymentReport),
    /// Prerequisites were deployed first; the request must be submitted again
    Partial { missing: BTreeSet<String> },
    /// The host changed under the snapshot; nothing was applied
    NeedsRetry { reason: String },
    /// The engine's own unit was updated; the request resumes on next boot
    SelfUpdated,
    /// The system unit needs a refresh; the host restarts
    RestartScheduled,
}

impl DeployOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Everything computed before the host is touched
struct Computed {
    deployment: Deployment,
    installed_features: FeatureSets,
    new_features: FeatureSets,
    del_features: FeatureSets,
    state_features: FeatureStates,
    to_refresh: RefreshSet,
    to_manage: BTreeMap<String, BTreeSet<UnitId>>,
    bundle_states: BTreeMap<ResourceKey, FeatureState>,
    to_set_level: BTreeMap<UnitId, u32>,
}

/// The reconciliation engine
pub struct Deployer {
    resolver: Arc<dyn FeatureResolver>,
    host: Arc<dyn HostRuntime>,
    callback: Arc<dyn DeployCallback>,
}

impl Deployer {
    pub fn new(
        resolver: Arc<dyn FeatureResolver>,
        host: Arc<dyn HostRuntime>,
        callback: Arc<dyn DeployCallback>,
    ) -> Self {
        Self {
            resolver,
            host,
            callback,
        }
    }

    /// Run one transaction against the snapshot
    pub fn deploy(
        &self,
        dstate: DeploymentState,
        request: DeploymentRequest,
    ) -> BoxFuture<'_, Result<DeployOutcome>> {
        Box::pin(self.run(dstate, request))
    }

    #[instrument(skip_all, fields(regions = request.requirements.len()))]
    async fn run(
        &self,
        dstate: DeploymentState,
        request: DeploymentRequest,
    ) -> Result<DeployOutcome> {
        let options = request.effective_options();
        let unmanaged = dstate.unmanaged_records();
        let resolve_request = ResolveRequest {
            features: &dstate.features,
            requirements: &request.requirements,
            bundles: &dstate.bundles,
            unmanaged: &unmanaged,
            overrides: &request.overrides,
            blacklist: &request.blacklist,
            feature_resolution_range: request.feature_resolution_range,
        };

        // 1. Deploy missing prerequisites first
        let prerequisites = self.resolver.prerequisites(&resolve_request).await?;
        let missing: BTreeSet<String> = prerequisites
            .into_iter()
            .filter(|prereq| {
                !is_feature_installed(
                    &dstate.state.installed_features,
                    prereq,
                    request.feature_resolution_range,
                )
            })
            .collect();
        if !missing.is_empty() {
            return self.deploy_prerequisites(dstate, &request, missing).await;
        }

        // 2. Resolve
        let resolution = self.resolver.resolve(&resolve_request).await?;

        // 3. Plan
        let computed = self.compute(&dstate, &request, &options, &resolution).await?;

        // 4. Topology
        let placement = next_placement(&dstate, &computed);
        let topology = plan_topology(&dstate, placement, &resolution.flat_topology)?;
        let drift = topology_drift(self.host.as_ref(), &dstate).await?;
        if !drift.is_empty() {
            warn!(units = ?drift, "Units installed outside of the engine");
            return Ok(DeployOutcome::NeedsRetry {
                reason: "framework state has changed, must resolve again".to_string(),
            });
        }

        // 5. Report
        let report = self.report(&dstate, &computed);
        let nothing_to_do = self.is_noop(&dstate, &computed, &options);
        if options.simulate {
            for line in &report.lines {
                self.callback.print(line, false);
            }
            return Ok(DeployOutcome::Simulated(report));
        }
        if nothing_to_do {
            self.callback.print("No deployment change.", options.verbose);
            let state = next_state(
                &dstate,
                &request,
                &computed,
                dstate.state.managed_bundles.clone(),
            );
            self.callback.save_state(state).await?;
            return Ok(DeployOutcome::Completed);
        }
        for line in &report.lines {
            self.callback.print(line, options.verbose);
        }
        info!(
            regions = computed.deployment.regions.len(),
            refresh = computed.to_refresh.len(),
            "Applying deployment"
        );

        // 6. The engine's own unit
        if let Some(host_unit) = dstate.host_unit {
            if computed.deployment.deleted_units().contains(&host_unit) {
                return Err(DeployerError::Unsupported(
                    "uninstalling the unit hosting the engine".to_string(),
                ));
            }
            if computed.deployment.updated_units().contains(&host_unit) {
                return self
                    .self_update(&dstate, &request, &computed, &resolution, host_unit)
                    .await;
            }
        }

        self.execute(dstate, request, options, resolution, computed, topology)
            .await
    }

    /// Deploy the missing prerequisites with a nested transaction
    async fn deploy_prerequisites(
        &self,
        dstate: DeploymentState,
        request: &DeploymentRequest,
        missing: BTreeSet<String>,
    ) -> Result<DeployOutcome> {
        let root_covers = request
            .requirements
            .get(ROOT_REGION)
            .is_some_and(|root| missing.is_subset(root));
        if root_covers {
            return Err(DeployerError::CircularPrerequisite(missing));
        }

        info!(prerequisites = ?missing, "Deploying prerequisites");
        let mut requirements = dstate.state.requirements.clone();
        for prereq in &missing {
            add_to_set(&mut requirements, ROOT_REGION.to_string(), prereq.clone());
        }
        let nested = DeploymentRequest {
            requirements,
            state_changes: BTreeMap::new(),
            ..request.clone()
        };

        match self.deploy(dstate, nested).await? {
            DeployOutcome::Completed => Ok(DeployOutcome::Partial { missing }),
            other => Ok(other),
        }
    }

    /// Everything between resolution and the first host mutation
    async fn compute(
        &self,
        dstate: &DeploymentState,
        request: &DeploymentRequest,
        options: &DeployOptions,
        resolution: &Resolution,
    ) -> Result<Computed> {
        // Feature changes
        let installed_features: FeatureSets = resolution
            .features_per_region
            .iter()
            .map(|(region, keys)| {
                let ids = keys.iter().map(|k| feature_id(&k.name, &k.version)).collect();
                (region.clone(), ids)
            })
            .collect();
        let new_features = difference(&installed_features, &dstate.state.installed_features);
        let del_features = difference(&dstate.state.installed_features, &installed_features);

        // Units to install, update and delete
        let mut deployment =
            compute_deployment(dstate, request, resolution, self.host.as_ref()).await?;

        // Units to refresh
        let mut to_refresh = RefreshSet::new();
        for plan in deployment.regions.values() {
            for id in &plan.to_delete {
                to_refresh.insert(*id, "Unit will be uninstalled".to_string());
            }
            for id in plan.to_update.keys() {
                to_refresh.insert(*id, "Unit will be updated".to_string());
            }
        }
        if !options.no_refresh_managed {
            compute_units_to_refresh(
                &mut to_refresh,
                &dstate.units,
                &deployment.resource_units,
                Some(&resolution.wiring),
            );
        }
        if options.no_refresh_unmanaged {
            to_refresh.retain(|id, _| dstate.state.is_managed(*id));
        }

        // Unmanaged units the new features rely on
        let to_manage = if options.no_manage {
            BTreeMap::new()
        } else {
            units_to_manage(dstate, resolution)
        };
        for units in to_manage.values() {
            for id in units {
                if let Some(unit) = dstate.unit(*id) {
                    deployment.resource_units.insert(unit.key(), *id);
                }
            }
        }

        // Feature and bundle states
        let state_features =
            feature_states(dstate, request, options, &del_features, &new_features);
        let bundle_states = bundle_states(
            resolution,
            &state_features,
            &deployment.resource_units,
            options,
        );

        // Start levels of units that stay
        let mut to_set_level = BTreeMap::new();
        for (key, id) in &deployment.resource_units {
            let (Some(unit), Some(resource)) = (dstate.unit(*id), resolution.resource(key)) else {
                continue;
            };
            let level = desired_start_level(resource.start_level, dstate.initial_start_level);
            if unit.start_level != level {
                to_set_level.insert(*id, level);
            }
        }

        Ok(Computed {
            deployment,
            installed_features,
            new_features,
            del_features,
            state_features,
            to_refresh,
            to_manage,
            bundle_states,
            to_set_level,
        })
    }

    fn report(&self, dstate: &DeploymentState, computed: &Computed) -> DeploymentReport {
        let label = |id: &UnitId| match dstate.unit(*id) {
            Some(unit) => format!("{}/{}", unit.name, unit.version),
            None => id.to_string(),
        };
        let mut lines = vec!["Changes to perform:".to_string()];
        lines.extend(computed.deployment.describe(dstate));
        if !computed.to_refresh.is_empty() {
            lines.push("  Bundles to refresh:".to_string());
            for (id, reason) in &computed.to_refresh {
                lines.push(format!("    {} ({})", label(id), reason));
            }
        }
        if !computed.to_manage.is_empty() {
            lines.push("  Managing bundles:".to_string());
            for id in computed.to_manage.values().flatten() {
                lines.push(format!("    {}", label(id)));
            }
        }
        for (title, features) in [
            ("  Features to uninstall:", &computed.del_features),
            ("  Features to install:", &computed.new_features),
        ] {
            if features.values().all(|ids| ids.is_empty()) {
                continue;
            }
            lines.push(title.to_string());
            for (region, ids) in features {
                for id in ids {
                    lines.push(format!("    {} ({})", id, region));
                }
            }
        }

        DeploymentReport {
            plan: computed.deployment.clone(),
            to_refresh: computed.to_refresh.clone(),
            to_manage: computed.to_manage.clone(),
            features_to_install: computed.new_features.clone(),
            features_to_uninstall: computed.del_features.clone(),
            lines,
        }
    }

    /// Whether the transaction would leave the host unchanged
    fn is_noop(
        &self,
        dstate: &DeploymentState,
        computed: &Computed,
        options: &DeployOptions,
    ) -> bool {
        let (to_start, to_stop) =
            unit_targets(&computed.bundle_states, &computed.deployment.resource_units);
        let pending_start = to_start.iter().any(|id| {
            dstate
                .unit(*id)
                .is_some_and(|unit| unit.state != UnitState::Active && !unit.is_fragment())
        });
        let pending_stop = to_stop
            .iter()
            .any(|id| dstate.unit(*id).is_some_and(|unit| unit.state == UnitState::Active));

        computed.deployment.is_empty()
            && (computed.to_refresh.is_empty() || options.no_refresh)
            && computed.to_manage.is_empty()
            && computed.new_features.is_empty()
            && computed.del_features.is_empty()
            && computed.to_set_level.is_empty()
            && !pending_start
            && !pending_stop
    }

    /// Update the engine's own unit and stop there
    async fn self_update(
        &self,
        dstate: &DeploymentState,
        request: &DeploymentRequest,
        computed: &Computed,
        resolution: &Resolution,
        host_unit: UnitId,
    ) -> Result<DeployOutcome> {
        let Some(resource) = computed
            .deployment
            .regions
            .values()
            .find_map(|plan| plan.to_update.get(&host_unit))
        else {
            return Ok(DeployOutcome::Completed);
        };
        let uri = resource.uri.clone().unwrap_or_default();
        let content = resolution
            .content(&uri)
            .ok_or_else(|| DeployerError::MissingContent(uri.clone()))?;

        self.callback.print("Updating the engine unit", false);
        self.callback.persist_resolve_request(request).await?;

        // Record the new checksum so the next boot sees an up to date unit
        let mut state = dstate.state.copy();
        if let Some(checksum) = computed.deployment.checksums.get(&host_unit) {
            state.bundle_checksums.insert(host_unit, *checksum);
        }
        self.callback.save_state(state).await?;

        let mut to_refresh = RefreshSet::from([(host_unit, "Engine update".to_string())]);
        compute_units_to_refresh(&mut to_refresh, &dstate.units, &BTreeMap::new(), None);

        self.host.stop(host_unit, false).await?;
        self.host.update_unit(host_unit, &uri, content).await?;
        self.refresh(&to_refresh.keys().copied().collect()).await?;
        self.host.start(host_unit).await?;

        info!(unit = %host_unit, "Engine unit updated");
        Ok(DeployOutcome::SelfUpdated)
    }

    /// Apply the computed transaction
    async fn execute(
        &self,
        dstate: DeploymentState,
        request: DeploymentRequest,
        options: DeployOptions,
        resolution: Resolution,
        mut computed: Computed,
        topology: TopologyPlan,
    ) -> Result<DeployOutcome> {
        let host = self.host.as_ref();
        let scheduler = ExecutionScheduler::new(host);
        self.callback
            .emit(StrataEvent::Deployment(DeploymentEvent::DeploymentStarted));

        let deleted = computed.deployment.deleted_units();
        let updated = computed.deployment.updated_units();
        let (state_start, state_stop) =
            unit_targets(&computed.bundle_states, &computed.deployment.resource_units);

        // 1. Stop units about to be deleted, updated, stopped or moved to another level
        let persistent: BTreeSet<UnitId> = computed.to_set_level.keys().copied().collect();
        let mut to_stop: BTreeSet<UnitId> = deleted.iter().chain(&updated).copied().collect();
        to_stop.extend(state_stop.iter().copied());
        to_stop.extend(
            computed
                .to_set_level
                .iter()
                .filter(|(_, level)| **level > dstate.current_start_level)
                .map(|(id, _)| *id),
        );
        let live = host.framework_info().await?.units;
        let was_active: BTreeSet<UnitId> = live
            .values()
            .filter(|unit| unit.state == UnitState::Active)
            .map(|unit| unit.id)
            .collect();
        retain_running(&mut to_stop, &live);
        if !to_stop.is_empty() {
            let message = format!("Stopping units: {}", labels(&live, &to_stop));
            self.callback.print(&message, options.verbose);
            scheduler.stop_units(&to_stop, &live, &persistent).await?;
        }

        // 2. Delete
        let mut managed = dstate.state.managed_bundles.clone();
        let mut failures = Vec::new();
        for (region, plan) in &computed.deployment.regions {
            for id in &plan.to_delete {
                debug!(unit = %id, region = %region, "Uninstalling unit");
                match host.uninstall(*id).await {
                    Ok(()) => {
                        remove_from_set(&mut managed, region, id);
                        computed.deployment.checksums.remove(id);
                    }
                    Err(error) => failures.push(failure(&live, *id, error)),
                }
            }
        }
        DeployerError::aggregate("Error uninstalling units", failures)?;

        // 3. Replace the region topology
        commit_topology(host, &topology).await?;
        for (region, units) in &computed.to_manage {
            for id in units {
                add_to_set(&mut managed, region.clone(), *id);
            }
        }

        // 4. Update
        let mut to_start: BTreeSet<UnitId> = state_start;
        let mut failures = Vec::new();
        for plan in computed.deployment.regions.values() {
            for (id, resource) in &plan.to_update {
                let uri = resource.uri.clone().unwrap_or_default();
                let content = resolution
                    .content(&uri)
                    .ok_or_else(|| DeployerError::MissingContent(uri.clone()))?;
                let crc = request.update_snapshots == SnapshotUpdatePolicy::Crc;
                if crc && resource.is_updateable() {
                    computed.deployment.checksums.insert(*id, content_checksum(&content));
                }
                debug!(unit = %id, uri = %uri, "Updating unit");
                match host.update_unit(*id, &uri, content).await {
                    Ok(()) => {
                        let targeted = computed.bundle_states.contains_key(&resource.key);
                        if was_active.contains(id) && !targeted {
                            to_start.insert(*id);
                        }
                    }
                    Err(error) => failures.push(failure(&live, *id, error)),
                }
            }
        }
        DeployerError::aggregate("Error updating units", failures)?;

        // 5. Start levels of existing units
        let mut failures = Vec::new();
        for (id, level) in &computed.to_set_level {
            if let Err(error) = host.set_start_level(*id, *level).await {
                failures.push(failure(&live, *id, error));
            }
        }
        DeployerError::aggregate("Error setting start levels", failures)?;

        // 6. Install
        let mut failures = Vec::new();
        let mut new_levels = BTreeMap::new();
        for (region, plan) in &computed.deployment.regions {
            for resource in &plan.to_install {
                let uri = resource.uri.clone().unwrap_or_default();
                let content = resolution
                    .content(&uri)
                    .ok_or_else(|| DeployerError::MissingContent(uri.clone()))?;
                let checksum = content_checksum(&content);
                debug!(region = %region, uri = %uri, "Installing unit");
                match host.install_unit(region, &uri, content).await {
                    Ok(unit) => {
                        add_to_set(&mut managed, region.clone(), unit.id);
                        computed
                            .deployment
                            .resource_units
                            .insert(resource.key.clone(), unit.id);
                        if request.update_snapshots == SnapshotUpdatePolicy::Crc
                            && resource.is_updateable()
                        {
                            computed.deployment.checksums.insert(unit.id, checksum);
                        }
                        let level =
                            desired_start_level(resource.start_level, dstate.initial_start_level);
                        if level != unit.start_level {
                            new_levels.insert(unit.id, level);
                        }
                        let target = computed.bundle_states.get(&resource.key);
                        if target == Some(&FeatureState::Started) {
                            to_start.insert(unit.id);
                        }
                    }
                    Err(error) => failures.push(UnitFailure {
                        unit: uri.clone(),
                        error,
                    }),
                }
            }
        }
        if !failures.is_empty() {
            // Keep track of what did get installed
            let state = next_state(&dstate, &request, &computed, managed.clone());
            self.callback.save_state(state).await?;
            DeployerError::aggregate("Error installing units", failures)?;
        }
        let mut failures = Vec::new();
        for (id, level) in &new_levels {
            if let Err(error) = host.set_start_level(*id, *level).await {
                failures.push(UnitFailure {
                    unit: id.to_string(),
                    error,
                });
            }
        }
        if !failures.is_empty() {
            let state = next_state(&dstate, &request, &computed, managed.clone());
            self.callback.save_state(state).await?;
            DeployerError::aggregate("Error setting start levels", failures)?;
        }

        // 7. Persist the state
        let state = next_state(&dstate, &request, &computed, managed);
        self.callback.save_state(state).await?;

        // 8. Configurations and libraries
        let mut failures = Vec::new();
        for id in computed.new_features.values().flatten() {
            let Some(feature) = dstate.features.get(id) else {
                continue;
            };
            if let Err(error) = host.install_configs(feature).await {
                failures.push(UnitFailure {
                    unit: id.clone(),
                    error,
                });
            }
            if let Err(error) = host.install_libraries(feature).await {
                failures.push(UnitFailure {
                    unit: id.clone(),
                    error,
                });
            }
        }
        if options.delete_configurations {
            for id in computed.del_features.values().flatten() {
                let Some(feature) = dstate.features.get(id) else {
                    continue;
                };
                if let Err(error) = host.delete_configs(feature).await {
                    failures.push(UnitFailure {
                        unit: id.clone(),
                        error,
                    });
                }
            }
        }
        DeployerError::aggregate("Error installing configurations", failures)?;

        // 9. Refresh
        let mut to_resolve: BTreeSet<UnitId> = to_start.clone();
        if !options.no_refresh && !computed.to_refresh.is_empty() {
            if dstate
                .system_unit
                .is_some_and(|system| computed.to_refresh.contains_key(&system))
            {
                self.callback
                    .print("The system unit needs to be refreshed, restarting", false);
                host.restart().await?;
                return Ok(DeployOutcome::RestartScheduled);
            }

            let live = host.framework_info().await?.units;
            let refresh: BTreeSet<UnitId> = computed
                .to_refresh
                .keys()
                .copied()
                .filter(|id| live.contains_key(id))
                .collect();
            let mut running = refresh.clone();
            retain_running(&mut running, &live);
            if !running.is_empty() {
                scheduler.stop_units(&running, &live, &BTreeSet::new()).await?;
                to_start.extend(running.iter().copied());
            }
            if !refresh.is_empty() {
                let message = format!("Refreshing units: {}", labels(&live, &refresh));
                self.callback.print(&message, options.verbose);
                self.refresh(&refresh).await?;
            }
            to_resolve.extend(refresh);
        }

        // 10. Resolve
        self.callback
            .emit(StrataEvent::Deployment(DeploymentEvent::BundlesInstalled));
        let live = host.framework_info().await?.units;
        to_resolve.extend(state_stop.iter().copied());
        to_resolve.extend(to_start.iter().copied());
        to_resolve.retain(|id| {
            live.get(id)
                .is_some_and(|unit| unit.state != UnitState::Uninstalled)
        });
        if !to_resolve.is_empty() {
            let wiring = &resolution.wiring;
            host.resolve_units(&to_resolve, wiring, &computed.deployment.resource_units)
                .await?;
        }
        self.callback
            .emit(StrataEvent::Deployment(DeploymentEvent::BundlesResolved));

        // 11. Start
        let live = host.framework_info().await?;
        to_start.retain(|id| {
            live.units.get(id).is_some_and(|unit| {
                unit.state != UnitState::Active
                    && !unit.is_fragment()
                    && unit.start_level <= live.current_start_level
            })
        });
        if !to_start.is_empty() {
            let message = format!("Starting units: {}", labels(&live.units, &to_start));
            self.callback.print(&message, options.verbose);
            scheduler
                .start_units(&to_start, &live.units, dstate.host_unit)
                .await?;
        }

        // 12. Feature events
        for (region, ids) in &computed.del_features {
            for id in ids {
                self.callback.emit(StrataEvent::Feature {
                    kind: FeatureEventKind::Uninstalled,
                    feature_id: id.clone(),
                    region: region.clone(),
                    replay: false,
                });
            }
        }
        for (region, ids) in &computed.new_features {
            for id in ids {
                self.callback.emit(StrataEvent::Feature {
                    kind: FeatureEventKind::Installed,
                    feature_id: id.clone(),
                    region: region.clone(),
                    replay: false,
                });
            }
        }
        self.callback
            .emit(StrataEvent::Deployment(DeploymentEvent::DeploymentFinished));
        info!("Deployment finished");
        Ok(DeployOutcome::Completed)
    }

    /// Refresh units and wait for the host to signal completion
    async fn refresh(&self, units: &BTreeSet<UnitId>) -> Result<()> {
        let (gate, done) = RefreshGate::channel();
        self.host.refresh_units(units, gate).await?;
        done.await
            .map_err(|_| HostError::RefreshAborted(format!("{} units", units.len())))?;
        Ok(())
    }
}

/// Region-wise `left - right`, empty regions dropped
fn difference(left: &FeatureSets, right: &FeatureSets) -> FeatureSets {
    left.iter()
        .filter_map(|(region, ids)| {
            let other = right.get(region);
            let diff: BTreeSet<String> = ids
                .iter()
                .filter(|id| !other.is_some_and(|o| o.contains(*id)))
                .cloned()
                .collect();
            (!diff.is_empty()).then(|| (region.clone(), diff))
        })
        .collect()
}

/// Whether an installed feature satisfies the prerequisite id `name/version`
fn is_feature_installed(installed: &FeatureSets, prereq: &str, policy: RangePolicy) -> bool {
    let Some((name, version)) = prereq.split_once('/') else {
        return false;
    };
    let range = match parse_version(version) {
        Ok(version) if version == Version::new(0, 0, 0) => VersionRange::any(),
        Ok(version) => policy.range_for(&version),
        Err(_) => return false,
    };
    installed.values().flatten().any(|id| {
        id.split_once('/').is_some_and(|(n, v)| {
            n == name && parse_version(v).is_ok_and(|v| range.contains(&v))
        })
    })
}

/// Unmanaged units wired from a desired feature and required by no unit
/// that stays unmanaged
fn units_to_manage(
    dstate: &DeploymentState,
    resolution: &Resolution,
) -> BTreeMap<String, BTreeSet<UnitId>> {
    let mut unmanaged: BTreeMap<ResourceKey, UnitId> = dstate
        .unmanaged_units()
        .into_values()
        .flatten()
        .filter_map(|id| dstate.unit(id).map(|unit| (unit.key(), id)))
        .collect();
    let wires = || resolution.wiring.values().flatten();

    // 1. Units a feature of the resolution is wired to
    let mut requested: BTreeMap<ResourceKey, UnitId> = BTreeMap::new();
    for wire in wires() {
        if !wire.requirer.is_feature() || !wire.provider.is_bundle() {
            continue;
        }
        if let Some(id) = unmanaged.get(&wire.provider) {
            requested.insert(wire.provider.clone(), *id);
        }
    }

    // 2. What is left stays unmanaged; its providers are shared
    unmanaged.retain(|key, _| !requested.contains_key(key));
    for wire in wires() {
        if unmanaged.contains_key(&wire.requirer) && requested.remove(&wire.provider).is_some() {
            debug!(unit = %wire.provider.name, "Unmanaged unit is shared, leaving it alone");
        }
    }

    let mut to_manage = BTreeMap::new();
    for id in requested.into_values() {
        if let Some(region) = dstate.region_of(id) {
            add_to_set(&mut to_manage, region.to_string(), id);
        }
    }
    to_manage
}

/// Next per-feature states
fn feature_states(
    dstate: &DeploymentState,
    request: &DeploymentRequest,
    options: &DeployOptions,
    del_features: &FeatureSets,
    new_features: &FeatureSets,
) -> FeatureStates {
    let mut states = dstate.state.state_features.clone();
    for (region, ids) in del_features {
        if let Some(region_states) = states.get_mut(region) {
            for id in ids {
                region_states.remove(id);
            }
        }
    }
    // Requested changes only apply to features already carrying a state
    for (region, changes) in &request.state_changes {
        let Some(region_states) = states.get_mut(region) else {
            continue;
        };
        for (id, state) in changes {
            if let Some(current) = region_states.get_mut(id) {
                *current = *state;
            }
        }
    }
    let initial = if options.no_start {
        FeatureState::Installed
    } else {
        FeatureState::Started
    };
    for (region, ids) in new_features {
        let region_states = states.entry(region.clone()).or_default();
        for id in ids {
            region_states.insert(id.clone(), initial);
        }
    }
    states.retain(|_, region_states| !region_states.is_empty());
    states
}

/// Target state of every bundle resource of the resolution
///
/// Feature states flow along identity wires; the highest state wins. A
/// bundle that must not start is capped at `Resolved`. Only resources with no
/// backing unit yet fall back to the default state; existing units keep theirs.
fn bundle_states(
    resolution: &Resolution,
    state_features: &FeatureStates,
    resource_units: &BTreeMap<ResourceKey, UnitId>,
    options: &DeployOptions,
) -> BTreeMap<ResourceKey, FeatureState> {
    let mut states: BTreeMap<ResourceKey, FeatureState> = BTreeMap::new();
    let mut pending: Vec<(ResourceKey, FeatureState)> = Vec::new();
    for (region, features) in &resolution.features_per_region {
        for key in features {
            let id = feature_id(&key.name, &key.version);
            if let Some(state) = state_features.get(region).and_then(|s| s.get(&id)) {
                pending.push((key.clone(), *state));
            }
        }
    }

    while let Some((key, state)) = pending.pop() {
        let current = states.get(&key).copied();
        if current.is_some_and(|current| current >= state) {
            continue;
        }
        states.insert(key.clone(), state);
        for wire in resolution.wiring.get(&key).into_iter().flatten() {
            if wire.namespace() == &Namespace::Identity && !wire.requirement.conditional {
                pending.push((wire.provider.clone(), state));
            }
        }
    }

    let mut bundles: BTreeMap<ResourceKey, FeatureState> = BTreeMap::new();
    for (region, keys) in &resolution.resources_per_region {
        for key in keys {
            let Some(resource) = resolution.resource(key) else {
                continue;
            };
            let startable = resource.start
                && resolution
                    .bundle_info(region, resource)
                    .map_or(true, |info| info.start);
            let state = match states.get(key) {
                Some(state) => *state,
                None if resource_units.contains_key(key) => continue,
                None if startable && !options.no_start => FeatureState::Started,
                None => FeatureState::Resolved,
            };
            let state = if startable {
                state
            } else {
                state.min(FeatureState::Resolved)
            };
            bundles.insert(key.clone(), state);
        }
    }
    // Bundles provided by adopted unmanaged units only carry propagated states
    for (key, state) in states {
        if key.is_bundle() {
            bundles.entry(key).or_insert(state);
        }
    }
    bundles
}

/// Units to start and units to stop, from bundle states
fn unit_targets(
    bundle_states: &BTreeMap<ResourceKey, FeatureState>,
    resource_units: &BTreeMap<ResourceKey, UnitId>,
) -> (BTreeSet<UnitId>, BTreeSet<UnitId>) {
    let mut to_start = BTreeSet::new();
    let mut to_stop = BTreeSet::new();
    for (key, id) in resource_units {
        match bundle_states.get(key) {
            Some(FeatureState::Started) => {
                to_start.insert(*id);
            }
            Some(FeatureState::Resolved) => {
                to_stop.insert(*id);
            }
            _ => {}
        }
    }
    (to_start, to_stop)
}

fn desired_start_level(declared: u32, initial: u32) -> u32 {
    if declared > 0 {
        declared
    } else {
        initial
    }
}

/// Units placed after the transaction: surviving managed units, adopted
/// units and the remaining unmanaged ones
fn next_placement(
    dstate: &DeploymentState,
    computed: &Computed,
) -> BTreeMap<String, BTreeSet<UnitId>> {
    let deleted = computed.deployment.deleted_units();
    let mut placement: BTreeMap<String, BTreeSet<UnitId>> = BTreeMap::new();
    for (region, units) in &dstate.state.managed_bundles {
        for id in units {
            if !deleted.contains(id) && dstate.units.contains_key(id) {
                add_to_set(&mut placement, region.clone(), *id);
            }
        }
    }
    for (region, units) in dstate.unmanaged_units() {
        for id in units {
            add_to_set(&mut placement, region.clone(), id);
        }
    }
    placement
}

/// The provisioning state after the transaction
fn next_state(
    dstate: &DeploymentState,
    request: &DeploymentRequest,
    computed: &Computed,
    mut managed: BTreeMap<String, BTreeSet<UnitId>>,
) -> State {
    managed.retain(|_, units| !units.is_empty());
    let managed_ids: BTreeSet<UnitId> = managed.values().flatten().copied().collect();
    let mut checksums = dstate.state.bundle_checksums.clone();
    checksums.extend(computed.deployment.checksums.iter().map(|(id, crc)| (*id, *crc)));
    checksums.retain(|id, _| managed_ids.contains(id));
    State {
        boot_done: dstate.state.boot_done,
        repositories: dstate.state.repositories.clone(),
        requirements: request.requirements.clone(),
        installed_features: computed.installed_features.clone(),
        state_features: computed.state_features.clone(),
        managed_bundles: managed,
        bundle_checksums: checksums,
    }
}

/// Keep only active, non-fragment units
fn retain_running(units: &mut BTreeSet<UnitId>, live: &BTreeMap<UnitId, InstalledUnit>) {
    units.retain(|id| {
        live.get(id)
            .is_some_and(|unit| unit.state == UnitState::Active && !unit.is_fragment())
    });
}

fn failure(live: &BTreeMap<UnitId, InstalledUnit>, id: UnitId, error: HostError) -> UnitFailure {
    let unit = live
        .get(&id)
        .map(|unit| format!("{}/{}", unit.name, unit.version))
        .unwrap_or_else(|| id.to_string());
    warn!(unit = %unit, error = %error, "Primitive operation failed");
    UnitFailure { unit, error }
}

fn labels(live: &BTreeMap<UnitId, InstalledUnit>, ids: &BTreeSet<UnitId>) -> String {
    ids.iter()
        .map(|id| {
            live.get(id)
                .map(|unit| format!("{}/{}", unit.name, unit.version))
                .unwrap_or_else(|| id.to_string())
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::{Requirement, Resource, Wire};

    fn sets(entries: &[(&str, &[&str])]) -> FeatureSets {
        entries
            .iter()
            .map(|(region, ids)| {
                (region.to_string(), ids.iter().map(|id| id.to_string()).collect())
            })
            .collect()
    }

    #[test]
    fn test_difference_drops_empty_regions() {
        let left = sets(&[("root", &["a/1.0.0", "b/1.0.0"]), ("app", &["c/1.0.0"])]);
        let right = sets(&[("root", &["a/1.0.0"]), ("app", &["c/1.0.0"])]);
        assert_eq!(difference(&left, &right), sets(&[("root", &["b/1.0.0"])]));
    }

    #[test]
    fn test_installed_prerequisite_matching() {
        let installed = sets(&[("root", &["baz/1.2.0"])]);
        assert!(is_feature_installed(&installed, "baz/1.2.0", RangePolicy::Exact));
        assert!(!is_feature_installed(&installed, "baz/1.0.0", RangePolicy::Exact));
        assert!(is_feature_installed(&installed, "baz/1.0.0", RangePolicy::SameMajor));
        assert!(is_feature_installed(&installed, "baz/0.0.0", RangePolicy::Exact));
        assert!(!is_feature_installed(&installed, "other/1.2.0", RangePolicy::Any));
    }

    #[test]
    fn test_feature_states_for_new_and_changed_features() {
        let mut dstate = DeploymentState::default();
        dstate.state.state_features = BTreeMap::from([(
            "root".to_string(),
            BTreeMap::from([
                ("old/1.0.0".to_string(), FeatureState::Started),
                ("kept/1.0.0".to_string(), FeatureState::Started),
            ]),
        )]);
        let mut request = DeploymentRequest::new();
        request.state_changes = BTreeMap::from([(
            "root".to_string(),
            BTreeMap::from([("kept/1.0.0".to_string(), FeatureState::Resolved)]),
        )]);
        let options = DeployOptions {
            no_start: true,
            ..Default::default()
        };

        let states = feature_states(
            &dstate,
            &request,
            &options,
            &sets(&[("root", &["old/1.0.0"])]),
            &sets(&[("root", &["new/1.0.0"])]),
        );
        let root = &states["root"];
        assert!(!root.contains_key("old/1.0.0"));
        assert_eq!(root["kept/1.0.0"], FeatureState::Resolved);
        assert_eq!(root["new/1.0.0"], FeatureState::Installed);
    }

    #[test]
    fn test_state_changes_only_touch_known_features() {
        let mut dstate = DeploymentState::default();
        dstate.state.state_features = BTreeMap::from([(
            "root".to_string(),
            BTreeMap::from([("kept/1.0.0".to_string(), FeatureState::Started)]),
        )]);
        let mut request = DeploymentRequest::new();
        request.state_changes = BTreeMap::from([
            (
                "root".to_string(),
                BTreeMap::from([
                    ("ghost/1.0.0".to_string(), FeatureState::Resolved),
                    ("new/1.0.0".to_string(), FeatureState::Resolved),
                ]),
            ),
            (
                "app".to_string(),
                BTreeMap::from([("kept/1.0.0".to_string(), FeatureState::Resolved)]),
            ),
        ]);

        let states = feature_states(
            &dstate,
            &request,
            &DeployOptions::default(),
            &FeatureSets::new(),
            &sets(&[("root", &["new/1.0.0"])]),
        );
        let root = &states["root"];
        assert!(!root.contains_key("ghost/1.0.0"));
        assert_eq!(root["kept/1.0.0"], FeatureState::Started);
        // Features installed by this request start from the default state
        assert_eq!(root["new/1.0.0"], FeatureState::Started);
        assert!(!states.contains_key("app"));
    }

    fn live(id: u64, name: &str) -> InstalledUnit {
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

    fn unmanaged(units: Vec<InstalledUnit>) -> DeploymentState {
        let mut dstate = DeploymentState::default();
        for unit in units {
            add_to_set(&mut dstate.units_per_region, "root".to_string(), unit.id);
            dstate.units.insert(unit.id, unit);
        }
        dstate
    }

    fn wire(requirer: ResourceKey, provider: ResourceKey, namespace: Namespace) -> Wire {
        let target = provider.name.clone();
        Wire::new(requirer, provider, Requirement::new(namespace, target))
    }

    fn bundle_key(name: &str) -> ResourceKey {
        ResourceKey::bundle(name, Version::new(1, 0, 0))
    }

    #[test]
    fn test_units_to_manage_adopts_units_wired_from_features() {
        let dstate = unmanaged(vec![live(1, "a"), live(2, "b"), live(3, "c"), live(4, "d")]);
        let feature = ResourceKey::feature("app", Version::new(1, 0, 0));
        let mut resolution = Resolution::default();
        resolution.features_per_region.insert(
            "root".to_string(),
            BTreeSet::from([feature.clone()]),
        );
        resolution.wiring.insert(
            feature.clone(),
            vec![
                wire(feature.clone(), bundle_key("a"), Namespace::Identity),
                wire(feature.clone(), bundle_key("b"), Namespace::Identity),
                wire(feature.clone(), bundle_key("c"), Namespace::Identity),
            ],
        );
        // b relies on a, both are requested so a stays adoptable
        resolution.wiring.insert(
            bundle_key("b"),
            vec![wire(bundle_key("b"), bundle_key("a"), Namespace::Package)],
        );
        // d stays unmanaged and relies on c, so c is shared
        resolution.wiring.insert(
            bundle_key("d"),
            vec![wire(bundle_key("d"), bundle_key("c"), Namespace::Package)],
        );

        let to_manage = units_to_manage(&dstate, &resolution);
        assert_eq!(
            to_manage,
            BTreeMap::from([("root".to_string(), BTreeSet::from([UnitId(1), UnitId(2)]))])
        );
    }

    #[test]
    fn test_bundle_states_default_only_for_new_resources() {
        let mut resolution = Resolution::default();
        for name in ["kept", "fresh"] {
            let key = bundle_key(name);
            resolution.resources.insert(
                key.clone(),
                Resource::bundle(name, Version::new(1, 0, 0), format!("mvn:org.test/{name}/1.0.0")),
            );
            add_to_set(&mut resolution.resources_per_region, "root".to_string(), key);
        }
        let resource_units = BTreeMap::from([(bundle_key("kept"), UnitId(7))]);

        let states = bundle_states(
            &resolution,
            &FeatureStates::new(),
            &resource_units,
            &DeployOptions::default(),
        );
        assert!(!states.contains_key(&bundle_key("kept")));
        assert_eq!(states[&bundle_key("fresh")], FeatureState::Started);

        let states = bundle_states(
            &resolution,
            &FeatureStates::new(),
            &resource_units,
            &DeployOptions {
                no_start: true,
                ..Default::default()
            },
        );
        assert_eq!(states[&bundle_key("fresh")], FeatureState::Resolved);
    }

    #[test]
    fn test_desired_start_level() {
        assert_eq!(desired_start_level(0, 80), 80);
        assert_eq!(desired_start_level(30, 80), 30);
    }
}
