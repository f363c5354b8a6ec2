//! Features Service - provisioning entry point
//!
//! The FeaturesService owns the live provisioning state, the repository
//! cache and the collaborators. Read operations take the shared state lock;
//! every provisioning operation runs as one transaction on its own task,
//! serialized by the transaction mutex.

use crate::config::DeployerConfig;
use crate::deployer::{DeployCallback, DeployOutcome, Deployer};
use crate::error::{DeployerError, Result};
use crate::host::{HostError, HostRuntime};
use crate::repository::{FeatureRepository, RepositoryLoader};
use crate::resolver::FeatureResolver;
use crate::snapshot::DeploymentState;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strata_state::{add_to_set, State, StateStorage};
use strata_types::{
    DeployOptions, DeploymentRequest, Feature, FeatureEventKind, FeatureReq, FeatureState,
    RepositoryEventKind, SnapshotUpdatePolicy, StrataEvent, StrataEventEnvelope, ROOT_REGION,
};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, instrument, warn};

/// Data file holding a request to resume after a self-update
pub const RESOLVE_FILE: &str = "resolve";

/// Region to feature requirements
pub type Requirements = BTreeMap<String, BTreeSet<String>>;

/// Region to feature id to requested state
pub type StateChanges = BTreeMap<String, BTreeMap<String, FeatureState>>;

struct Inner {
    config: DeployerConfig,
    /// Live provisioning state
    state: RwLock<State>,
    /// Held from reading the requirements until the transaction ends
    transaction: Arc<Mutex<()>>,
    /// Loaded repositories by URI
    repositories: DashMap<String, FeatureRepository>,
    storage: Arc<dyn StateStorage>,
    host: Arc<dyn HostRuntime>,
    resolver: Arc<dyn FeatureResolver>,
    loader: Arc<dyn RepositoryLoader>,
    event_tx: broadcast::Sender<StrataEventEnvelope>,
}

/// Provisioning service
#[derive(Clone)]
pub struct FeaturesService {
    inner: Arc<Inner>,
}

impl FeaturesService {
    /// Open the service: load the stored state and its repositories
    pub async fn open(
        config: DeployerConfig,
        storage: Arc<dyn StateStorage>,
        host: Arc<dyn HostRuntime>,
        resolver: Arc<dyn FeatureResolver>,
        loader: Arc<dyn RepositoryLoader>,
    ) -> Result<Self> {
        let state = storage.load_or_default().await?;
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let service = Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(state.clone()),
                transaction: Arc::new(Mutex::new(())),
                repositories: DashMap::new(),
                storage,
                host,
                resolver,
                loader,
                event_tx,
            }),
        };

        for uri in &state.repositories {
            if let Err(error) = service.inner.load_repository(uri).await {
                // A missing repository must not prevent the service from starting
                warn!(uri = %uri, error = %error, "Unable to load repository");
            }
        }
        info!(
            repositories = state.repositories.len(),
            features = service.inner.repositories.len(),
            "Features service opened"
        );
        Ok(service)
    }

    pub fn config(&self) -> &DeployerConfig {
        &self.inner.config
    }

    /// Copy of the live provisioning state
    pub async fn state(&self) -> State {
        self.inner.state.read().await.copy()
    }

    /// Subscribe to provisioning events
    pub fn subscribe(&self) -> broadcast::Receiver<StrataEventEnvelope> {
        self.inner.event_tx.subscribe()
    }

    /// Subscribe and receive the current repositories and installed features as replayed events
    pub async fn subscribe_with_replay(
        &self,
    ) -> (Vec<StrataEventEnvelope>, broadcast::Receiver<StrataEventEnvelope>) {
        let receiver = self.subscribe();
        let state = self.inner.state.read().await;
        let mut replay: Vec<StrataEventEnvelope> = state
            .repositories
            .iter()
            .map(|uri| {
                StrataEventEnvelope::new(StrataEvent::Repository {
                    kind: RepositoryEventKind::Added,
                    uri: uri.clone(),
                    replay: true,
                })
            })
            .collect();
        for (region, ids) in &state.installed_features {
            for id in ids {
                replay.push(StrataEventEnvelope::new(StrataEvent::Feature {
                    kind: FeatureEventKind::Installed,
                    feature_id: id.clone(),
                    region: region.clone(),
                    replay: true,
                }));
            }
        }
        (replay, receiver)
    }

    // Repositories

    /// Add a repository and the repositories it references
    ///
    /// With `install` set, every feature of the repository is installed.
    #[instrument(skip(self))]
    pub async fn add_repository(&self, uri: &str, install: bool) -> Result<DeployOutcome> {
        // 1. Load
        let repository = self.inner.load_repository(uri).await?;

        // 2. Record and persist
        {
            let mut state = self.inner.state.write().await;
            if state.repositories.insert(uri.to_string()) {
                self.inner.storage.save(&state).await?;
            }
        }
        self.inner.emit(StrataEvent::Repository {
            kind: RepositoryEventKind::Added,
            uri: uri.to_string(),
            replay: false,
        });
        info!(uri = %uri, features = repository.features.len(), "Repository added");

        // 3. Optionally install its features
        if install && !repository.features.is_empty() {
            let reqs: Vec<String> = repository.features.iter().map(Feature::id).collect();
            return self
                .install_features(&reqs, ROOT_REGION, DeployOptions::default())
                .await;
        }
        Ok(DeployOutcome::Completed)
    }

    /// Remove a repository
    ///
    /// Fails while one of its features is still required, unless
    /// `uninstall` is set, in which case those requirements are removed
    /// first.
    #[instrument(skip(self))]
    pub async fn remove_repository(&self, uri: &str, uninstall: bool) -> Result<DeployOutcome> {
        let features: Vec<Feature> = self
            .inner
            .repositories
            .get(uri)
            .map(|repository| repository.features.clone())
            .unwrap_or_default();

        // 1. Find requirements still satisfied by this repository
        let requirements = self.list_requirements().await;
        let mut in_use = Requirements::new();
        for (region, reqs) in &requirements {
            for req in reqs {
                let Ok(parsed) = FeatureReq::parse(req) else {
                    continue;
                };
                if features.iter().any(|feature| parsed.matches(feature)) {
                    add_to_set(&mut in_use, region.clone(), req.clone());
                }
            }
        }

        // 2. Drop or refuse
        let mut outcome = DeployOutcome::Completed;
        if !in_use.is_empty() {
            if !uninstall {
                let features = in_use
                    .values()
                    .flatten()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(DeployerError::RepositoryInUse {
                    uri: uri.to_string(),
                    features,
                });
            }
            outcome = self
                .remove_requirements(in_use, DeployOptions::default())
                .await?;
        }

        // 3. Forget it
        self.inner.repositories.remove(uri);
        {
            let mut state = self.inner.state.write().await;
            if state.repositories.remove(uri) {
                self.inner.storage.save(&state).await?;
            }
        }
        self.inner.emit(StrataEvent::Repository {
            kind: RepositoryEventKind::Removed,
            uri: uri.to_string(),
            replay: false,
        });
        info!(uri = %uri, "Repository removed");
        Ok(outcome)
    }

    /// Reload a repository from its source
    pub async fn refresh_repository(&self, uri: &str) -> Result<FeatureRepository> {
        self.inner.repositories.remove(uri);
        self.inner.load_repository(uri).await
    }

    /// Loaded repositories, ordered by URI
    pub fn list_repositories(&self) -> Vec<FeatureRepository> {
        let mut repositories: Vec<FeatureRepository> = self
            .inner
            .repositories
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        repositories.sort_by(|a, b| a.uri.cmp(&b.uri));
        repositories
    }

    // Feature queries

    /// Every available feature, ordered by name then version
    pub fn list_features(&self) -> Vec<Feature> {
        self.inner.features().into_values().collect()
    }

    pub async fn list_installed_features(&self) -> Vec<Feature> {
        let state = self.inner.state.read().await;
        let features = self.inner.features();
        state
            .installed_features
            .values()
            .flatten()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|id| features.get(id).cloned())
            .collect()
    }

    /// Available features matched by a requirement
    pub async fn list_required_features(&self) -> Vec<Feature> {
        let requirements = self.list_requirements().await;
        let reqs: Vec<FeatureReq> = requirements
            .values()
            .flatten()
            .filter_map(|req| FeatureReq::parse(req).ok())
            .collect();
        self.list_features()
            .into_iter()
            .filter(|feature| reqs.iter().any(|req| req.matches(feature)))
            .collect()
    }

    /// The feature `name` at `version`, or its highest version
    pub fn feature(&self, name: &str, version: Option<&str>) -> Result<Option<Feature>> {
        let req = match version {
            Some(version) => FeatureReq::parse(&format!("{}/{}", name, version))?,
            None => FeatureReq::parse(name)?,
        };
        Ok(self
            .list_features()
            .into_iter()
            .filter(|feature| req.matches(feature))
            .max_by(|a, b| a.version.cmp(&b.version)))
    }

    pub async fn is_installed(&self, feature: &Feature) -> bool {
        self.inner.state.read().await.is_installed(&feature.id())
    }

    pub async fn is_required(&self, feature: &Feature) -> bool {
        let state = self.inner.state.read().await;
        state
            .requirements
            .values()
            .flatten()
            .filter_map(|req| FeatureReq::parse(req).ok())
            .any(|req| req.matches(feature))
    }

    pub async fn feature_state(&self, region: &str, id: &str) -> Option<FeatureState> {
        self.inner.state.read().await.feature_state(region, id)
    }

    pub async fn list_requirements(&self) -> Requirements {
        self.inner.state.read().await.requirements.clone()
    }

    // Provisioning

    /// Install features into `region`
    ///
    /// Blacklisted requirements are skipped. With `upgrade`, requirements
    /// on other versions of the same features are replaced.
    #[instrument(skip(self, reqs, options), fields(count = reqs.len()))]
    pub async fn install_features(
        &self,
        reqs: &[String],
        region: &str,
        options: DeployOptions,
    ) -> Result<DeployOutcome> {
        // 1. Validate requirements against available features
        let features = self.list_features();
        let mut wanted = Vec::new();
        for req in reqs {
            let parsed = FeatureReq::parse(req)?;
            if self.inner.is_blacklisted(req, &parsed) {
                info!(requirement = %req, "Skipping blacklisted feature");
                continue;
            }
            if !features.iter().any(|feature| parsed.matches(feature)) {
                return Err(DeployerError::FeatureNotFound(req.clone()));
            }
            wanted.push(parsed);
        }

        // 2. Merge into the current requirements
        let transaction = self.begin().await;
        let mut requirements = self.list_requirements().await;
        let region_reqs = requirements.entry(region.to_string()).or_default();
        for req in &wanted {
            if options.upgrade {
                region_reqs.retain(|existing| {
                    FeatureReq::parse(existing).map_or(true, |existing| existing.name != req.name)
                });
            }
            region_reqs.insert(req.to_requirement());
        }

        self.provision(transaction, requirements, StateChanges::new(), options)
            .await
    }

    /// Uninstall features from `region`
    ///
    /// A requirement without a version matches every requirement on the
    /// feature; otherwise the stored requirement must match exactly or
    /// through an installed version both accept.
    #[instrument(skip(self, reqs, options), fields(count = reqs.len()))]
    pub async fn uninstall_features(
        &self,
        reqs: &[String],
        region: &str,
        options: DeployOptions,
    ) -> Result<DeployOutcome> {
        let transaction = self.begin().await;
        let state = self.state().await;
        let mut requirements = state.requirements.clone();
        let stored = requirements.get(region).cloned().unwrap_or_default();
        let installed: Vec<(String, semver::Version)> = state
            .installed_features
            .get(region)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                let (name, version) = id.split_once('/')?;
                Some((name.to_string(), strata_types::parse_version(version).ok()?))
            })
            .collect();

        for req in reqs {
            let parsed = FeatureReq::parse(req)?;
            let matching: Vec<&String> = stored
                .iter()
                .filter(|existing| {
                    let Ok(existing) = FeatureReq::parse(existing) else {
                        return false;
                    };
                    existing.name == parsed.name
                        && (parsed.range.is_any()
                            || existing.range == parsed.range
                            || installed.iter().any(|(name, version)| {
                                *name == parsed.name
                                    && parsed.range.contains(version)
                                    && existing.range.contains(version)
                            }))
                })
                .collect();
            if matching.is_empty() {
                return Err(DeployerError::NotInstalled(req.clone()));
            }
            if let Some(region_reqs) = requirements.get_mut(region) {
                for existing in matching {
                    region_reqs.remove(existing);
                }
            }
        }
        requirements.retain(|_, reqs| !reqs.is_empty());

        self.provision(transaction, requirements, StateChanges::new(), options)
            .await
    }

    /// Move installed features to other lifecycle states
    pub async fn update_features_state(
        &self,
        changes: StateChanges,
        options: DeployOptions,
    ) -> Result<DeployOutcome> {
        let transaction = self.begin().await;
        let requirements = self.list_requirements().await;
        self.provision(transaction, requirements, changes, options)
            .await
    }

    pub async fn add_requirements(
        &self,
        additions: Requirements,
        options: DeployOptions,
    ) -> Result<DeployOutcome> {
        let transaction = self.begin().await;
        let mut requirements = self.list_requirements().await;
        for (region, reqs) in additions {
            requirements.entry(region).or_default().extend(reqs);
        }
        self.provision(transaction, requirements, StateChanges::new(), options)
            .await
    }

    pub async fn remove_requirements(
        &self,
        removals: Requirements,
        options: DeployOptions,
    ) -> Result<DeployOutcome> {
        let transaction = self.begin().await;
        let mut requirements = self.list_requirements().await;
        for (region, reqs) in &removals {
            if let Some(existing) = requirements.get_mut(region) {
                existing.retain(|req| !reqs.contains(req));
            }
        }
        requirements.retain(|_, reqs| !reqs.is_empty());
        self.provision(transaction, requirements, StateChanges::new(), options)
            .await
    }

    /// Resume a request left behind by an engine self-update
    pub async fn resume_pending(&self) -> Result<Option<DeployOutcome>> {
        let Some(path) = self.inner.host.data_file(RESOLVE_FILE) else {
            return Ok(None);
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(HostError::Io(error).into()),
        };
        tokio::fs::remove_file(&path).await.map_err(HostError::Io)?;

        let request: DeploymentRequest = serde_json::from_slice(&bytes)
            .map_err(|e| DeployerError::Internal(format!("invalid pending request: {}", e)))?;
        info!(path = %path.display(), "Resuming pending provisioning request");
        let transaction = self.begin().await;
        self.run_transaction(transaction, request).await.map(Some)
    }

    /// Mark the boot provisioning as done
    pub async fn boot_done(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        if !state.boot_done {
            state.boot_done = true;
            self.inner.storage.save(&state).await?;
        }
        Ok(())
    }

    /// Serialize transactions; the guard travels with the deployment task
    async fn begin(&self) -> OwnedMutexGuard<()> {
        self.inner.transaction.clone().lock_owned().await
    }

    async fn provision(
        &self,
        transaction: OwnedMutexGuard<()>,
        requirements: Requirements,
        state_changes: StateChanges,
        options: DeployOptions,
    ) -> Result<DeployOutcome> {
        let mut request = self.inner.config.request_template().with_options(options);
        request.requirements = requirements;
        request.state_changes = state_changes;
        self.run_transaction(transaction, request).await
    }

    /// Run a transaction on its own task
    async fn run_transaction(
        &self,
        transaction: OwnedMutexGuard<()>,
        request: DeploymentRequest,
    ) -> Result<DeployOutcome> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = inner.deploy_fully(request).await;
            drop(transaction);
            outcome
        })
            .await
            .map_err(|e| DeployerError::Internal(e.to_string()))?
    }
}

impl Inner {
    fn emit(&self, event: StrataEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(StrataEventEnvelope::new(event));
    }

    /// Available features by id, merged across repositories
    fn features(&self) -> BTreeMap<String, Feature> {
        let mut features = BTreeMap::new();
        for repository in self.repositories.iter() {
            for feature in &repository.features {
                features.insert(feature.id(), feature.clone());
            }
        }
        features
    }

    fn is_blacklisted(&self, req: &str, parsed: &FeatureReq) -> bool {
        self.config.blacklist.contains(req) || self.config.blacklist.contains(&parsed.name)
    }

    /// Load `uri` and every repository it references
    async fn load_repository(&self, uri: &str) -> Result<FeatureRepository> {
        let mut pending = vec![uri.to_string()];
        let mut first = None;
        while let Some(next) = pending.pop() {
            if self.repositories.contains_key(&next) {
                if first.is_none() {
                    first = self.repositories.get(&next).map(|r| r.value().clone());
                }
                continue;
            }
            let repository = self.loader.load(&next).await?;
            debug!(uri = %next, "Repository loaded");
            pending.extend(repository.repositories.iter().cloned());
            if first.is_none() {
                first = Some(repository.clone());
            }
            self.repositories.insert(next, repository);
        }
        first.ok_or_else(|| DeployerError::Internal(format!("repository {} not loaded", uri)))
    }

    /// Deploy until the request is fully applied
    ///
    /// Deployments of missing prerequisites are retried as long as each
    /// round adds new prerequisites.
    #[instrument(skip_all)]
    async fn deploy_fully(self: Arc<Self>, request: DeploymentRequest) -> Result<DeployOutcome> {
        let callback = Arc::new(ServiceCallback {
            inner: self.clone(),
            policy: request.update_snapshots,
        });
        let deployer = Deployer::new(self.resolver.clone(), self.host.clone(), callback);
        let features = self.features();
        let bundles: Vec<_> = self
            .repositories
            .iter()
            .flat_map(|repository| repository.bundles.clone())
            .collect();

        let mut prerequisites = BTreeSet::new();
        loop {
            let state = self.state.read().await.copy();
            let available = features.values().cloned();
            let dstate = DeploymentState::capture(self.host.as_ref(), state, available)
                .await?
                .with_bundles(bundles.iter().cloned());

            match deployer.deploy(dstate, request.clone()).await {
                Ok(DeployOutcome::Partial { missing }) => {
                    if missing.is_subset(&prerequisites) {
                        return Err(DeployerError::PrerequisiteLoop(missing));
                    }
                    info!(prerequisites = ?missing, "Prerequisites deployed, deploying again");
                    prerequisites.extend(missing);
                }
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    warn!(error = %error, "Deployment failed");
                    self.emit(StrataEvent::DeploymentFailed {
                        reason: error.to_string(),
                    });
                    return Err(error);
                }
            }
        }
    }
}

/// Bridges engine callbacks to the service
struct ServiceCallback {
    inner: Arc<Inner>,
    policy: SnapshotUpdatePolicy,
}

#[async_trait]
impl DeployCallback for ServiceCallback {
    async fn save_state(&self, mut state: State) -> Result<()> {
        let mut live = self.inner.state.write().await;
        state.repositories = live.repositories.clone();
        state.boot_done = live.boot_done;
        if self.policy != SnapshotUpdatePolicy::Crc {
            state.bundle_checksums.clear();
        }
        self.inner.storage.save(&state).await?;
        live.replace(state);
        drop(live);

        self.inner.host.save_topology().await?;
        debug!("Provisioning state saved");
        Ok(())
    }

    async fn persist_resolve_request(&self, request: &DeploymentRequest) -> Result<()> {
        let Some(path) = self.inner.host.data_file(RESOLVE_FILE) else {
            return Err(DeployerError::Unsupported(
                "host has no data area for a pending request".to_string(),
            ));
        };
        let json = serde_json::to_vec_pretty(request)
            .map_err(|e| DeployerError::Internal(e.to_string()))?;
        tokio::fs::write(&path, json).await.map_err(HostError::Io)?;
        info!(path = %path.display(), "Pending request saved");
        Ok(())
    }

    fn emit(&self, event: StrataEvent) {
        if let StrataEvent::Feature { kind, feature_id, region, .. } = &event {
            info!(kind = ?kind, feature = %feature_id, region = %region, "Feature event");
        }
        self.inner.emit(event);
    }

    fn print(&self, message: &str, verbose: bool) {
        if verbose {
            debug!("{}", message);
        } else {
            info!("{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FeatureBundleResolver, HostCall, InMemoryHost};
    use crate::repository::{BundleEntry, InMemoryRepositoryLoader};
    use semver::Version;
    use strata_state::InMemoryStateStorage;
    use strata_types::BundleInfo;

    fn repository() -> FeatureRepository {
        let bundle = |name: &str, version: &str| BundleEntry {
            uri: format!("mvn:org.demo/{}/{}", name, version),
            name: format!("org.demo.{}", name),
            version: Version::parse(version).unwrap(),
            requires: Vec::new(),
            fragment_host: None,
            revision: None,
        };
        FeatureRepository {
            uri: "mem:demo".to_string(),
            name: Some("demo".to_string()),
            features: vec![
                Feature::new("foo", Version::new(1, 3, 0))
                    .with_bundle(BundleInfo::new("mvn:org.demo/foo/1.3.0")),
                Feature::new("foo", Version::new(2, 0, 0))
                    .with_bundle(BundleInfo::new("mvn:org.demo/foo/2.0.0")),
                Feature::new("bar", Version::new(1, 0, 0))
                    .with_bundle(BundleInfo::new("mvn:org.demo/bar/1.0.0")),
            ],
            bundles: vec![
                bundle("foo", "1.3.0"),
                bundle("foo", "2.0.0"),
                bundle("bar", "1.0.0"),
            ],
            repositories: Vec::new(),
        }
    }

    async fn service() -> (FeaturesService, InMemoryHost, Arc<InMemoryStateStorage>) {
        let loader = InMemoryRepositoryLoader::new();
        loader.insert(repository());
        let host = InMemoryHost::new();
        let storage = Arc::new(InMemoryStateStorage::new());
        let service = FeaturesService::open(
            DeployerConfig::default(),
            storage.clone(),
            Arc::new(host.clone()),
            Arc::new(FeatureBundleResolver::new()),
            Arc::new(loader),
        )
        .await
        .unwrap();
        (service, host, storage)
    }

    #[tokio::test]
    async fn test_install_and_uninstall_feature() {
        let (service, host, storage) = service().await;
        service.add_repository("mem:demo", false).await.unwrap();

        let outcome = service
            .install_features(&["foo/[1,2)".to_string()], ROOT_REGION, DeployOptions::default())
            .await
            .unwrap();
        assert!(outcome.is_completed());

        let feature = service.feature("foo", Some("1.3.0")).unwrap().unwrap();
        assert!(service.is_installed(&feature).await);
        assert!(service.is_required(&feature).await);
        assert!(host.unit_named("org.demo.foo").await.is_some());
        assert!(storage.save_count() > 0);

        service
            .uninstall_features(&["foo".to_string()], ROOT_REGION, DeployOptions::default())
            .await
            .unwrap();
        assert!(!service.is_installed(&feature).await);
        assert!(host.unit_named("org.demo.foo").await.is_none());
        assert!(service.list_requirements().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_missing_features() {
        let (service, _, _) = service().await;
        service.add_repository("mem:demo", false).await.unwrap();

        let err = service
            .install_features(&["nope".to_string()], ROOT_REGION, DeployOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployerError::FeatureNotFound(_)));

        let err = service
            .uninstall_features(&["foo".to_string()], ROOT_REGION, DeployOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployerError::NotInstalled(_)));
    }

    #[tokio::test]
    async fn test_upgrade_replaces_requirement() {
        let (service, host, _) = service().await;
        service.add_repository("mem:demo", false).await.unwrap();
        service
            .install_features(&["foo/1.3.0".to_string()], ROOT_REGION, DeployOptions::default())
            .await
            .unwrap();

        let options = DeployOptions {
            upgrade: true,
            ..Default::default()
        };
        service
            .install_features(&["foo/2.0.0".to_string()], ROOT_REGION, options)
            .await
            .unwrap();

        let requirements = service.list_requirements().await;
        assert_eq!(requirements[ROOT_REGION].len(), 1);
        let unit = host.unit_named("org.demo.foo").await.unwrap();
        assert_eq!(unit.version, Version::new(2, 0, 0));
    }

    #[tokio::test]
    async fn test_repository_in_use() {
        let (service, _, _) = service().await;
        service.add_repository("mem:demo", false).await.unwrap();
        service
            .install_features(&["foo/1.3.0".to_string()], ROOT_REGION, DeployOptions::default())
            .await
            .unwrap();

        let err = service.remove_repository("mem:demo", false).await.unwrap_err();
        assert!(matches!(err, DeployerError::RepositoryInUse { .. }));

        service.remove_repository("mem:demo", true).await.unwrap();
        assert!(service.list_repositories().is_empty());
        assert!(service.list_installed_features().await.is_empty());
    }

    #[tokio::test]
    async fn test_events_and_replay() {
        let (service, _, _) = service().await;
        let mut events = service.subscribe();
        service.add_repository("mem:demo", false).await.unwrap();
        service
            .install_features(&["foo/1.3.0".to_string()], ROOT_REGION, DeployOptions::default())
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert!(matches!(
            first.event,
            StrataEvent::Repository {
                kind: RepositoryEventKind::Added,
                replay: false,
                ..
            }
        ));

        let (replay, _) = service.subscribe_with_replay().await;
        assert!(replay.iter().all(|envelope| matches!(
            envelope.event,
            StrataEvent::Repository { replay: true, .. } | StrataEvent::Feature { replay: true, .. }
        )));
        assert_eq!(replay.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_installs_run_one_at_a_time() {
        let (service, host, _) = service().await;
        service.add_repository("mem:demo", false).await.unwrap();
        host.clear_calls().await;

        let foo_specs = ["foo/1.3.0".to_string()];
        let bar_specs = ["bar".to_string()];
        let (foo, bar) = tokio::join!(
            service.install_features(&foo_specs, ROOT_REGION, DeployOptions::default()),
            service.install_features(&bar_specs, ROOT_REGION, DeployOptions::default()),
        );
        assert!(foo.unwrap().is_completed());
        assert!(bar.unwrap().is_completed());

        // Each transaction's host work forms one uninterrupted run
        let owners: Vec<&str> = host
            .calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                HostCall::Install { uri, .. } | HostCall::InstallConfigs(uri) => {
                    Some(if uri.contains("foo") { "foo" } else { "bar" })
                }
                _ => None,
            })
            .collect();
        assert_eq!(owners.len(), 4);
        let switches = owners.windows(2).filter(|pair| pair[0] != pair[1]).count();
        assert_eq!(switches, 1, "interleaved host calls: {:?}", owners);

        let requirements = service.list_requirements().await;
        assert_eq!(requirements[ROOT_REGION].len(), 2);
        assert!(host.unit_named("org.demo.foo").await.is_some());
        assert!(host.unit_named("org.demo.bar").await.is_some());
    }

    #[tokio::test]
    async fn test_boot_done_is_persisted() {
        let (service, _, storage) = service().await;
        service.boot_done().await.unwrap();
        assert!(service.state().await.boot_done);
        assert!(storage.load().await.unwrap().unwrap().boot_done);
    }
}
