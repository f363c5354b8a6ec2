//! A straightforward feature resolver
//!
//! Picks the highest feature version matching each requirement, pulls in
//! dependencies and conditional content, and places every referenced
//! bundle in the requesting region. Bundle-to-bundle wires come from the
//! `requires` and `fragment_host` entries of the repository catalog.

use super::host::manifest_bytes;
use crate::repository::BundleEntry;
use crate::resolver::{FeatureResolver, ResolveError, ResolveRequest, Resolution};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use strata_types::{
    BundleInfo, Feature, FeatureReq, Namespace, Requirement, Resource, ResourceKey,
    SharingPolicy, VersionRange, Wire, ROOT_REGION,
};
use tracing::debug;

/// Resolver over the features and bundles of the loaded repositories
#[derive(Debug, Default)]
pub struct FeatureBundleResolver {
    interrupt: AtomicBool,
}

impl FeatureBundleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next resolution fail with [`ResolveError::Interrupted`]
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    fn check_interrupted(&self) -> Result<(), ResolveError> {
        if self.interrupt.swap(false, Ordering::SeqCst) {
            return Err(ResolveError::Interrupted);
        }
        Ok(())
    }
}

fn parse_req(input: &str) -> Result<FeatureReq, ResolveError> {
    FeatureReq::parse(input).map_err(|e| ResolveError::InvalidRequirement(e.to_string()))
}

fn is_blacklisted(request: &ResolveRequest<'_>, req: &FeatureReq, raw: &str) -> bool {
    request.blacklist.contains(raw) || request.blacklist.contains(&req.name)
}

/// Highest available feature matching `req`
fn best_match<'a>(request: &ResolveRequest<'a>, req: &FeatureReq) -> Option<&'a Feature> {
    request
        .features
        .values()
        .filter(|feature| req.matches(feature))
        .max_by(|a, b| a.version.cmp(&b.version))
}

/// Requirement of a dependency, widened by the feature resolution range
fn dependency_req(request: &ResolveRequest<'_>, raw: &str) -> Result<FeatureReq, ResolveError> {
    let mut req = parse_req(raw)?;
    if req.range == VersionRange::exact(req.range.floor.clone()) {
        req.range = request.feature_resolution_range.range_for(&req.range.floor);
    }
    Ok(req)
}

/// Features required in one region, dependencies included, by id
fn collect_features<'a>(
    request: &ResolveRequest<'a>,
    requirements: &BTreeSet<String>,
) -> Result<BTreeMap<String, &'a Feature>, ResolveError> {
    let mut selected: BTreeMap<String, &'a Feature> = BTreeMap::new();
    let mut pending: Vec<FeatureReq> = Vec::new();

    for raw in requirements {
        let req = parse_req(raw)?;
        if is_blacklisted(request, &req, raw) {
            debug!(requirement = %raw, "Skipping blacklisted requirement");
            continue;
        }
        pending.push(req);
    }

    while let Some(req) = pending.pop() {
        let feature = best_match(request, &req).ok_or_else(|| {
            ResolveError::Unsatisfiable(format!("No feature matches requirement {}", req))
        })?;
        if selected.insert(feature.id(), feature).is_some() {
            continue;
        }
        for dependency in &feature.dependencies {
            let dep = dependency_req(request, &dependency.requirement)?;
            if !is_blacklisted(request, &dep, &dependency.requirement) {
                pending.push(dep);
            }
        }
    }
    Ok(selected)
}

/// Bundles a feature contributes, given the other features in its region
fn feature_bundles<'a>(
    feature: &'a Feature,
    region_features: &BTreeMap<String, &Feature>,
) -> Result<Vec<&'a BundleInfo>, ResolveError> {
    let mut bundles: Vec<&BundleInfo> = feature.bundles.iter().collect();
    for conditional in &feature.conditionals {
        let mut satisfied = true;
        for condition in &conditional.condition {
            let req = parse_req(condition)?;
            if !region_features.values().any(|f| req.matches(f)) {
                satisfied = false;
                break;
            }
        }
        if satisfied {
            bundles.extend(conditional.bundles.iter());
        }
    }
    Ok(bundles)
}

/// Entry for `location`, replaced by a newer override of the same bundle
fn effective_entry<'a>(
    request: &ResolveRequest<'a>,
    location: &str,
) -> Result<&'a BundleEntry, ResolveError> {
    let entry = request
        .bundles
        .get(location)
        .ok_or_else(|| ResolveError::Unsatisfiable(format!("Unknown bundle {}", location)))?;
    let replacement = request
        .overrides
        .iter()
        .filter_map(|uri| request.bundles.get(uri))
        .filter(|candidate| candidate.name == entry.name && candidate.version > entry.version)
        .max_by(|a, b| a.version.cmp(&b.version));
    Ok(replacement.unwrap_or(entry))
}

/// Key an entry resolves to in `region`, reusing a matching unmanaged unit
fn placed_key(
    request: &ResolveRequest<'_>,
    region: &str,
    entry: &BundleEntry,
) -> (ResourceKey, bool) {
    let key = ResourceKey::bundle(entry.name.clone(), entry.version.clone());
    let reused = [region, ROOT_REGION]
        .iter()
        .filter_map(|r| request.unmanaged.get(*r))
        .flatten()
        .any(|unit| unit.key() == key);
    (key, reused)
}

#[derive(Default)]
struct RegionPlacement {
    bundles: BTreeMap<String, BundleInfo>,
}

impl RegionPlacement {
    fn add(&mut self, location: &str, info: &BundleInfo) {
        match self.bundles.get_mut(location) {
            Some(existing) => {
                existing.start |= info.start;
                // Lowest explicit start level wins
                if info.start_level != 0
                    && (existing.start_level == 0 || info.start_level < existing.start_level)
                {
                    existing.start_level = info.start_level;
                }
                existing.dependency &= info.dependency;
            }
            None => {
                let mut info = info.clone();
                info.location = location.to_string();
                self.bundles.insert(location.to_string(), info);
            }
        }
    }
}

#[async_trait]
impl FeatureResolver for FeatureBundleResolver {
    async fn prerequisites(
        &self,
        request: &ResolveRequest<'_>,
    ) -> Result<BTreeSet<String>, ResolveError> {
        self.check_interrupted()?;
        let mut prerequisites = BTreeSet::new();
        for requirements in request.requirements.values() {
            for feature in collect_features(request, requirements)?.values() {
                for dependency in feature.dependencies.iter().filter(|d| d.prerequisite) {
                    let req = dependency_req(request, &dependency.requirement)?;
                    if let Some(prerequisite) = best_match(request, &req) {
                        prerequisites.insert(prerequisite.id());
                    }
                }
            }
        }
        Ok(prerequisites)
    }

    async fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Resolution, ResolveError> {
        self.check_interrupted()?;
        let mut resolution = Resolution::default();

        for (region, requirements) in request.requirements {
            let features = collect_features(request, requirements)?;
            if features.is_empty() {
                continue;
            }

            let policy = resolution.flat_topology.entry(region.clone()).or_default();
            if region != ROOT_REGION {
                let everything =
                    SharingPolicy::from([("*".to_string(), BTreeSet::from(["*".to_string()]))]);
                policy.insert(ROOT_REGION.to_string(), everything);
            }

            // Features and the bundles they declare
            let mut placement = RegionPlacement::default();
            for feature in features.values() {
                let key = ResourceKey::feature(feature.name.clone(), feature.version.clone());
                let resource = Resource::feature(feature.name.clone(), feature.version.clone());
                resolution.resources.insert(key.clone(), resource);
                resolution
                    .features_per_region
                    .entry(region.clone())
                    .or_default()
                    .insert(key.clone());

                let mut wires = Vec::new();
                for dependency in &feature.dependencies {
                    let req = dependency_req(request, &dependency.requirement)?;
                    if let Some(provider) = features.values().find(|f| req.matches(f)) {
                        wires.push(Wire::new(
                            key.clone(),
                            ResourceKey::feature(provider.name.clone(), provider.version.clone()),
                            Requirement::new(Namespace::Identity, req.to_requirement()),
                        ));
                    }
                }
                for info in feature_bundles(feature, &features)? {
                    let entry = effective_entry(request, &info.location)?;
                    placement.add(&entry.uri, info);
                    let (provider, _) = placed_key(request, region, entry);
                    wires.push(Wire::new(
                        key.clone(),
                        provider,
                        Requirement::new(Namespace::Identity, entry.uri.clone()),
                    ));
                }
                resolution.wiring.entry(key).or_default().extend(wires);
            }

            // Bundles pulled in by other bundles
            let mut pending: Vec<String> = placement.bundles.keys().cloned().collect();
            let mut visited: BTreeSet<String> = BTreeSet::new();
            while let Some(location) = pending.pop() {
                if !visited.insert(location.clone()) {
                    continue;
                }
                let entry = effective_entry(request, &location)?;
                let (key, reused) = placed_key(request, region, entry);
                if reused {
                    continue;
                }

                let required = entry
                    .requires
                    .iter()
                    .map(|uri| (uri, Namespace::Package))
                    .chain(entry.fragment_host.iter().map(|uri| (uri, Namespace::Host)));
                let mut wires = Vec::new();
                for (uri, namespace) in required {
                    let provider_entry = effective_entry(request, uri)?;
                    let (provider, _) = placed_key(request, region, provider_entry);
                    if !placement.bundles.contains_key(&provider_entry.uri) {
                        let mut info = BundleInfo::new(provider_entry.uri.clone());
                        info.dependency = true;
                        placement.add(&provider_entry.uri, &info);
                    }
                    pending.push(provider_entry.uri.clone());
                    wires.push(Wire::new(
                        key.clone(),
                        provider,
                        Requirement::new(namespace, provider_entry.name.clone()),
                    ));
                }
                resolution.wiring.entry(key.clone()).or_default().extend(wires);

                let info = placement
                    .bundles
                    .get(&entry.uri)
                    .cloned()
                    .unwrap_or_else(|| BundleInfo::new(entry.uri.clone()));
                let mut resource =
                    Resource::bundle(entry.name.clone(), entry.version.clone(), entry.uri.clone());
                resource.start = info.start && entry.fragment_host.is_none();
                resource.start_level = info.start_level;
                resolution.resources.insert(key.clone(), resource);
                resolution
                    .resources_per_region
                    .entry(region.clone())
                    .or_default()
                    .insert(key);
                resolution
                    .stream_providers
                    .insert(entry.uri.clone(), manifest_bytes(entry));
            }

            resolution
                .bundle_infos
                .insert(region.clone(), placement.bundles);
        }

        debug!(
            resources = resolution.resources.len(),
            regions = resolution.resources_per_region.len(),
            "Resolution complete"
        );
        Ok(resolution)
    }
}
