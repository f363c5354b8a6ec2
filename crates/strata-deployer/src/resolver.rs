//! Constraint resolver boundary
//!
//! The resolver decides which resources satisfy the requested features and
//! how they are wired. The engine treats it as a pure function of its
//! inputs, apart from interruption.

use crate::repository::BundleEntry;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use strata_types::{
    BundleInfo, Feature, InstalledUnit, RangePolicy, RegionPolicies, Resource, ResourceKey,
    Wiring,
};
use thiserror::Error;

/// Resolver errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{0}")]
    Unsatisfiable(String),

    #[error("resolution interrupted")]
    Interrupted,

    #[error("invalid requirement: {0}")]
    InvalidRequirement(String),
}

/// Inputs of one resolution
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    /// Available features by id
    pub features: &'a BTreeMap<String, Feature>,
    /// Region to feature requirements
    pub requirements: &'a BTreeMap<String, BTreeSet<String>>,
    /// Location to bundle metadata from the loaded repositories
    pub bundles: &'a BTreeMap<String, BundleEntry>,
    /// Region to units not owned by the engine, usable as providers
    pub unmanaged: &'a BTreeMap<String, Vec<InstalledUnit>>,
    pub overrides: &'a BTreeSet<String>,
    pub blacklist: &'a BTreeSet<String>,
    pub feature_resolution_range: RangePolicy,
}

/// Output of one resolution
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Requirer to outbound wires
    pub wiring: Wiring,
    /// Every resource taking part in the resolution, features included
    pub resources: BTreeMap<ResourceKey, Resource>,
    /// Region to bundle resources placed there
    pub resources_per_region: BTreeMap<String, BTreeSet<ResourceKey>>,
    /// Region to feature resources placed there
    pub features_per_region: BTreeMap<String, BTreeSet<ResourceKey>>,
    /// Region to location to bundle info
    pub bundle_infos: BTreeMap<String, BTreeMap<String, BundleInfo>>,
    /// Location to content
    pub stream_providers: BTreeMap<String, Bytes>,
    /// Flattened isolation graph
    pub flat_topology: RegionPolicies,
}

impl Resolution {
    pub fn resource(&self, key: &ResourceKey) -> Option<&Resource> {
        self.resources.get(key)
    }

    /// Bundle info declared for a resource placed in `region`
    pub fn bundle_info(&self, region: &str, resource: &Resource) -> Option<&BundleInfo> {
        let uri = resource.uri.as_deref()?;
        self.bundle_infos.get(region)?.get(uri)
    }

    pub fn content(&self, uri: &str) -> Option<Bytes> {
        self.stream_providers.get(uri).cloned()
    }
}

/// Constraint resolver collaborator
#[async_trait]
pub trait FeatureResolver: Send + Sync {
    /// Prerequisite feature ids that must be deployed before the request
    async fn prerequisites(
        &self,
        request: &ResolveRequest<'_>,
    ) -> Result<BTreeSet<String>, ResolveError>;

    /// Resolve the request into wiring and placement
    async fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Resolution, ResolveError>;
}
