//! Strata Types - Core types for feature provisioning
//!
//! Strata keeps a live modular runtime in line with a desired set of
//! features. Features group installable units ("bundles"); units live in
//! isolation regions connected by a region digraph.
//!
//! ## Architectural Boundaries
//!
//! - **strata-types** owns: the data model shared by every other crate
//! - **strata-state** owns: the persisted provisioning state
//! - **strata-deployer** owns: planning and executing reconciliation transactions
//!
//! ## Key Concepts
//!
//! - **Resource**: A desired deployable unit, produced by the resolver
//! - **InstalledUnit**: A live unit inside the host runtime
//! - **RegionDigraph**: Isolation regions and their sharing policies
//! - **Feature**: A named, versioned aggregate of bundles, configs and libraries
//! - **DeploymentRequest**: Desired requirements per region plus options
//! - **Events**: Deployment and feature lifecycle notifications

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod events;
pub mod feature;
pub mod ids;
pub mod region;
pub mod request;
pub mod resource;
pub mod unit;
pub mod version;

// Re-export main types
pub use events::{
    DeploymentEvent, EventSeverity, FeatureEventKind, RepositoryEventKind, StrataEvent,
    StrataEventEnvelope,
};
pub use feature::{
    BundleInfo, Conditional, ConfigInfo, Dependency, Feature, FeatureReq, FeatureState,
    feature_id,
};
pub use ids::{ROOT_REGION, UnitId};
pub use region::{Region, RegionDigraph, RegionPolicies, SharingPolicy, TopologyError};
pub use request::{DeployOptions, DeploymentRequest, SnapshotUpdatePolicy};
pub use resource::{
    Capability, Effective, Namespace, Requirement, Resource, ResourceKey, ResourceKind, Wire,
    Wiring, providers_of,
};
pub use unit::{InstalledUnit, ServiceRef, UnitState, UnitWire};
pub use version::{RangePolicy, VersionError, VersionRange, parse_version};
