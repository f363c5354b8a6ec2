//! Strata Deployer - Deployment reconciliation engine
//!
//! Drives a live modular runtime from its current set of installed units
//! to the set implied by a desired list of features, one transaction at a
//! time. Host mutations go through [`HostRuntime`]; dependency solving goes
//! through [`FeatureResolver`].
//!
//! ## Architectural Boundaries
//!
//! - `strata-types` owns: resources, units, regions, features, requests
//! - `strata-state` owns: the persisted provisioning state and its storage
//! - `strata-deployer` owns: planning, ordering and executing transactions
//! - The host runtime owns: installing, starting, stopping and wiring units
//!   (called BY the engine)
//!
//! ## Key Concepts
//!
//! - **DeploymentState**: immutable snapshot of the host taken per transaction
//! - **Deployment**: per-region units to install, update and delete
//! - **Refresh set**: units whose wiring is invalidated by the transaction
//! - **ExecutionScheduler**: stop and start ordering by start level and usage
//! - **Deployer**: the orchestrator running one transaction
//! - **FeaturesService**: repositories, feature queries and serialized provisioning
//!
//! ## Usage
//!
//! ```no_run
//! use strata_deployer::memory::{FeatureBundleResolver, InMemoryHost};
//! use strata_deployer::{DeployerConfig, FeaturesService, InMemoryRepositoryLoader};
//! use strata_state::InMemoryStateStorage;
//! use strata_types::{DeployOptions, ROOT_REGION};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = FeaturesService::open(
//!     DeployerConfig::default(),
//!     Arc::new(InMemoryStateStorage::new()),
//!     Arc::new(InMemoryHost::new()),
//!     Arc::new(FeatureBundleResolver::new()),
//!     Arc::new(InMemoryRepositoryLoader::new()),
//! )
//! .await?;
//!
//! // service.add_repository("file:features.json", false).await?;
//! let outcome = service
//!     .install_features(&["foo/[1,2)".to_string()], ROOT_REGION, DeployOptions::default())
//!     .await;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod deployer;
pub mod error;
pub mod host;
pub mod manager;
pub mod memory;
pub mod planner;
pub mod refresh;
pub mod repository;
pub mod resolver;
pub mod scheduler;
pub mod snapshot;
pub mod topology;

// Re-exports
pub use config::DeployerConfig;
pub use deployer::{DeployCallback, DeployOutcome, Deployer, DeploymentReport};
pub use error::{DeployerError, Result, UnitFailure};
pub use host::{FrameworkInfo, HostError, HostRuntime, RefreshGate};
pub use manager::{FeaturesService, Requirements, StateChanges, RESOLVE_FILE};
pub use planner::{compute_deployment, Deployment, RegionDeployment};
pub use refresh::{compute_units_to_refresh, RefreshSet};
pub use repository::{
    BundleEntry, FeatureRepository, FileRepositoryLoader, InMemoryRepositoryLoader,
    RepositoryError, RepositoryLoader,
};
pub use resolver::{FeatureResolver, ResolveError, ResolveRequest, Resolution};
pub use scheduler::{units_to_start, units_to_stop, ExecutionScheduler};
pub use snapshot::DeploymentState;
pub use topology::{commit_topology, plan_topology, topology_drift, TopologyPlan};
