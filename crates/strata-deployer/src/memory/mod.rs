//! In-memory collaborators
//!
//! These are suitable for development and testing. Production deployments
//! should plug in a real host runtime and constraint resolver.

mod host;
mod resolver;

pub use host::{manifest_bytes, HostCall, HostImage, InMemoryHost, UnitManifest, SYSTEM_UNIT_NAME};
pub use resolver::FeatureBundleResolver;
