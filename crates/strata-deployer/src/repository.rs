//! Feature repositories
//!
//! A repository is a JSON document listing features, the bundles they
//! reference and further repositories to load.

use async_trait::async_trait;
use dashmap::DashMap;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strata_types::Feature;
use thiserror::Error;
use tracing::debug;

/// Repository errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Repository not found: {0}")]
    NotFound(String),

    #[error("Unsupported repository location: {0}")]
    UnsupportedLocation(String),

    #[error("Unable to read repository {uri}: {reason}")]
    Read { uri: String, reason: String },

    #[error("Invalid repository {uri}: {reason}")]
    Invalid { uri: String, reason: String },
}

/// A bundle known to a repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub uri: String,
    pub name: String,
    pub version: Version,
    /// Locations of bundles this one imports from
    #[serde(default)]
    pub requires: Vec<String>,
    /// Location of the host when this bundle is a fragment
    #[serde(default)]
    pub fragment_host: Option<String>,
    /// Content marker; changing it changes the bundle checksum
    #[serde(default)]
    pub revision: Option<String>,
}

/// A loaded repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRepository {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub bundles: Vec<BundleEntry>,
    /// Referenced repository URIs
    #[serde(default)]
    pub repositories: Vec<String>,
}

/// Loads repositories by URI
#[async_trait]
pub trait RepositoryLoader: Send + Sync {
    async fn load(&self, uri: &str) -> Result<FeatureRepository, RepositoryError>;
}

/// Reads repositories from `file:` URIs or plain paths
#[derive(Debug, Default, Clone)]
pub struct FileRepositoryLoader;

impl FileRepositoryLoader {
    pub fn new() -> Self {
        Self
    }

    fn path_of(uri: &str) -> Result<PathBuf, RepositoryError> {
        if let Some(rest) = uri.strip_prefix("file:") {
            return Ok(PathBuf::from(rest.trim_start_matches("//")));
        }
        if uri.contains("://") || uri.starts_with("mvn:") {
            return Err(RepositoryError::UnsupportedLocation(uri.to_string()));
        }
        Ok(PathBuf::from(uri))
    }
}

#[async_trait]
impl RepositoryLoader for FileRepositoryLoader {
    async fn load(&self, uri: &str) -> Result<FeatureRepository, RepositoryError> {
        let path = Self::path_of(uri)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RepositoryError::NotFound(uri.to_string())
            } else {
                RepositoryError::Read {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        let mut repository: FeatureRepository =
            serde_json::from_slice(&bytes).map_err(|e| RepositoryError::Invalid {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;
        repository.uri = uri.to_string();
        debug!(uri, features = repository.features.len(), "Loaded repository");
        Ok(repository)
    }
}

/// In-memory repositories for development and testing
#[derive(Debug, Default)]
pub struct InMemoryRepositoryLoader {
    repositories: DashMap<String, FeatureRepository>,
}

impl InMemoryRepositoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut repository: FeatureRepository) {
        if repository.uri.is_empty() {
            repository.uri = repository.name.clone().unwrap_or_default();
        }
        self.repositories.insert(repository.uri.clone(), repository);
    }
}

#[async_trait]
impl RepositoryLoader for InMemoryRepositoryLoader {
    async fn load(&self, uri: &str) -> Result<FeatureRepository, RepositoryError> {
        self.repositories
            .get(uri)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RepositoryError::NotFound(uri.to_string()))
    }
}
