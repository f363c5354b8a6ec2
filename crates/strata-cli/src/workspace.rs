//! Provisioning workspace
//!
//! Ties the features service to a data directory: the state document, a
//! simulated host persisted as `host.json`, and the engine data files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_deployer::memory::{FeatureBundleResolver, HostImage, InMemoryHost};
use strata_deployer::{DeployerConfig, FeaturesService, FileRepositoryLoader};
use strata_state::FileStateStorage;
use tracing::{debug, info};

use crate::error::CliResult;
use crate::output::{self, OutputFormat};

/// Host image document inside the data directory
pub const HOST_FILE: &str = "host.json";

/// An opened data directory
pub struct Workspace {
    pub service: FeaturesService,
    host: InMemoryHost,
    data_dir: PathBuf,
}

impl Workspace {
    /// Open `engine.data_dir`, restoring the host and resuming pending work
    pub async fn open(engine: DeployerConfig, format: OutputFormat) -> CliResult<Self> {
        let data_dir = engine.data_dir.clone();
        tokio::fs::create_dir_all(&data_dir).await?;

        // 1. Restore the host, completing a restart left pending
        let mut image = load_image(&data_dir).await?;
        if image.restart_pending {
            info!("Completing scheduled host restart");
            image.restart_pending = false;
        }
        let host = InMemoryHost::from_image(image).with_data_dir(&data_dir);

        // 2. Open the service on the stored state
        let storage = Arc::new(FileStateStorage::new(engine.state_path()));
        let service = FeaturesService::open(
            engine,
            storage,
            Arc::new(host.clone()),
            Arc::new(FeatureBundleResolver::new()),
            Arc::new(FileRepositoryLoader::new()),
        )
        .await?;

        let workspace = Self {
            service,
            host,
            data_dir,
        };

        // 3. Resume a request interrupted by an engine self-update
        if let Some(outcome) = workspace.service.resume_pending().await? {
            output::print_outcome("Resumed provisioning", &outcome, format)?;
            workspace.save().await?;
        }
        Ok(workspace)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Write the host image back to the data directory
    pub async fn save(&self) -> CliResult<()> {
        let image = self.host.image().await;
        let path = self.data_dir.join(HOST_FILE);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&image)?).await?;
        debug!(path = %path.display(), units = image.units.len(), "Saved host image");
        Ok(())
    }

    /// The simulated host's current picture
    pub async fn image(&self) -> HostImage {
        self.host.image().await
    }
}

async fn load_image(data_dir: &Path) -> CliResult<HostImage> {
    let path = data_dir.join(HOST_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HostImage::bootstrap()),
        Err(e) => Err(e.into()),
    }
}
