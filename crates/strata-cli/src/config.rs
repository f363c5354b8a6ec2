//! CLI configuration
//!
//! Read from `--config` or `<config dir>/strata/strata.toml`. The same file
//! carries the engine policies, loaded through [`DeployerConfig::load`],
//! which ignores the CLI-only keys below.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strata_deployer::DeployerConfig;
use strata_types::ROOT_REGION;

use crate::error::{CliError, CliResult};
use crate::output::OutputFormat;

/// CLI-only settings of the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Directory holding the state document, the host image and data files
    pub data_dir: Option<PathBuf>,

    /// Region used when `--region` is not given
    pub default_region: Option<String>,

    /// Output format used when `--output` is not given
    pub output: Option<OutputFormat>,

    /// File the settings were read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl CliConfig {
    /// Load from an explicit path, else from the default location when present
    pub fn load(path: Option<&str>) -> CliResult<Self> {
        let path = match path {
            Some(path) => PathBuf::from(path),
            None => match default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .map_err(|e| CliError::Config(format!("{}: {}", path.display(), e)))?;
        config.source = Some(path);
        Ok(config)
    }

    pub fn region(&self) -> String {
        self.default_region
            .clone()
            .unwrap_or_else(|| ROOT_REGION.to_string())
    }

    pub fn output(&self, flag: Option<OutputFormat>) -> OutputFormat {
        flag.or(self.output).unwrap_or_default()
    }

    /// Data directory: the flag wins over the file, then the platform default
    pub fn resolve_data_dir(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.data_dir.clone())
            .or_else(|| dirs::data_local_dir().map(|dir| dir.join("strata")))
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    /// Engine configuration with its data directory pointed at `data_dir`
    pub fn engine(&self, data_dir: &Path) -> CliResult<DeployerConfig> {
        let source = self.source.as_deref().and_then(Path::to_str);
        let mut engine =
            DeployerConfig::load(source).map_err(|e| CliError::Config(e.to_string()))?;
        engine.data_dir = data_dir.to_path_buf();
        Ok(engine)
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("strata").join("strata.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::SnapshotUpdatePolicy;

    #[test]
    fn test_flag_overrides_file() {
        let config = CliConfig {
            data_dir: Some(PathBuf::from("/var/lib/strata")),
            output: Some(OutputFormat::Yaml),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_data_dir(Some(Path::new("/tmp/x"))),
            PathBuf::from("/tmp/x")
        );
        assert_eq!(config.resolve_data_dir(None), PathBuf::from("/var/lib/strata"));
        assert_eq!(config.output(Some(OutputFormat::Json)), OutputFormat::Json);
        assert_eq!(config.output(None), OutputFormat::Yaml);
    }

    #[test]
    fn test_one_file_for_cli_and_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(
            &path,
            "default_region = \"apps\"\noutput = \"json\"\nupdate_snapshots = \"always\"\n",
        )
        .unwrap();

        let config = CliConfig::load(path.to_str()).unwrap();
        assert_eq!(config.region(), "apps");
        assert_eq!(config.output(None), OutputFormat::Json);

        let engine = config.engine(Path::new("/srv/strata")).unwrap();
        assert_eq!(engine.update_snapshots, SnapshotUpdatePolicy::Always);
        assert_eq!(engine.data_dir, PathBuf::from("/srv/strata"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(CliConfig::load(Some("/nonexistent/strata/strata.toml")).is_err());
    }
}
