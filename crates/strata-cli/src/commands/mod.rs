//! CLI command implementations

pub mod feature;
pub mod repo;
pub mod requirements;
pub mod status;

use clap::Args;
use strata_types::DeployOptions;

/// Flags shared by every provisioning command
#[derive(Debug, Clone, Default, Args)]
pub struct DeployFlags {
    /// Compute and print the plan without changing anything
    #[arg(short, long)]
    pub simulate: bool,

    /// Leave new features installed but not started
    #[arg(long)]
    pub no_start: bool,

    /// Do not refresh units whose wiring changed
    #[arg(short = 'r', long)]
    pub no_refresh: bool,

    /// Do not take over units already present on the host
    #[arg(long)]
    pub no_manage: bool,

    /// Print the wiring computed by the resolver
    #[arg(long)]
    pub display_wiring: bool,
}

impl DeployFlags {
    pub fn options(&self, verbose: bool) -> DeployOptions {
        DeployOptions {
            simulate: self.simulate,
            no_start: self.no_start,
            no_refresh: self.no_refresh,
            no_manage: self.no_manage,
            display_wiring: self.display_wiring,
            verbose,
            ..DeployOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_map_onto_options() {
        let flags = DeployFlags {
            simulate: true,
            no_refresh: true,
            ..Default::default()
        };
        let options = flags.options(true);
        assert!(options.simulate && options.no_refresh && options.verbose);
        assert!(!options.no_start && !options.upgrade);
    }
}
