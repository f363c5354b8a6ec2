//! Host status command

use serde::Serialize;
use strata_types::UnitState;
use tabled::Tabled;

use crate::error::CliResult;
use crate::output::{self, OutputFormat};
use crate::workspace::Workspace;

/// Table row for unit display
#[derive(Debug, Serialize, Tabled)]
struct UnitRow {
    id: u64,
    name: String,
    version: String,
    state: String,
    level: u32,
    region: String,
    managed: String,
}

fn format_state(state: UnitState) -> String {
    format!("{:?}", state)
}

/// Print every unit on the host with its region and ownership
pub async fn execute(workspace: &Workspace, format: OutputFormat) -> CliResult<()> {
    let image = workspace.image().await;
    let state = workspace.service.state().await;

    let rows: Vec<UnitRow> = image
        .units
        .values()
        .map(|unit| {
            let region = image
                .topology
                .region_of(unit.id)
                .map(str::to_string)
                .unwrap_or_else(|| "-".to_string());
            let managed = state
                .managed_bundles
                .values()
                .any(|units| units.contains(&unit.id));
            UnitRow {
                id: unit.id.0,
                name: unit.name.clone(),
                version: unit.version.to_string(),
                state: format_state(unit.state),
                level: unit.start_level,
                region,
                managed: if managed { "x" } else { "" }.to_string(),
            }
        })
        .collect();
    output::print_output(rows, format)
}
