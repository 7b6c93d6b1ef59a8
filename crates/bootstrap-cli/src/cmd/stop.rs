use crate::output::{print_json, print_table};
use anyhow::{anyhow, Result};
use bootstrap_core::supervisor::DEFAULT_GRACE;
use std::path::Path;

pub fn run(root: &Path, config_path: Option<&Path>, json: bool) -> Result<()> {
    let (config, _) = super::load_config(root, config_path)?;
    let supervisor = super::supervisor(root, &config);
    let stopped = supervisor
        .cleanup_all(DEFAULT_GRACE)
        .map_err(|e| anyhow!("{e}"))?;

    if json {
        return print_json(&serde_json::json!({ "stopped": stopped }));
    }
    if stopped.is_empty() {
        println!("No supervised processes.");
        return Ok(());
    }
    let rows = stopped
        .iter()
        .map(|r| vec![r.name.clone(), r.pid.to_string(), r.command.join(" ")])
        .collect();
    print_table(&["NAME", "PID", "COMMAND"], rows);
    Ok(())
}
