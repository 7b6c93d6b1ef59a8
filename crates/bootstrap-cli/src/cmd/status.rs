use crate::output::{format_duration, print_json, print_table};
use anyhow::{anyhow, Result};
use bootstrap_core::paths;
use bootstrap_core::summary::{load_phase, RunSummary};
use serde_json::{Map, Value};
use std::path::Path;

const PHASES: [&str; 3] = [
    paths::CLUSTER_SUMMARY,
    paths::SECRETS_SUMMARY,
    paths::NETWORK_SUMMARY,
];

pub fn run(root: &Path, config_path: Option<&Path>, json: bool) -> Result<()> {
    let (config, _) = super::load_config(root, config_path)?;
    let state_dir = config.state_dir(root);
    let summary = RunSummary::load(&state_dir).map_err(|e| anyhow!("{e}"))?;

    let mut phases = Map::new();
    for phase in PHASES {
        if let Some(doc) = load_phase(&state_dir, phase).map_err(|e| anyhow!("{e}"))? {
            phases.insert(phase.to_string(), doc);
        }
    }
    let records = super::supervisor(root, &config)
        .list_records()
        .map_err(|e| anyhow!("{e}"))?;

    if json {
        let processes: Vec<Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.name,
                    "pid": r.pid,
                    "alive": r.is_running(),
                    "command": r.command,
                    "started_at": r.started_at,
                })
            })
            .collect();
        return print_json(&serde_json::json!({
            "run": summary,
            "phases": phases,
            "processes": processes,
        }));
    }

    let Some(summary) = summary else {
        println!("No runs recorded in {}.", state_dir.display());
        return Ok(());
    };

    println!(
        "Last run {} {}{} at {}",
        summary.run_id,
        summary.outcome,
        if summary.dry_run { " (dry run)" } else { "" },
        summary.completed_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();
    let rows = summary
        .stages
        .iter()
        .map(|s| {
            vec![
                s.name.clone(),
                s.status.to_string(),
                format_duration(s.duration_secs),
                s.error.clone().or_else(|| s.note.clone()).unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["STAGE", "STATUS", "DURATION", "DETAIL"], rows);

    if !phases.is_empty() {
        println!();
        let rows = phases
            .iter()
            .map(|(phase, doc)| {
                let written = doc
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .unwrap_or("-")
                    .to_string();
                let file = paths::phase_summary_path(&state_dir, phase);
                vec![phase.clone(), written, file.display().to_string()]
            })
            .collect();
        print_table(&["PHASE", "WRITTEN", "FILE"], rows);
    }

    if !records.is_empty() {
        println!();
        let rows = records
            .iter()
            .map(|r| {
                vec![
                    r.name.clone(),
                    r.pid.to_string(),
                    if r.is_running() { "running" } else { "exited" }.to_string(),
                    r.command.join(" "),
                ]
            })
            .collect();
        print_table(&["PROCESS", "PID", "STATE", "COMMAND"], rows);
    }
    Ok(())
}
