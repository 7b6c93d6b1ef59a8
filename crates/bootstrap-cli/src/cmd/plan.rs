use crate::output::{print_json, print_table};
use anyhow::{anyhow, Result};
use bootstrap_core::allocation::{AllocationOverrides, MemoryQuantity, NodeRole};
use bootstrap_core::pipeline::{self, RunFlags};
use clap::Args;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Topology descriptor (overrides cluster.descriptor)
    #[arg(long)]
    pub topology: Option<PathBuf>,

    /// CPU limit applied to every node
    #[arg(long)]
    pub cpus: Option<f64>,

    /// Memory limit applied to every node, e.g. 8g
    #[arg(long)]
    pub memory: Option<MemoryQuantity>,
}

const TABLE_ROLES: [NodeRole; 4] = [
    NodeRole::ControlPlane,
    NodeRole::Application,
    NodeRole::GpuWorker,
    NodeRole::Unknown,
];

pub fn run(root: &Path, config_path: Option<&Path>, args: PlanArgs, json: bool) -> Result<()> {
    let flags = RunFlags {
        overrides: AllocationOverrides {
            cpus: args.cpus,
            memory: args.memory,
        },
        topology: args.topology,
        ..RunFlags::default()
    };
    flags.overrides.validate().map_err(|e| anyhow!("{e}"))?;

    let (config, _) = super::load_config(root, config_path)?;
    let ctx = super::build_context(root, config, flags, Arc::default());
    let stages = pipeline::describe_stages(&ctx);

    match ctx.discover_nodes() {
        Ok((nodes, source)) => {
            let plan = ctx.allocation_plan(&nodes);
            let summary = plan.summary(&ctx.host);
            if json {
                return print_json(&serde_json::json!({
                    "descriptor": ctx.descriptor(),
                    "nodes_from": source,
                    "plan": plan,
                    "summary": summary,
                    "stages": stages,
                }));
            }
            let rows = plan
                .nodes
                .iter()
                .map(|n| {
                    vec![
                        n.node.clone(),
                        n.role.to_string(),
                        n.classified_by.to_string(),
                        n.limits.cpus.to_string(),
                        n.limits.memory.to_string(),
                    ]
                })
                .collect();
            print_table(&["NODE", "ROLE", "BY", "CPUS", "MEMORY"], rows);
            println!();
            println!("{summary}");
            if summary.overcommitted() {
                println!("warning: assigned limits exceed host capacity");
            }
        }
        Err(e) => {
            tracing::warn!("no nodes to classify ({e}); showing per-role limits");
            let policy = ctx.allocation_policy();
            let limits: Vec<(NodeRole, _)> = TABLE_ROLES
                .iter()
                .map(|role| (*role, policy.limits_for(*role)))
                .collect();
            if json {
                let roles: Vec<Value> = limits
                    .iter()
                    .map(|(role, (limits, source))| {
                        serde_json::json!({ "role": role, "limits": limits, "source": source })
                    })
                    .collect();
                return print_json(&serde_json::json!({
                    "descriptor": ctx.descriptor(),
                    "cluster_type": policy.cluster_type(),
                    "roles": roles,
                    "stages": stages,
                }));
            }
            println!("Cluster type: {}", policy.cluster_type());
            println!();
            let rows = limits
                .iter()
                .map(|(role, (limits, source))| {
                    vec![
                        role.to_string(),
                        limits.cpus.to_string(),
                        limits.memory.to_string(),
                        source.as_str().to_string(),
                    ]
                })
                .collect();
            print_table(&["ROLE", "CPUS", "MEMORY", "SOURCE"], rows);
        }
    }

    println!();
    let rows = stages
        .iter()
        .map(|s| {
            let field = |k: &str| s.get(k).cloned().unwrap_or(Value::Null);
            vec![
                field("name").as_str().unwrap_or_default().to_string(),
                field("group").as_str().unwrap_or("-").to_string(),
                if field("abort_on_failure").as_bool().unwrap_or(true) {
                    "abort".to_string()
                } else {
                    "continue".to_string()
                },
            ]
        })
        .collect();
    print_table(&["STAGE", "GROUP", "ON FAILURE"], rows);
    Ok(())
}
