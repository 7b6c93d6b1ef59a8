use crate::output::{format_duration, print_json, print_table};
use anyhow::{anyhow, Context, Result};
use bootstrap_core::allocation::{AllocationOverrides, MemoryQuantity};
use bootstrap_core::pipeline::{self, RunFlags};
use bootstrap_core::stage::{StageGroup, StageStatus};
use bootstrap_core::summary::{RunOutcome, RunSummary};
use bootstrap_core::supervisor::{ProcessSupervisor, DEFAULT_GRACE};
use clap::Args;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long an interrupted run gets to finish its current stage before the
/// background processes are stopped anyway.
const INTERRUPT_WAIT: Duration = Duration::from_secs(15);

#[derive(Args, Debug)]
pub struct UpArgs {
    /// Preview mutating stages without running them
    #[arg(long)]
    pub dry_run: bool,

    /// Skip cluster creation, readiness and resource allocation
    #[arg(long)]
    pub skip_cluster: bool,

    /// Skip platform component stages
    #[arg(long)]
    pub skip_platform: bool,

    /// Skip secret seeding
    #[arg(long)]
    pub skip_secrets: bool,

    /// Skip the networking stage
    #[arg(long)]
    pub skip_network: bool,

    /// CPU limit applied to every node (overrides the allocation table)
    #[arg(long)]
    pub cpus: Option<f64>,

    /// Memory limit applied to every node, e.g. 8g (overrides the allocation table)
    #[arg(long)]
    pub memory: Option<MemoryQuantity>,

    /// Disk size passed to the cluster provisioner, e.g. 50g
    #[arg(long)]
    pub disk: Option<String>,

    /// Topology descriptor (overrides cluster.descriptor)
    #[arg(long)]
    pub topology: Option<PathBuf>,
}

impl UpArgs {
    pub fn flags(&self) -> RunFlags {
        let skip: BTreeSet<StageGroup> = [
            (self.skip_cluster, StageGroup::Cluster),
            (self.skip_platform, StageGroup::Platform),
            (self.skip_secrets, StageGroup::Secrets),
            (self.skip_network, StageGroup::Network),
        ]
        .into_iter()
        .filter_map(|(on, group)| on.then_some(group))
        .collect();
        RunFlags {
            dry_run: self.dry_run,
            skip,
            overrides: AllocationOverrides {
                cpus: self.cpus,
                memory: self.memory,
            },
            disk: self.disk.clone(),
            topology: self.topology.clone(),
        }
    }
}

/// Cleans up supervised processes unless disarmed; covers panics and early
/// returns out of the run.
struct CleanupGuard {
    supervisor: Arc<ProcessSupervisor>,
    armed: bool,
}

impl CleanupGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.supervisor.cleanup_all(DEFAULT_GRACE) {
                tracing::warn!("cleanup failed: {e}");
            }
        }
    }
}

pub fn run(root: &Path, config_path: Option<&Path>, args: UpArgs, json: bool) -> Result<()> {
    let flags = args.flags();
    if let Err(e) = flags.overrides.validate() {
        return Err(anyhow!("{e}"));
    }
    let (config, _) = super::load_config(root, config_path)?;
    let cancel = Arc::new(AtomicBool::new(false));
    let ctx = super::build_context(root, config, flags, cancel.clone());
    let supervisor = ctx.supervisor.clone();

    let rt = tokio::runtime::Runtime::new()?;
    let guard = CleanupGuard {
        supervisor: supervisor.clone(),
        armed: true,
    };

    // None: interrupted and the current stage did not finish in time.
    let outcome = rt.block_on(async {
        let mut task = {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || pipeline::execute(ctx, cancel))
        };
        tokio::select! {
            res = &mut task => Some(res),
            _ = tokio::signal::ctrl_c() => {
                cancel.store(true, Ordering::SeqCst);
                eprintln!(
                    "interrupted; waiting up to {}s for the current stage",
                    INTERRUPT_WAIT.as_secs()
                );
                tokio::time::timeout(INTERRUPT_WAIT, &mut task).await.ok()
            }
        }
    });

    let Some(joined) = outcome else {
        eprintln!("current stage still running; stopping background processes");
        drop(guard);
        std::process::exit(RunOutcome::Interrupted.exit_code());
    };
    let summary = match joined.context("run panicked")? {
        Ok(summary) => summary,
        Err(e) => return Err(anyhow!("{e}")),
    };

    if summary.outcome == RunOutcome::Interrupted {
        report(&summary, json)?;
        eprintln!("stopping background processes");
        drop(guard);
        std::process::exit(RunOutcome::Interrupted.exit_code());
    }
    guard.disarm();

    report(&summary, json)?;
    match summary.outcome {
        RunOutcome::Succeeded | RunOutcome::Degraded => Ok(()),
        RunOutcome::Interrupted => std::process::exit(RunOutcome::Interrupted.exit_code()),
        RunOutcome::Aborted => {
            let failed = summary
                .stages
                .iter()
                .find(|s| s.status == StageStatus::Failed)
                .map(|s| s.name.as_str())
                .unwrap_or("unknown stage");
            Err(anyhow!("run stopped at {failed}"))
        }
    }
}

fn report(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        return print_json(summary);
    }

    let stopped_at = summary
        .stages
        .iter()
        .position(|s| s.status == StageStatus::Failed)
        .filter(|_| summary.outcome == RunOutcome::Aborted);

    let rows: Vec<Vec<String>> = summary
        .stages
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let status = if Some(i) == stopped_at {
                "failed (stopped here)".to_string()
            } else {
                s.status.to_string()
            };
            let detail = s
                .error
                .clone()
                .or_else(|| s.note.clone())
                .unwrap_or_default();
            let duration = match s.status {
                StageStatus::Pending | StageStatus::Skipped => "-".to_string(),
                _ => format_duration(s.duration_secs),
            };
            vec![s.name.clone(), status, duration, detail]
        })
        .collect();
    print_table(&["STAGE", "STATUS", "DURATION", "DETAIL"], rows);

    for stage in &summary.stages {
        if let Some(error) = stage.error.as_deref().filter(|e| e.contains('\n')) {
            println!();
            println!("{}: {error}", stage.name);
        }
    }

    println!();
    println!(
        "Run {}{}: {} succeeded, {} failed, {} skipped, {} pending ({})",
        summary.outcome,
        if summary.dry_run { " (dry run)" } else { "" },
        summary.count(StageStatus::Succeeded),
        summary.count(StageStatus::Failed),
        summary.count(StageStatus::Skipped),
        summary.count(StageStatus::Pending),
        format_duration(summary.total_secs()),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_flags_map_to_groups() {
        let args = UpArgs {
            dry_run: true,
            skip_cluster: true,
            skip_platform: false,
            skip_secrets: true,
            skip_network: false,
            cpus: Some(2.0),
            memory: None,
            disk: Some("40g".into()),
            topology: None,
        };
        let flags = args.flags();
        assert!(flags.dry_run);
        assert_eq!(
            flags.skip,
            BTreeSet::from([StageGroup::Cluster, StageGroup::Secrets])
        );
        assert_eq!(flags.overrides.cpus, Some(2.0));
        assert_eq!(flags.disk.as_deref(), Some("40g"));
    }
}
