//! The bootstrap stage list and the context it runs against.
//!
//! Order is fixed: preflight, cluster-create, cluster-ready,
//! resource-allocation, one `component:<name>` stage per platform component,
//! seed-secrets, networking.

use crate::allocation::{
    cluster_type_from_descriptor, AllocationOverrides, AllocationPlan, AllocationPolicy,
    ClusterType, HostCapacity, NodeInfo, RoleClassifier,
};
use crate::clock::Clock;
use crate::config::{BootstrapConfig, ComponentConfig};
use crate::env::Environment;
use crate::error::{BootstrapError, Result};
use crate::io::ensure_dir;
use crate::paths;
use crate::platform::{ClusterApi, ClusterProvisioner, DockerRuntime, K3d, Kubectl, NodeRuntime};
use crate::retry::RetryExecutor;
use crate::secrets::{self, SecretSeeder, SecretStore, VaultStore};
use crate::sequencer::{SequencerOptions, StageSequencer};
use crate::stage::{Stage, StageContext, StageGroup, StageOutput};
use crate::summary::{RunSummary, RunSummaryRecorder};
use crate::supervisor::{ProcessSupervisor, DEFAULT_GRACE};
use crate::wait::{ConditionWaiter, WaitSpec};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Name of the supervised networking helper's process record.
pub const TUNNEL_PROCESS: &str = "tunnel";

/// Exported to the provisioner when `--disk` is given.
pub const DISK_SIZE_ENV: &str = "BOOTSTRAP_DISK_SIZE";

// ---------------------------------------------------------------------------
// RunFlags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunFlags {
    pub dry_run: bool,
    pub skip: BTreeSet<StageGroup>,
    pub overrides: AllocationOverrides,
    pub disk: Option<String>,
    /// Overrides `cluster.descriptor`.
    pub topology: Option<PathBuf>,
}

impl RunFlags {
    pub fn skips(&self, group: StageGroup) -> bool {
        self.skip.contains(&group)
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

pub struct Collaborators {
    pub cluster: Arc<dyn ClusterApi>,
    pub provisioner: Arc<dyn ClusterProvisioner>,
    pub runtime: Arc<dyn NodeRuntime>,
    pub secrets: Arc<dyn SecretStore>,
}

impl Collaborators {
    /// The command-line adapters: kubectl, k3d, docker and the vault CLI.
    pub fn command_line(
        root: &Path,
        config: &BootstrapConfig,
        env: &Environment,
        flags: &RunFlags,
    ) -> Self {
        let descriptor = descriptor_path(root, config, flags);
        let provisioner_env = flags
            .disk
            .iter()
            .map(|d| (DISK_SIZE_ENV.to_string(), d.clone()))
            .collect();
        Self {
            cluster: Arc::new(Kubectl::new(Some(config.cluster.kube_context()))),
            provisioner: Arc::new(K3d {
                cluster_name: config.cluster.name.clone(),
                descriptor,
                env: provisioner_env,
            }),
            runtime: Arc::new(DockerRuntime),
            secrets: Arc::new(VaultStore::new(
                config.secrets.mount.clone(),
                env.get(&config.secrets.address_env),
                env.get(&config.secrets.token_env),
            )),
        }
    }
}

fn descriptor_path(root: &Path, config: &BootstrapConfig, flags: &RunFlags) -> PathBuf {
    let descriptor = flags
        .topology
        .as_deref()
        .unwrap_or(&config.cluster.descriptor);
    config.resolve(root, descriptor)
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Everything a run reads. Built once, shared by every stage, never mutated.
pub struct RunContext {
    pub root: PathBuf,
    pub config: BootstrapConfig,
    pub env: Environment,
    pub flags: RunFlags,
    pub clock: Arc<dyn Clock>,
    pub platform: Collaborators,
    pub supervisor: Arc<ProcessSupervisor>,
    pub host: HostCapacity,
}

impl RunContext {
    pub fn state_dir(&self) -> PathBuf {
        self.config.state_dir(&self.root)
    }

    pub fn descriptor(&self) -> PathBuf {
        descriptor_path(&self.root, &self.config, &self.flags)
    }

    pub fn cluster_type(&self) -> ClusterType {
        cluster_type_from_descriptor(&self.descriptor().to_string_lossy())
    }

    pub fn allocation_policy(&self) -> AllocationPolicy {
        AllocationPolicy::new(
            self.cluster_type(),
            self.config.allocation.clone(),
            self.flags.overrides,
        )
    }

    fn waiter(&self) -> ConditionWaiter {
        ConditionWaiter::new(self.clock.clone())
    }

    fn retry(&self) -> RetryExecutor {
        RetryExecutor::new(self.clock.clone())
    }

    /// Nodes with live labels, or bare provisioner names when the cluster API
    /// cannot be reached. The second value names the source.
    pub fn discover_nodes(&self) -> Result<(Vec<NodeInfo>, &'static str)> {
        match self.platform.cluster.nodes() {
            Ok(nodes) if !nodes.is_empty() => return Ok((nodes, "cluster")),
            Ok(_) => tracing::debug!("cluster reported no nodes"),
            Err(e) => tracing::warn!("cannot list cluster nodes ({e}); classifying by name"),
        }
        let names = self.platform.provisioner.node_names()?;
        Ok((names.into_iter().map(NodeInfo::named).collect(), "provisioner"))
    }

    pub fn allocation_plan(&self, nodes: &[NodeInfo]) -> AllocationPlan {
        self.allocation_policy()
            .plan(nodes, &RoleClassifier::default())
    }

    /// Variables the enabled stages need.
    pub fn required_variables(&self) -> Vec<String> {
        let mut names = self.config.required_env.clone();
        if !self.flags.skips(StageGroup::Secrets) {
            for name in self.config.required_variables() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            let token = &self.config.secrets.token_env;
            if !names.contains(token) {
                names.push(token.clone());
            }
        }
        names
    }

    fn required_tools(&self) -> Vec<&'static str> {
        let mut tools = Vec::new();
        let cluster = !self.flags.skips(StageGroup::Cluster);
        if cluster || !self.flags.skips(StageGroup::Platform) || !self.flags.skips(StageGroup::Network) {
            tools.push("kubectl");
        }
        if cluster {
            tools.extend(["k3d", "docker"]);
        }
        if !self.flags.skips(StageGroup::Secrets) {
            tools.push("vault");
        }
        tools
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

pub fn build_stages(ctx: &Arc<RunContext>) -> Vec<Stage> {
    let mut stages = vec![
        preflight(ctx.clone()),
        cluster_create(ctx.clone()),
        cluster_ready(ctx.clone()),
        resource_allocation(ctx.clone()),
    ];
    // Repeated component names are a preflight error; only the first gets a
    // stage so the run still reaches preflight and records its summary.
    let mut seen = BTreeSet::new();
    for component in &ctx.config.components {
        if seen.insert(component.name.as_str()) {
            stages.push(component_stage(ctx.clone(), component.clone()));
        }
    }
    stages.push(seed_secrets(ctx.clone()));
    stages.push(networking(ctx.clone()));
    stages
}

/// Read-only checks. Runs in dry-run as well; every problem is reported at
/// once.
fn preflight(ctx: Arc<RunContext>) -> Stage {
    Stage::new("preflight", move |sc: &StageContext<'_>| {
        let mut problems: Vec<String> = ctx
            .config
            .validate()
            .into_iter()
            .filter(|w| w.level == crate::config::WarnLevel::Error)
            .map(|w| w.message)
            .collect();

        if let Err(e) = ctx.flags.overrides.validate() {
            problems.push(e.to_string());
        }

        let missing = ctx.env.missing(ctx.required_variables().iter().map(String::as_str));

        if !ctx.flags.skips(StageGroup::Secrets) {
            if let Err(BootstrapError::MissingVariables(names)) =
                secrets::validate(&ctx.config.secrets.records, &ctx.env)
            {
                problems.extend(
                    names
                        .into_iter()
                        .filter(|n| !missing.contains(n))
                        .map(|n| format!("secret field {n}")),
                );
            }
        }

        if !ctx.flags.skips(StageGroup::Cluster) {
            let descriptor = ctx.descriptor();
            if !descriptor.is_file() {
                problems.push(format!("topology descriptor not found: {}", descriptor.display()));
            }
        }

        if !ctx.flags.skips(StageGroup::Platform) {
            for c in &ctx.config.components {
                let manifest = ctx.config.resolve(&ctx.root, &c.manifest);
                if !manifest.exists() {
                    problems.push(format!(
                        "component '{}': manifest not found: {}",
                        c.name,
                        manifest.display()
                    ));
                }
            }
        }

        if !problems.is_empty() {
            problems.extend(
                missing
                    .iter()
                    .map(|n| format!("missing required variable {n}")),
            );
            return Err(BootstrapError::Validation(problems));
        }
        if !missing.is_empty() {
            return Err(BootstrapError::MissingVariables(missing));
        }

        let absent: Vec<&str> = ctx
            .required_tools()
            .into_iter()
            .filter(|t| which::which(t).is_err())
            .collect();
        if let Some(first) = absent.first() {
            if !sc.dry_run {
                return Err(BootstrapError::ToolNotFound(first.to_string()));
            }
            tracing::warn!("not on PATH (a real run would stop here): {}", absent.join(", "));
            return Ok(StageOutput::done()
                .with_note(format!("checks passed; missing tools: {}", absent.join(", "))));
        }

        Ok(StageOutput::done().with_note(format!(
            "{} variable(s) present, {} cluster",
            ctx.required_variables().len(),
            ctx.cluster_type()
        )))
    })
}

fn cluster_create(ctx: Arc<RunContext>) -> Stage {
    let preview = format!(
        "create cluster '{}' from {}",
        ctx.config.cluster.name,
        ctx.descriptor().display()
    );
    let retry = ctx.config.retry;
    Stage::new("cluster-create", move |_: &StageContext<'_>| {
        let provisioner = &ctx.platform.provisioner;
        if provisioner.exists()? {
            tracing::info!("cluster '{}' already exists", ctx.config.cluster.name);
            return Ok(StageOutput::done().with_note("already exists"));
        }
        provisioner.create()?;
        Ok(StageOutput::done().with_note("created"))
    })
    .dry_run_safe(preview)
    .with_retry(retry)
    .in_group(StageGroup::Cluster)
}

fn cluster_ready(ctx: Arc<RunContext>) -> Stage {
    let timeout = ctx.config.cluster.ready_timeout();
    let preview = format!("wait up to {}s for every node to be Ready", timeout.as_secs());
    Stage::new("cluster-ready", move |_: &StageContext<'_>| {
        let spec = WaitSpec::new("cluster nodes to be Ready", timeout)
            .with_poll_interval(ctx.config.waits.poll_interval());
        let elapsed = ctx
            .waiter()
            .wait(&spec, || {
                ctx.platform.cluster.nodes_ready().unwrap_or_else(|e| {
                    tracing::debug!("node readiness check failed: {e}");
                    false
                })
            })
            .into_result(&spec.description)?;
        Ok(StageOutput::done().with_note(format!("ready after {}s", elapsed.as_secs())))
    })
    .dry_run_safe(preview)
    .in_group(StageGroup::Cluster)
}

fn resource_allocation(ctx: Arc<RunContext>) -> Stage {
    let preview = format!("apply {} limits to every cluster node", ctx.cluster_type());
    Stage::new("resource-allocation", move |_: &StageContext<'_>| {
        let (nodes, discovered_via) = ctx.discover_nodes()?;
        let policy = ctx.allocation_policy();
        let plan = policy.plan(&nodes, &RoleClassifier::default());
        policy.apply(&plan, ctx.platform.runtime.as_ref())?;

        let summary = plan.summary(&ctx.host);
        for line in summary.to_string().lines() {
            tracing::info!("{line}");
        }
        if summary.overcommitted() {
            tracing::warn!("assigned limits exceed host capacity");
        }

        Ok(StageOutput::done()
            .with_note(format!("{} node(s) limited", plan.nodes.len()))
            .with_field("cluster", ctx.config.cluster.name.as_str())
            .with_field("cluster_type", ctx.cluster_type().to_string())
            .with_field("descriptor", ctx.descriptor().display().to_string())
            .with_field("nodes_discovered_via", discovered_via)
            .with_field("nodes", serde_json::to_value(&plan.nodes)?)
            .with_field("allocation", serde_json::to_value(&summary)?))
    })
    .dry_run_safe(preview)
    .with_artifact(paths::CLUSTER_SUMMARY)
    .in_group(StageGroup::Cluster)
}

fn component_stage(ctx: Arc<RunContext>, component: ComponentConfig) -> Stage {
    let name = format!("component:{}", component.name);
    let manifest = ctx.config.resolve(&ctx.root, &component.manifest);
    let preview = format!(
        "apply {} into namespace '{}'",
        manifest.display(),
        component.namespace
    );
    let abort = component.abort_on_failure;
    Stage::new(name, move |sc: &StageContext<'_>| {
        let cluster = &ctx.platform.cluster;
        cluster.ensure_namespace(&component.namespace)?;
        ctx.retry()
            .run(&ctx.config.retry, sc.stage, |_| {
                cluster.apply(&manifest, Some(component.namespace.as_str()))
            })
            .map_err(|e| e.into_error(sc.stage))?;

        let timeout = Duration::from_secs(
            component
                .timeout_secs
                .unwrap_or(ctx.config.waits.deployment_timeout_secs),
        );
        let waiter = ctx.waiter();
        for deployment in &component.deployments {
            let spec = WaitSpec::new(
                format!("deployment {}/{deployment}", component.namespace),
                timeout,
            )
            .with_poll_interval(ctx.config.waits.poll_interval());
            waiter
                .wait(&spec, || {
                    cluster
                        .deployment_ready(&component.namespace, deployment)
                        .unwrap_or(false)
                })
                .into_result(&spec.description)?;
        }
        Ok(StageOutput::done().with_note(format!(
            "{} deployment(s) ready",
            component.deployments.len()
        )))
    })
    .abort_on_failure(abort)
    .dry_run_safe(preview)
    .in_group(StageGroup::Platform)
}

fn seed_secrets(ctx: Arc<RunContext>) -> Stage {
    let preview = format!(
        "seed {} secret path(s) under mount '{}'",
        ctx.config.secrets.records.len(),
        ctx.config.secrets.mount
    );
    Stage::new("seed-secrets", move |_: &StageContext<'_>| {
        let seeder = SecretSeeder::new(ctx.platform.secrets.as_ref());
        let report = seeder.seed_templates(&ctx.config.secrets.records, &ctx.env)?;
        Ok(StageOutput::done()
            .with_note(format!("{} path(s) written", report.paths.len()))
            .with_field("mount", ctx.config.secrets.mount.as_str())
            .with_field("paths", serde_json::to_value(&report.paths)?))
    })
    .dry_run_safe(preview)
    .with_artifact(paths::SECRETS_SUMMARY)
    .in_group(StageGroup::Secrets)
}

fn networking(ctx: Arc<RunContext>) -> Stage {
    let net = &ctx.config.network;
    let preview = format!(
        "start '{}' and wait for {}/{} to get an address",
        net.tunnel_command.join(" "),
        net.gateway_namespace,
        net.gateway_service
    );
    Stage::new("networking", move |_: &StageContext<'_>| {
        let net = &ctx.config.network;
        if !net.enabled {
            return Ok(StageOutput::done().with_note("disabled in config"));
        }

        let handle = ctx.supervisor.ensure_singleton(
            TUNNEL_PROCESS,
            &net.tunnel_pattern,
            &net.tunnel_command,
            DEFAULT_GRACE,
        )?;

        let spec = WaitSpec::new(
            format!(
                "load balancer address for {}/{}",
                net.gateway_namespace, net.gateway_service
            ),
            Duration::from_secs(net.timeout_secs),
        )
        .with_poll_interval(ctx.config.waits.poll_interval());
        let mut address = None;
        let mut tunnel_exited = false;
        let outcome = ctx.waiter().wait(&spec, || {
            if !ctx.supervisor.is_alive(handle.pid) {
                tunnel_exited = true;
                return true;
            }
            address = ctx
                .platform
                .cluster
                .load_balancer_ip(&net.gateway_namespace, &net.gateway_service)
                .ok()
                .flatten();
            address.is_some()
        });
        if tunnel_exited {
            return Err(BootstrapError::Process(ctx.supervisor.exit_report(&handle)));
        }
        outcome.into_result(&spec.description)?;

        let address = address.unwrap_or_default();
        Ok(StageOutput::done()
            .with_note(format!("gateway at {address}"))
            .with_field("gateway", format!("{}/{}", net.gateway_namespace, net.gateway_service))
            .with_field("address", address.as_str())
            .with_field("tunnel_pid", handle.pid)
            .with_field("tunnel_command", Value::from(net.tunnel_command.clone())))
    })
    .tolerate_failure()
    .dry_run_safe(preview)
    .with_artifact(paths::NETWORK_SUMMARY)
    .in_group(StageGroup::Network)
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Build the stage list, execute it and persist the run summary.
pub fn execute(ctx: Arc<RunContext>, cancel: Arc<AtomicBool>) -> Result<RunSummary> {
    let state_dir = ctx.state_dir();
    ensure_dir(&state_dir)?;

    let mut recorder = RunSummaryRecorder::new(&state_dir, ctx.flags.dry_run);
    tracing::info!(
        "run {} ({}{})",
        recorder.run_id(),
        ctx.cluster_type(),
        if ctx.flags.dry_run { ", dry run" } else { "" }
    );

    let sequencer = StageSequencer::new(
        ctx.clock.clone(),
        SequencerOptions {
            dry_run: ctx.flags.dry_run,
            skip: ctx.flags.skip.clone(),
        },
    )
    .with_cancel(cancel);

    let outcome = sequencer.run(build_stages(&ctx), &mut recorder)?;
    recorder.finalize(outcome)
}

/// The stage list without running it.
pub fn describe_stages(ctx: &Arc<RunContext>) -> Vec<Value> {
    build_stages(ctx)
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "group": s.group.map(|g| g.as_str()),
                "abort_on_failure": s.abort_on_failure,
                "dry_run_safe": s.dry_run_safe,
            })
        })
        .collect()
}
