//! Seams to the external systems a run drives: the cluster API, the cluster
//! provisioner and the container runtime hosting the nodes.
//!
//! Every mutating call is create-or-update. The command-line adapters shell
//! out to `kubectl`, `k3d` and `docker`; tests substitute in-memory fakes.

use crate::allocation::{Limits, NodeInfo};
use crate::error::{BootstrapError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait ClusterApi: Send + Sync {
    /// Nodes with their live labels.
    fn nodes(&self) -> Result<Vec<NodeInfo>>;
    /// True when every node reports `Ready`.
    fn nodes_ready(&self) -> Result<bool>;
    fn ensure_namespace(&self, namespace: &str) -> Result<()>;
    fn apply(&self, manifest: &Path, namespace: Option<&str>) -> Result<()>;
    /// True when the deployment has all desired replicas available.
    fn deployment_ready(&self, namespace: &str, name: &str) -> Result<bool>;
    fn load_balancer_ip(&self, namespace: &str, service: &str) -> Result<Option<String>>;
}

pub trait ClusterProvisioner: Send + Sync {
    fn exists(&self) -> Result<bool>;
    fn create(&self) -> Result<()>;
    /// Node names as known to the provisioner; used when the cluster API is
    /// unreachable.
    fn node_names(&self) -> Result<Vec<String>>;
}

pub trait NodeRuntime: Send + Sync {
    /// Constrain a node's CPU and memory and disable swap. Idempotent.
    fn apply_limits(&self, node: &str, limits: &Limits) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Command helpers
// ---------------------------------------------------------------------------

/// Run `program args…` and return trimmed stdout.
pub fn run_command(program: &str, args: &[&str], env: &[(String, String)]) -> Result<String> {
    run_command_with_stdin(program, args, env, None)
}

pub fn run_command_with_stdin(
    program: &str,
    args: &[&str],
    env: &[(String, String)],
    stdin: Option<&str>,
) -> Result<String> {
    tracing::debug!("exec: {program} {}", args.join(" "));
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => BootstrapError::ToolNotFound(program.to_string()),
        _ => BootstrapError::external(program, e.to_string()),
    })?;

    // Fed from its own thread so a child that writes a lot before draining
    // stdin cannot block against us.
    let feeder = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_string();
            Some(std::thread::spawn(move || pipe.write_all(input.as_bytes())))
        }
        _ => None,
    };

    let output = child.wait_with_output()?;
    if let Some(Ok(Err(e))) = feeder.map(|f| f.join()) {
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            tracing::debug!("{program}: writing stdin failed: {e}");
        }
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output")
            .trim()
            .to_string();
        return Err(BootstrapError::external(
            format!("{program} {}", args.first().copied().unwrap_or_default()),
            format!("exit {}: {message}", output.status.code().unwrap_or(-1)),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// ---------------------------------------------------------------------------
// kubectl
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Kubectl {
    program: String,
    context: Option<String>,
}

impl Kubectl {
    pub fn new(context: Option<String>) -> Self {
        Self {
            program: "kubectl".to_string(),
            context,
        }
    }

    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 2);
        if let Some(ctx) = &self.context {
            full.extend(["--context", ctx.as_str()]);
        }
        full.extend_from_slice(args);
        run_command_with_stdin(&self.program, &full, &[], stdin)
    }
}

#[derive(Deserialize)]
struct NodeList {
    items: Vec<NodeItem>,
}

#[derive(Deserialize)]
struct NodeItem {
    metadata: ObjectMeta,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Deserialize)]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Default)]
struct NodeStatus {
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Deserialize)]
struct Deployment {
    #[serde(default)]
    spec: DeploymentSpec,
    #[serde(default)]
    status: DeploymentStatus,
}

#[derive(Deserialize, Default)]
struct DeploymentSpec {
    #[serde(default)]
    replicas: Option<u32>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatus {
    #[serde(default)]
    available_replicas: u32,
}

pub(crate) fn parse_nodes(json: &str) -> Result<Vec<NodeInfo>> {
    let list: NodeList = serde_json::from_str(json)?;
    Ok(list
        .items
        .into_iter()
        .map(|item| NodeInfo {
            name: item.metadata.name,
            labels: Some(item.metadata.labels),
        })
        .collect())
}

pub(crate) fn all_nodes_ready(json: &str) -> Result<bool> {
    let list: NodeList = serde_json::from_str(json)?;
    Ok(!list.items.is_empty()
        && list.items.iter().all(|n| {
            n.status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
        }))
}

pub(crate) fn deployment_available(json: &str) -> Result<bool> {
    let d: Deployment = serde_json::from_str(json)?;
    let desired = d.spec.replicas.unwrap_or(1);
    Ok(d.status.available_replicas >= desired)
}

impl ClusterApi for Kubectl {
    fn nodes(&self) -> Result<Vec<NodeInfo>> {
        parse_nodes(&self.run(&["get", "nodes", "-o", "json"], None)?)
    }

    fn nodes_ready(&self) -> Result<bool> {
        all_nodes_ready(&self.run(&["get", "nodes", "-o", "json"], None)?)
    }

    fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let manifest = format!("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {namespace}\n");
        self.run(&["apply", "-f", "-"], Some(&manifest))?;
        Ok(())
    }

    fn apply(&self, manifest: &Path, namespace: Option<&str>) -> Result<()> {
        let path = manifest.to_string_lossy();
        let mut args = vec!["apply", "-f", &*path];
        if manifest.is_dir() {
            args.push("--recursive");
        }
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }
        self.run(&args, None)?;
        Ok(())
    }

    fn deployment_ready(&self, namespace: &str, name: &str) -> Result<bool> {
        let json = self.run(
            &["get", "deployment", name, "-n", namespace, "-o", "json"],
            None,
        )?;
        deployment_available(&json)
    }

    fn load_balancer_ip(&self, namespace: &str, service: &str) -> Result<Option<String>> {
        let ip = self.run(
            &[
                "get",
                "service",
                service,
                "-n",
                namespace,
                "-o",
                "jsonpath={.status.loadBalancer.ingress[0].ip}",
            ],
            None,
        )?;
        Ok(Some(ip).filter(|s| !s.is_empty()))
    }
}

// ---------------------------------------------------------------------------
// k3d
// ---------------------------------------------------------------------------

/// Creates the cluster from a topology descriptor. Extra environment (e.g. the
/// disk-size override) is exported so the descriptor can reference it.
#[derive(Debug, Clone)]
pub struct K3d {
    pub cluster_name: String,
    pub descriptor: PathBuf,
    pub env: Vec<(String, String)>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct K3dNode {
    name: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    runtime_labels: BTreeMap<String, String>,
}

pub(crate) fn parse_k3d_nodes(json: &str, cluster: &str) -> Result<Vec<String>> {
    let nodes: Vec<K3dNode> = serde_json::from_str(json)?;
    Ok(nodes
        .into_iter()
        .filter(|n| n.runtime_labels.get("k3d.cluster").map(String::as_str) == Some(cluster))
        .filter(|n| n.role == "server" || n.role == "agent")
        .map(|n| n.name)
        .collect())
}

impl ClusterProvisioner for K3d {
    fn exists(&self) -> Result<bool> {
        match run_command("k3d", &["cluster", "get", &self.cluster_name], &[]) {
            Ok(_) => Ok(true),
            Err(BootstrapError::External { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn create(&self) -> Result<()> {
        let descriptor = self.descriptor.to_string_lossy();
        run_command(
            "k3d",
            &["cluster", "create", &self.cluster_name, "--config", &descriptor],
            &self.env,
        )?;
        Ok(())
    }

    fn node_names(&self) -> Result<Vec<String>> {
        let json = run_command("k3d", &["node", "list", "-o", "json"], &[])?;
        parse_k3d_nodes(&json, &self.cluster_name)
    }
}

// ---------------------------------------------------------------------------
// docker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct DockerRuntime;

pub(crate) fn docker_update_args(node: &str, limits: &Limits) -> Vec<String> {
    let memory = limits.memory.to_string();
    vec![
        "update".to_string(),
        "--cpus".to_string(),
        limits.cpus.to_string(),
        "--memory".to_string(),
        memory.clone(),
        // Equal memory and memory+swap disables swap for the container.
        "--memory-swap".to_string(),
        memory,
        node.to_string(),
    ]
}

impl NodeRuntime for DockerRuntime {
    fn apply_limits(&self, node: &str, limits: &Limits) -> Result<()> {
        let args = docker_update_args(node, limits);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_command("docker", &args, &[])?;
        Ok(())
    }
}
