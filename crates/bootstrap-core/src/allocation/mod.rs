//! Per-node CPU/memory limits derived from cluster topology and node role.
//!
//! Lookup order for `(cluster_type, role)`:
//!   1. the exact entry in the allocation table
//!   2. the cluster type's `fallback` entry (`default` is accepted as an alias)
//!   3. [`LAST_RESORT`]
//!
//! The chain always ends in a concrete, positive value.

pub mod classifier;
pub mod quantity;
pub mod topology;

pub use classifier::{Classification, NodeInfo, RoleClassifier, RoleRule};
pub use quantity::MemoryQuantity;
pub use topology::cluster_type_from_descriptor;

use crate::error::{BootstrapError, Result};
use crate::platform::NodeRuntime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// ClusterType / NodeRole
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    SingleNode,
    MultiNode,
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterType::SingleNode => write!(f, "single_node"),
            ClusterType::MultiNode => write!(f, "multi_node"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Application,
    GpuWorker,
    Unknown,
    Fallback,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Application => "application",
            NodeRole::GpuWorker => "gpu-worker",
            NodeRole::Unknown => "unknown",
            NodeRole::Fallback => "fallback",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "control-plane" => Ok(NodeRole::ControlPlane),
            "application" => Ok(NodeRole::Application),
            "gpu-worker" => Ok(NodeRole::GpuWorker),
            "unknown" => Ok(NodeRole::Unknown),
            "fallback" | "default" => Ok(NodeRole::Fallback),
            other => Err(BootstrapError::Validation(vec![format!(
                "unknown node role '{other}'"
            )])),
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub cpus: f64,
    pub memory: MemoryQuantity,
}

impl Limits {
    pub fn new(cpus: f64, memory: MemoryQuantity) -> Self {
        Self { cpus, memory }
    }

    pub fn is_valid(&self) -> bool {
        self.cpus.is_finite() && self.cpus > 0.0 && self.memory.bytes() > 0
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cpu / {}", self.cpus, self.memory)
    }
}

/// Used when neither the role nor the cluster type's fallback is defined.
pub const LAST_RESORT: Limits = Limits {
    cpus: 2.0,
    memory: MemoryQuantity::from_bytes(4 * 1024 * 1024 * 1024),
};

const FALLBACK_KEYS: [&str; 2] = ["fallback", "default"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitSource {
    Exact,
    Fallback,
    LastResort,
}

impl LimitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitSource::Exact => "exact",
            LimitSource::Fallback => "fallback",
            LimitSource::LastResort => "last_resort",
        }
    }
}

// ---------------------------------------------------------------------------
// AllocationTable
// ---------------------------------------------------------------------------

/// Declarative `(cluster type, role) → limits` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AllocationTable {
    #[serde(default)]
    pub single_node: BTreeMap<String, Limits>,
    #[serde(default)]
    pub multi_node: BTreeMap<String, Limits>,
}

impl AllocationTable {
    /// The table used when the config file has no `allocation` section.
    pub fn builtin() -> Self {
        let gib = MemoryQuantity::from_gib;
        let single_node = BTreeMap::from([("fallback".to_string(), Limits::new(6.0, gib(16)))]);
        let multi_node = BTreeMap::from([
            ("control-plane".to_string(), Limits::new(4.0, gib(8))),
            ("application".to_string(), Limits::new(4.0, gib(12))),
            ("gpu-worker".to_string(), Limits::new(8.0, gib(24))),
            ("fallback".to_string(), Limits::new(2.0, gib(6))),
        ]);
        Self {
            single_node,
            multi_node,
        }
    }

    fn entries(&self, cluster_type: ClusterType) -> &BTreeMap<String, Limits> {
        match cluster_type {
            ClusterType::SingleNode => &self.single_node,
            ClusterType::MultiNode => &self.multi_node,
        }
    }

    /// Resolve limits through the fallback chain. Never fails; entries with
    /// non-positive values are ignored.
    pub fn lookup(&self, cluster_type: ClusterType, role: NodeRole) -> (Limits, LimitSource) {
        let entries = self.entries(cluster_type);
        let valid = |key: &str| entries.get(key).copied().filter(Limits::is_valid);

        if let Some(limits) = valid(role.as_str()) {
            return (limits, LimitSource::Exact);
        }
        if let Some(limits) = FALLBACK_KEYS.iter().find_map(|k| valid(*k)) {
            return (limits, LimitSource::Fallback);
        }
        (LAST_RESORT, LimitSource::LastResort)
    }

    pub fn limits_for(&self, cluster_type: ClusterType, role: NodeRole) -> Limits {
        self.lookup(cluster_type, role).0
    }

    /// Problems that would make entries unusable. Empty when the table is sound.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (cluster_type, entries) in [
            (ClusterType::SingleNode, &self.single_node),
            (ClusterType::MultiNode, &self.multi_node),
        ] {
            for (key, limits) in entries {
                if key.parse::<NodeRole>().is_err() {
                    problems.push(format!("allocation.{cluster_type}.{key}: unknown role"));
                }
                if !limits.is_valid() {
                    problems.push(format!(
                        "allocation.{cluster_type}.{key}: cpus must be positive (got {})",
                        limits.cpus
                    ));
                }
            }
        }
        problems
    }
}

// ---------------------------------------------------------------------------
// Overrides / policy
// ---------------------------------------------------------------------------

/// Operator-supplied values that replace table lookups for every node.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AllocationOverrides {
    pub cpus: Option<f64>,
    pub memory: Option<MemoryQuantity>,
}

impl AllocationOverrides {
    pub fn validate(&self) -> Result<()> {
        match self.cpus {
            Some(c) if !(c.is_finite() && c > 0.0) => Err(BootstrapError::InvalidCpu(c)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeAllocation {
    pub node: String,
    pub role: NodeRole,
    pub classified_by: &'static str,
    pub source: LimitSource,
    pub limits: Limits,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationPlan {
    pub cluster_type: ClusterType,
    pub nodes: Vec<NodeAllocation>,
}

impl AllocationPlan {
    pub fn total_cpus(&self) -> f64 {
        self.nodes.iter().map(|n| n.limits.cpus).sum()
    }

    pub fn total_memory(&self) -> MemoryQuantity {
        self.nodes.iter().map(|n| n.limits.memory).sum()
    }

    pub fn summary(&self, host: &HostCapacity) -> AllocationSummary {
        let assigned_cpus = self.total_cpus();
        let assigned_memory = self.total_memory();
        let cpu_percent = percent(assigned_cpus, host.cpus);
        let memory_percent = host
            .memory
            .and_then(|m| percent(assigned_memory.bytes() as f64, m.bytes() as f64));
        AllocationSummary {
            cluster_type: self.cluster_type,
            node_count: self.nodes.len(),
            host_cpus: host.cpus,
            host_memory: host.memory,
            assigned_cpus,
            assigned_memory,
            cpu_percent,
            memory_percent,
        }
    }
}

fn percent(part: f64, whole: f64) -> Option<f64> {
    (whole > 0.0).then(|| part / whole * 100.0)
}

pub struct AllocationPolicy {
    cluster_type: ClusterType,
    table: AllocationTable,
    overrides: AllocationOverrides,
}

impl AllocationPolicy {
    pub fn new(
        cluster_type: ClusterType,
        table: AllocationTable,
        overrides: AllocationOverrides,
    ) -> Self {
        Self {
            cluster_type,
            table,
            overrides,
        }
    }

    pub fn cluster_type(&self) -> ClusterType {
        self.cluster_type
    }

    pub fn limits_for(&self, role: NodeRole) -> (Limits, LimitSource) {
        let (mut limits, source) = self.table.lookup(self.cluster_type, role);
        if let Some(cpus) = self.overrides.cpus.filter(|c| c.is_finite() && *c > 0.0) {
            limits.cpus = cpus;
        }
        if let Some(memory) = self.overrides.memory {
            limits.memory = memory;
        }
        (limits, source)
    }

    pub fn plan(&self, nodes: &[NodeInfo], classifier: &RoleClassifier) -> AllocationPlan {
        let nodes = nodes
            .iter()
            .map(|node| {
                let c = classifier.classify(node);
                let (limits, source) = self.limits_for(c.role);
                NodeAllocation {
                    node: node.name.clone(),
                    role: c.role,
                    classified_by: c.source,
                    source,
                    limits,
                }
            })
            .collect();
        AllocationPlan {
            cluster_type: self.cluster_type,
            nodes,
        }
    }

    /// Push every node's limits to the runtime. Re-applying the same plan is
    /// a no-op from the caller's point of view.
    pub fn apply(&self, plan: &AllocationPlan, runtime: &dyn NodeRuntime) -> Result<()> {
        for node in &plan.nodes {
            tracing::info!(
                "limiting {} ({}) to {}",
                node.node,
                node.role,
                node.limits
            );
            runtime.apply_limits(&node.node, &node.limits)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Host capacity / summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HostCapacity {
    pub cpus: f64,
    pub memory: Option<MemoryQuantity>,
}

impl HostCapacity {
    /// Read CPU count and `MemTotal` from the running host.
    pub fn detect() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0);
        let memory = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo_total(&s));
        Self { cpus, memory }
    }
}

/// Extract `MemTotal` (reported in kB) from `/proc/meminfo` content.
pub fn parse_meminfo_total(meminfo: &str) -> Option<MemoryQuantity> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(MemoryQuantity::from_bytes(kb * 1024))
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationSummary {
    pub cluster_type: ClusterType,
    pub node_count: usize,
    pub host_cpus: f64,
    pub host_memory: Option<MemoryQuantity>,
    pub assigned_cpus: f64,
    pub assigned_memory: MemoryQuantity,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
}

impl AllocationSummary {
    pub fn overcommitted(&self) -> bool {
        self.cpu_percent.is_some_and(|p| p > 100.0)
            || self.memory_percent.is_some_and(|p| p > 100.0)
    }
}

impl fmt::Display for AllocationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = |p: Option<f64>| p.map_or("n/a".to_string(), |p| format!("{p:.1}%"));
        let host_memory = self
            .host_memory
            .map_or("unknown".to_string(), |m| format!("{:.1} GiB", m.as_gib()));
        writeln!(
            f,
            "Topology:  {} ({} node{})",
            self.cluster_type,
            self.node_count,
            if self.node_count == 1 { "" } else { "s" }
        )?;
        writeln!(f, "Host:      {} cpu, {host_memory}", self.host_cpus)?;
        write!(
            f,
            "Assigned:  {} cpu ({}), {:.1} GiB ({})",
            self.assigned_cpus,
            pct(self.cpu_percent),
            self.assigned_memory.as_gib(),
            pct(self.memory_percent)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn gib(n: u64) -> MemoryQuantity {
        MemoryQuantity::from_gib(n)
    }

    #[test]
    fn single_node_default_applies_to_any_role() {
        let table: AllocationTable = serde_yaml::from_str(
            "single_node:\n  default: { cpus: 8, memory: 24g }\n",
        )
        .unwrap();
        for role in [
            NodeRole::ControlPlane,
            NodeRole::Application,
            NodeRole::GpuWorker,
            NodeRole::Unknown,
            NodeRole::Fallback,
        ] {
            assert_eq!(
                table.limits_for(ClusterType::SingleNode, role),
                Limits::new(8.0, gib(24))
            );
        }
    }

    #[test]
    fn multi_node_undefined_role_uses_fallback() {
        let table: AllocationTable = serde_yaml::from_str(
            "multi_node:\n  control-plane: { cpus: 4, memory: 8g }\n  fallback: { cpus: 2, memory: 6g }\n",
        )
        .unwrap();
        assert_eq!(
            table.lookup(ClusterType::MultiNode, NodeRole::GpuWorker),
            (Limits::new(2.0, gib(6)), LimitSource::Fallback)
        );
        assert_eq!(
            table.lookup(ClusterType::MultiNode, NodeRole::ControlPlane),
            (Limits::new(4.0, gib(8)), LimitSource::Exact)
        );
    }

    #[test]
    fn empty_table_yields_last_resort_for_every_pair() {
        let table = AllocationTable::default();
        for ct in [ClusterType::SingleNode, ClusterType::MultiNode] {
            for role in [NodeRole::ControlPlane, NodeRole::Unknown, NodeRole::Fallback] {
                let (limits, source) = table.lookup(ct, role);
                assert_eq!(source, LimitSource::LastResort);
                assert!(limits.is_valid());
            }
        }
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let mut table = AllocationTable::default();
        table
            .multi_node
            .insert("application".into(), Limits::new(0.0, gib(4)));
        table
            .multi_node
            .insert("fallback".into(), Limits::new(1.0, gib(2)));
        assert_eq!(
            table.lookup(ClusterType::MultiNode, NodeRole::Application).1,
            LimitSource::Fallback
        );
        assert_eq!(table.validate().len(), 1);
    }

    #[test]
    fn validate_flags_unknown_role_keys() {
        let mut table = AllocationTable::builtin();
        table
            .single_node
            .insert("database".into(), Limits::new(1.0, gib(1)));
        let problems = table.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("database"));
    }

    #[test]
    fn overrides_replace_table_values() {
        let policy = AllocationPolicy::new(
            ClusterType::MultiNode,
            AllocationTable::builtin(),
            AllocationOverrides {
                cpus: Some(3.0),
                memory: None,
            },
        );
        let (limits, _) = policy.limits_for(NodeRole::ControlPlane);
        assert_eq!(limits, Limits::new(3.0, gib(8)));
    }

    #[test]
    fn plan_and_summary() {
        let policy = AllocationPolicy::new(
            ClusterType::MultiNode,
            AllocationTable::builtin(),
            AllocationOverrides::default(),
        );
        let nodes = vec![
            NodeInfo::named("k3d-lab-server-0"),
            NodeInfo::named("k3d-lab-agent-0"),
            NodeInfo::named("mystery"),
        ];
        let plan = policy.plan(&nodes, &RoleClassifier::default());
        let roles: Vec<_> = plan.nodes.iter().map(|n| n.role).collect();
        assert_eq!(
            roles,
            vec![
                NodeRole::ControlPlane,
                NodeRole::Application,
                NodeRole::Unknown
            ]
        );
        assert_eq!(plan.total_cpus(), 10.0);
        assert_eq!(plan.total_memory(), gib(26));

        let summary = plan.summary(&HostCapacity {
            cpus: 20.0,
            memory: Some(gib(52)),
        });
        assert_eq!(summary.cpu_percent, Some(50.0));
        assert_eq!(summary.memory_percent, Some(50.0));
        assert!(!summary.overcommitted());
        assert!(summary.to_string().contains("50.0%"));
    }

    #[test]
    fn summary_without_host_memory() {
        let plan = AllocationPlan {
            cluster_type: ClusterType::SingleNode,
            nodes: vec![],
        };
        let summary = plan.summary(&HostCapacity {
            cpus: 0.0,
            memory: None,
        });
        assert_eq!(summary.cpu_percent, None);
        assert!(summary.to_string().contains("n/a"));
    }

    #[test]
    fn meminfo_parsing() {
        let meminfo = "MemTotal:       16384000 kB\nMemFree:  100 kB\n";
        assert_eq!(
            parse_meminfo_total(meminfo),
            Some(MemoryQuantity::from_bytes(16_384_000 * 1024))
        );
        assert_eq!(parse_meminfo_total("garbage"), None);
    }

    struct RecordingRuntime(Mutex<Vec<(String, Limits)>>);

    impl NodeRuntime for RecordingRuntime {
        fn apply_limits(&self, node: &str, limits: &Limits) -> Result<()> {
            self.0.lock().unwrap().push((node.to_string(), *limits));
            Ok(())
        }
    }

    #[test]
    fn apply_pushes_each_node() {
        let policy = AllocationPolicy::new(
            ClusterType::SingleNode,
            AllocationTable::builtin(),
            AllocationOverrides::default(),
        );
        let plan = policy.plan(&[NodeInfo::named("k3d-dev-server-0")], &RoleClassifier::default());
        let runtime = RecordingRuntime(Mutex::new(vec![]));
        policy.apply(&plan, &runtime).unwrap();
        policy.apply(&plan, &runtime).unwrap();
        let calls = runtime.0.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
        assert_eq!(calls[0].1, Limits::new(6.0, gib(16)));
    }
}
