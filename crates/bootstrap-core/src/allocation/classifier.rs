use super::NodeRole;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// NodeInfo
// ---------------------------------------------------------------------------

/// What is known about a node at classification time.
///
/// `labels` is `None` when the cluster API could not be reached; label-based
/// rules then yield nothing and name-based rules take over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

impl NodeInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: None,
        }
    }

    pub fn with_labels<I, K, V>(name: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            labels: Some(
                labels
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// RoleRule
// ---------------------------------------------------------------------------

pub const ROLE_LABEL: &str = "platform.bootstrap/role";
pub const NODE_ROLE_PREFIX: &str = "node-role.kubernetes.io/";

/// A fn-pointer classification strategy. Pure: the same node always yields
/// the same answer.
pub struct RoleRule {
    pub id: &'static str,
    pub classify: fn(&NodeInfo) -> Option<NodeRole>,
}

/// Reads live node labels: an explicit role label first, then the standard
/// `node-role.kubernetes.io/*` markers, then GPU feature labels.
pub fn role_from_labels(node: &NodeInfo) -> Option<NodeRole> {
    let labels = node.labels.as_ref()?;

    if let Some(role) = labels.get(ROLE_LABEL).and_then(|v| v.parse().ok()) {
        if role != NodeRole::Fallback {
            return Some(role);
        }
    }

    let has_role = |role: &str| labels.contains_key(&format!("{NODE_ROLE_PREFIX}{role}"));
    if has_role("control-plane") || has_role("master") {
        return Some(NodeRole::ControlPlane);
    }
    if has_role("gpu") || labels.get("nvidia.com/gpu.present").map(String::as_str) == Some("true")
    {
        return Some(NodeRole::GpuWorker);
    }
    if has_role("worker") || has_role("application") {
        return Some(NodeRole::Application);
    }
    None
}

/// Matches well-known substrings of the node's display name.
pub fn role_from_name(node: &NodeInfo) -> Option<NodeRole> {
    let name = node.name.to_ascii_lowercase();
    if name.contains("gpu") {
        Some(NodeRole::GpuWorker)
    } else if ["server", "control", "master"]
        .iter()
        .any(|p| name.contains(p))
    {
        Some(NodeRole::ControlPlane)
    } else if ["agent", "worker", "app"].iter().any(|p| name.contains(p)) {
        Some(NodeRole::Application)
    } else {
        None
    }
}

pub fn default_rules() -> Vec<RoleRule> {
    vec![
        RoleRule {
            id: "label",
            classify: role_from_labels,
        },
        RoleRule {
            id: "name",
            classify: role_from_name,
        },
    ]
}

// ---------------------------------------------------------------------------
// RoleClassifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub role: NodeRole,
    /// Id of the rule that decided, or `"default"`.
    pub source: &'static str,
}

pub struct RoleClassifier {
    rules: Vec<RoleRule>,
}

impl RoleClassifier {
    pub fn new(rules: Vec<RoleRule>) -> Self {
        Self { rules }
    }

    pub fn classify(&self, node: &NodeInfo) -> Classification {
        for rule in &self.rules {
            if let Some(role) = (rule.classify)(node) {
                return Classification {
                    role,
                    source: rule.id,
                };
            }
        }
        Classification {
            role: NodeRole::Unknown,
            source: "default",
        }
    }
}

impl Default for RoleClassifier {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_win_over_name() {
        let node = NodeInfo::with_labels(
            "k3d-dev-agent-0",
            [("node-role.kubernetes.io/control-plane", "true")],
        );
        let c = RoleClassifier::default().classify(&node);
        assert_eq!(c.role, NodeRole::ControlPlane);
        assert_eq!(c.source, "label");
    }

    #[test]
    fn explicit_role_label() {
        let node = NodeInfo::with_labels("n1", [(ROLE_LABEL, "gpu-worker")]);
        assert_eq!(role_from_labels(&node), Some(NodeRole::GpuWorker));
    }

    #[test]
    fn gpu_feature_label() {
        let node = NodeInfo::with_labels("n1", [("nvidia.com/gpu.present", "true")]);
        assert_eq!(role_from_labels(&node), Some(NodeRole::GpuWorker));
    }

    #[test]
    fn unreachable_node_falls_back_to_name() {
        let c = RoleClassifier::default().classify(&NodeInfo::named("k3d-dev-server-0"));
        assert_eq!(c.role, NodeRole::ControlPlane);
        assert_eq!(c.source, "name");
    }

    #[test]
    fn name_patterns() {
        for (name, role) in [
            ("k3d-ml-gpu-agent-0", Some(NodeRole::GpuWorker)),
            ("kind-control-plane", Some(NodeRole::ControlPlane)),
            ("k3d-dev-agent-1", Some(NodeRole::Application)),
            ("worker-2", Some(NodeRole::Application)),
            ("node-7", None),
        ] {
            assert_eq!(role_from_name(&NodeInfo::named(name)), role, "{name}");
        }
    }

    #[test]
    fn unmatched_node_is_unknown() {
        let node = NodeInfo::with_labels("node-7", [("kubernetes.io/os", "linux")]);
        let c = RoleClassifier::default().classify(&node);
        assert_eq!(c.role, NodeRole::Unknown);
        assert_eq!(c.source, "default");
    }
}
