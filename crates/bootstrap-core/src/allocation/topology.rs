use super::ClusterType;
use std::path::Path;

const SINGLE_NODE_MARKERS: &[&str] = &["single", "singlenode", "dev", "local", "minimal"];
const MULTI_NODE_MARKERS: &[&str] = &["multi", "multinode", "ha", "prod", "production", "gpu"];

/// Classify the cluster from a topology descriptor's file name.
///
/// The stem is split on non-alphanumerics and the first recognized token wins
/// (`k3d-multi.yaml`, `cluster-ha.yml`, `single-node.yaml`). Anything without a
/// recognized token is `SingleNode`.
pub fn cluster_type_from_descriptor(descriptor: &str) -> ClusterType {
    let stem = Path::new(descriptor)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(descriptor)
        .to_ascii_lowercase();

    for token in stem.split(|c: char| !c.is_ascii_alphanumeric()) {
        if SINGLE_NODE_MARKERS.contains(&token) {
            return ClusterType::SingleNode;
        }
        if MULTI_NODE_MARKERS.contains(&token) {
            return ClusterType::MultiNode;
        }
    }
    ClusterType::SingleNode
}
