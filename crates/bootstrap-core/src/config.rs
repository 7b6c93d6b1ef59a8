use crate::allocation::{AllocationTable, NodeRole};
use crate::error::{BootstrapError, Result};
use crate::paths;
use crate::retry::RetrySpec;
use crate::secrets::{SecretTemplate, ValueSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "BOOTSTRAP_CONFIG";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ClusterConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    /// Topology descriptor handed to the provisioner. Its filename also
    /// decides single vs multi node.
    #[serde(default = "default_descriptor")]
    pub descriptor: PathBuf,
    /// kubectl context; `k3d-<name>` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

fn default_cluster_name() -> String {
    "platform".to_string()
}

fn default_descriptor() -> PathBuf {
    PathBuf::from("topology/single-node.yaml")
}

fn default_ready_timeout() -> u64 {
    300
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            descriptor: default_descriptor(),
            context: None,
            ready_timeout_secs: default_ready_timeout(),
        }
    }
}

impl ClusterConfig {
    pub fn kube_context(&self) -> String {
        self.context
            .clone()
            .unwrap_or_else(|| format!("k3d-{}", self.name))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// WaitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_deployment_timeout")]
    pub deployment_timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_deployment_timeout() -> u64 {
    600
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            deployment_timeout_secs: default_deployment_timeout(),
        }
    }
}

impl WaitConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// ComponentConfig
// ---------------------------------------------------------------------------

/// One platform component: a manifest (file or directory) applied into a
/// namespace, then its deployments awaited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    pub manifest: PathBuf,
    pub namespace: String,
    #[serde(default)]
    pub deployments: Vec<String>,
    #[serde(default = "default_true")]
    pub abort_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_components() -> Vec<ComponentConfig> {
    let component = |name: &str, namespace: &str, deployments: &[&str], abort: bool| {
        ComponentConfig {
            name: name.to_string(),
            manifest: PathBuf::from(format!("platform/{name}")),
            namespace: namespace.to_string(),
            deployments: deployments.iter().map(|d| d.to_string()).collect(),
            abort_on_failure: abort,
            timeout_secs: None,
        }
    };
    vec![
        component("gitops", "argocd", &["argocd-server", "argocd-repo-server"], true),
        component("vault", "vault", &["vault-agent-injector"], true),
        component("mesh", "istio-system", &["istiod"], true),
        component("observability", "monitoring", &["grafana", "prometheus-operator"], false),
        component("ml", "ml-platform", &["model-registry"], false),
    ]
}

// ---------------------------------------------------------------------------
// SecretsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_mount")]
    pub mount: String,
    #[serde(default = "default_address_env")]
    pub address_env: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_records")]
    pub records: Vec<SecretTemplate>,
}

fn default_mount() -> String {
    "secret".to_string()
}

fn default_address_env() -> String {
    "VAULT_ADDR".to_string()
}

fn default_token_env() -> String {
    "VAULT_TOKEN".to_string()
}

fn default_records() -> Vec<SecretTemplate> {
    let env = |v: &str| ValueSource::Env(v.to_string());
    vec![
        SecretTemplate {
            path: "gitops/repository".to_string(),
            fields: BTreeMap::from([
                ("url".to_string(), env("GITOPS_REPO_URL")),
                ("username".to_string(), env("GITOPS_REPO_USERNAME")),
                ("password".to_string(), env("GITOPS_REPO_TOKEN")),
            ]),
        },
        SecretTemplate {
            path: "observability/grafana".to_string(),
            fields: BTreeMap::from([
                ("admin-user".to_string(), ValueSource::Literal("admin".to_string())),
                ("admin-password".to_string(), ValueSource::Generated(24)),
            ]),
        },
    ]
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            mount: default_mount(),
            address_env: default_address_env(),
            token_env: default_token_env(),
            records: default_records(),
        }
    }
}

// ---------------------------------------------------------------------------
// NetworkConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Long-running helper keeping the gateway reachable from the host.
    #[serde(default = "default_tunnel_command")]
    pub tunnel_command: Vec<String>,
    /// Substring identifying stray tunnel processes in `/proc/*/cmdline`.
    #[serde(default = "default_tunnel_pattern")]
    pub tunnel_pattern: String,
    #[serde(default = "default_gateway_namespace")]
    pub gateway_namespace: String,
    #[serde(default = "default_gateway_service")]
    pub gateway_service: String,
    #[serde(default = "default_network_timeout")]
    pub timeout_secs: u64,
}

fn default_tunnel_command() -> Vec<String> {
    [
        "kubectl",
        "port-forward",
        "-n",
        "istio-system",
        "svc/istio-ingressgateway",
        "8080:80",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_tunnel_pattern() -> String {
    "port-forward -n istio-system svc/istio-ingressgateway".to_string()
}

fn default_gateway_namespace() -> String {
    "istio-system".to_string()
}

fn default_gateway_service() -> String {
    "istio-ingressgateway".to_string()
}

fn default_network_timeout() -> u64 {
    120
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tunnel_command: default_tunnel_command(),
            tunnel_pattern: default_tunnel_pattern(),
            gateway_namespace: default_gateway_namespace(),
            gateway_service: default_gateway_service(),
            timeout_secs: default_network_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// BootstrapConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Relative paths resolve against the project root.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default = "AllocationTable::builtin")]
    pub allocation: AllocationTable,
    #[serde(default)]
    pub waits: WaitConfig,
    #[serde(default)]
    pub retry: RetrySpec,
    /// Variables that must be set before anything runs, in addition to those
    /// referenced by secret records.
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default = "default_components")]
    pub components: Vec<ComponentConfig>,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(paths::STATE_DIR)
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            cluster: ClusterConfig::default(),
            allocation: AllocationTable::builtin(),
            waits: WaitConfig::default(),
            retry: RetrySpec::default(),
            required_env: Vec::new(),
            components: default_components(),
            secrets: SecretsConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// Where the loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum ConfigSource {
    Explicit(PathBuf),
    Project(PathBuf),
    Builtin,
}

impl BootstrapConfig {
    /// Load with precedence: `explicit` (flag or `BOOTSTRAP_CONFIG`, which
    /// must exist) → `<root>/bootstrap.yaml` → built-in defaults.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<(Self, ConfigSource)> {
        if let Some(path) = explicit {
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                root.join(path)
            };
            if !path.exists() {
                return Err(BootstrapError::ConfigNotFound(path.display().to_string()));
            }
            return Ok((Self::from_file(&path)?, ConfigSource::Explicit(path)));
        }

        let project = paths::config_path(root);
        if project.exists() {
            return Ok((Self::from_file(&project)?, ConfigSource::Project(project)));
        }
        Ok((Self::default(), ConfigSource::Builtin))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        // An empty file deserializes as unit; treat it as all defaults.
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn state_dir(&self, root: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            root.join(&self.state_dir)
        }
    }

    pub fn resolve(&self, root: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        }
    }

    /// Every variable a run needs: `required_env` plus those referenced by
    /// secret records, deduplicated in declaration order.
    pub fn required_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let referenced = self
            .secrets
            .records
            .iter()
            .flat_map(|r| r.env_vars().map(str::to_string));
        for name in self.required_env.iter().cloned().chain(referenced) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let error = |message: String| ConfigWarning {
            level: WarnLevel::Error,
            message,
        };
        let warning = |message: String| ConfigWarning {
            level: WarnLevel::Warning,
            message,
        };

        if self.cluster.name.trim().is_empty() {
            warnings.push(error("cluster.name is empty".to_string()));
        }

        for problem in self.allocation.validate() {
            warnings.push(error(problem));
        }
        for (label, entries) in [
            ("single_node", &self.allocation.single_node),
            ("multi_node", &self.allocation.multi_node),
        ] {
            let has_fallback = entries.contains_key(NodeRole::Fallback.as_str())
                || entries.contains_key("default");
            if !has_fallback {
                warnings.push(warning(format!(
                    "allocation.{label} has no fallback entry; unmatched roles use the last-resort limits"
                )));
            }
        }

        if self.waits.poll_interval_secs == 0 {
            warnings.push(error("waits.poll_interval_secs must be at least 1".to_string()));
        }
        if self.retry.max_attempts > 10 {
            warnings.push(warning(format!(
                "retry.max_attempts={} (>10 is unusual)",
                self.retry.max_attempts
            )));
        }

        let mut seen = Vec::new();
        for c in &self.components {
            if seen.contains(&c.name) {
                warnings.push(error(format!("duplicate component '{}'", c.name)));
            }
            seen.push(c.name.clone());
            if paths::validate_name(&c.name).is_err() {
                warnings.push(error(format!("component name '{}' is not a valid name", c.name)));
            }
            if c.namespace.trim().is_empty() {
                warnings.push(error(format!("component '{}' has an empty namespace", c.name)));
            }
        }

        for record in &self.secrets.records {
            if record.fields.is_empty() {
                warnings.push(warning(format!("secret '{}' has no fields", record.path)));
            }
        }

        if self.network.enabled {
            if self.network.tunnel_command.is_empty() {
                warnings.push(error("network.tunnel_command is empty".to_string()));
            }
            if self.network.tunnel_pattern.trim().is_empty() {
                warnings.push(error(
                    "network.tunnel_pattern is empty; it would match every process".to_string(),
                ));
            }
        }

        warnings
    }

    /// Errors from [`validate`](Self::validate) as one validation failure.
    pub fn check(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BootstrapError::Validation(errors))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{ClusterType, MemoryQuantity};
    use tempfile::TempDir;

    #[test]
    fn default_config_roundtrip() {
        let cfg = BootstrapConfig::default();
        let yaml = cfg.to_yaml().unwrap();
        let parsed = BootstrapConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.cluster.name, "platform");
        assert_eq!(parsed.allocation, AllocationTable::builtin());
        assert_eq!(parsed.components, cfg.components);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg = BootstrapConfig::from_yaml("cluster:\n  name: dev\n").unwrap();
        assert_eq!(cfg.cluster.name, "dev");
        assert_eq!(cfg.cluster.kube_context(), "k3d-dev");
        assert_eq!(cfg.waits.poll_interval_secs, 5);
        assert_eq!(cfg.retry, RetrySpec::default());
        assert_eq!(cfg.components.len(), 5);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = BootstrapConfig::from_yaml("  \n").unwrap();
        assert_eq!(cfg.cluster.name, "platform");
    }

    #[test]
    fn allocation_section_replaces_builtin_table() {
        let yaml = "allocation:\n  single_node:\n    default: { cpus: 3, memory: 10g }\n";
        let cfg = BootstrapConfig::from_yaml(yaml).unwrap();
        let limits = cfg
            .allocation
            .limits_for(ClusterType::SingleNode, NodeRole::Unknown);
        assert_eq!(limits.cpus, 3.0);
        assert_eq!(limits.memory, MemoryQuantity::from_gib(10));
        assert!(cfg.allocation.multi_node.is_empty());
    }

    #[test]
    fn precedence_explicit_then_project_then_builtin() {
        let dir = TempDir::new().unwrap();
        let (_, source) = BootstrapConfig::load(dir.path(), None).unwrap();
        assert_eq!(source, ConfigSource::Builtin);

        std::fs::write(dir.path().join("bootstrap.yaml"), "cluster:\n  name: project\n").unwrap();
        let (cfg, source) = BootstrapConfig::load(dir.path(), None).unwrap();
        assert_eq!(cfg.cluster.name, "project");
        assert!(matches!(source, ConfigSource::Project(_)));

        std::fs::write(dir.path().join("ci.yaml"), "cluster:\n  name: ci\n").unwrap();
        let (cfg, source) = BootstrapConfig::load(dir.path(), Some(Path::new("ci.yaml"))).unwrap();
        assert_eq!(cfg.cluster.name, "ci");
        assert_eq!(source, ConfigSource::Explicit(dir.path().join("ci.yaml")));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = BootstrapConfig::load(dir.path(), Some(Path::new("nope.yaml"))).unwrap_err();
        assert!(matches!(err, BootstrapError::ConfigNotFound(_)));
        assert!(err.is_validation());
    }

    #[test]
    fn required_variables_merge_and_dedupe() {
        let mut cfg = BootstrapConfig::default();
        cfg.required_env = vec!["VAULT_TOKEN".into(), "GITOPS_REPO_URL".into()];
        assert_eq!(
            cfg.required_variables(),
            vec![
                "VAULT_TOKEN",
                "GITOPS_REPO_URL",
                "GITOPS_REPO_TOKEN",
                "GITOPS_REPO_USERNAME"
            ]
        );
    }

    #[test]
    fn default_config_has_no_errors() {
        let cfg = BootstrapConfig::default();
        assert!(cfg.check().is_ok());
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn validate_flags_bad_entries() {
        let yaml = "\
allocation:
  single_node:
    wizard: { cpus: 2, memory: 4g }
components:
  - { name: a, manifest: a.yaml, namespace: x }
  - { name: a, manifest: b.yaml, namespace: '' }
  - { name: Bad_Name, manifest: c.yaml, namespace: y }
network:
  tunnel_pattern: ''
";
        let cfg = BootstrapConfig::from_yaml(yaml).unwrap();
        let messages: Vec<String> = cfg.validate().into_iter().map(|w| w.message).collect();
        assert!(messages.iter().any(|m| m.contains("unknown role")));
        assert!(messages.iter().any(|m| m.contains("duplicate component 'a'")));
        assert!(messages.iter().any(|m| m.contains("empty namespace")));
        assert!(messages.iter().any(|m| m.contains("'Bad_Name' is not a valid name")));
        assert!(messages.iter().any(|m| m.contains("tunnel_pattern")));
        assert!(messages.iter().any(|m| m.contains("single_node has no fallback")));
        assert!(cfg.check().is_err());
    }
}
