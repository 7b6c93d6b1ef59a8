use crate::error::{BootstrapError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const STATE_DIR: &str = ".bootstrap";
pub const PROCESSES_DIR: &str = "processes";
pub const CONFIG_FILE: &str = "bootstrap.yaml";

pub const RUN_SUMMARY_FILE: &str = "run-summary.json";
pub const SECRETS_SUMMARY: &str = "secrets";
pub const CLUSTER_SUMMARY: &str = "cluster";
pub const NETWORK_SUMMARY: &str = "network";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn default_state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn run_summary_path(state_dir: &Path) -> PathBuf {
    state_dir.join(RUN_SUMMARY_FILE)
}

/// `<state>/<phase>-summary.json`
pub fn phase_summary_path(state_dir: &Path, phase: &str) -> PathBuf {
    state_dir.join(format!("{phase}-summary.json"))
}

pub fn processes_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(PROCESSES_DIR)
}

pub fn process_record_path(state_dir: &Path, name: &str) -> PathBuf {
    processes_dir(state_dir).join(format!("{name}.yaml"))
}

pub fn process_log_path(state_dir: &Path, name: &str) -> PathBuf {
    processes_dir(state_dir).join(format!("{name}.log"))
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Component and process names end up in file and stage names.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 || !name_re().is_match(name) {
        return Err(BootstrapError::InvalidName(name.to_string()));
    }
    Ok(())
}
