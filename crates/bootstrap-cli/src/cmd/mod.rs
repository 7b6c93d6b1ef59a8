pub mod config;
pub mod plan;
pub mod status;
pub mod stop;
pub mod up;

use anyhow::Context;
use bootstrap_core::allocation::HostCapacity;
use bootstrap_core::clock::SystemClock;
use bootstrap_core::config::{BootstrapConfig, ConfigSource};
use bootstrap_core::env::Environment;
use bootstrap_core::pipeline::{Collaborators, RunContext, RunFlags};
use bootstrap_core::supervisor::ProcessSupervisor;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub fn load_config(root: &Path, explicit: Option<&Path>) -> anyhow::Result<(BootstrapConfig, ConfigSource)> {
    BootstrapConfig::load(root, explicit).context("failed to load config")
}

pub fn supervisor(root: &Path, config: &BootstrapConfig) -> ProcessSupervisor {
    ProcessSupervisor::new(config.state_dir(root), Arc::new(SystemClock))
}

/// Assemble the run context against the real command-line adapters. The
/// process environment is captured here, once. Once `cancel` is set the
/// supervisor starts no more background processes.
pub fn build_context(
    root: &Path,
    config: BootstrapConfig,
    flags: RunFlags,
    cancel: Arc<AtomicBool>,
) -> Arc<RunContext> {
    let env = Environment::capture();
    let platform = Collaborators::command_line(root, &config, &env, &flags);
    let supervisor = Arc::new(supervisor(root, &config).with_cancel(cancel));
    let host = HostCapacity::detect();
    Arc::new(RunContext {
        root: root.to_path_buf(),
        config,
        env,
        flags,
        clock: Arc::new(SystemClock),
        platform,
        supervisor,
        host,
    })
}
