//! Background process supervision.
//!
//! Long-lived helpers (tunnels, port-forwarders) are spawned in their own
//! process group with output sent to `<state>/processes/<name>.log`. Each one
//! gets a YAML record next to its log so a later `bootstrap stop`, running in
//! a different process, can terminate it by PID.

use crate::clock::Clock;
use crate::error::{BootstrapError, Result};
use crate::io::{atomic_write, ensure_dir, remove_if_exists};
use crate::paths;
use crate::wait::{ConditionWaiter, WaitSpec};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);
const TERMINATE_POLL: Duration = Duration::from_millis(100);
const LOG_TAIL_LINES: usize = 5;

// ---------------------------------------------------------------------------
// ProcessRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub name: String,
    pub pid: u32,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub log: PathBuf,
    pub started_at: DateTime<Utc>,
    /// Kernel start time of `pid` in clock ticks since boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ticks: Option<u64>,
}

impl ProcessRecord {
    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            name: self.name.clone(),
            pid: self.pid,
        }
    }

    /// True while the recorded PID is alive and still runs this record's
    /// process.
    pub fn is_running(&self) -> bool {
        is_pid_alive(self.pid) && self.owns_pid()
    }

    /// Whether `pid` is still the process this record describes. The start
    /// time decides when both sides have one; otherwise the argv must match.
    fn owns_pid(&self) -> bool {
        if let (Some(recorded), Some(actual)) = (self.start_ticks, proc_start_ticks(self.pid)) {
            return recorded == actual;
        }
        proc_cmdline(self.pid).is_some_and(|argv| argv == self.command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub name: String,
    pub pid: u32,
}

// ---------------------------------------------------------------------------
// PID helpers
// ---------------------------------------------------------------------------

/// Process state letter from `/proc/<pid>/stat` (`R`, `S`, `Z`, ...).
fn proc_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces or parens; the state follows the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}

/// Field 22 of `/proc/<pid>/stat`: start time in clock ticks since boot.
fn proc_start_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    // `rest` begins at field 3 (state).
    rest.split_whitespace().nth(19)?.parse().ok()
}

fn proc_cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    Some(split_cmdline(&raw))
}

fn split_cmdline(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// True if `pid` exists and is not a zombie.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match proc_state(pid) {
        Some('Z') | Some('X') => false,
        Some(_) => true,
        None => kill(Pid::from_raw(raw), None::<Signal>).is_ok(),
    }
}

/// Send `signal`. A process that no longer exists counts as success.
fn signal_pid(pid: u32, signal: Signal) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| BootstrapError::Process(format!("pid {pid} out of range")))?;
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(BootstrapError::Process(format!(
            "failed to send {signal:?} to {pid}: {e}"
        ))),
    }
}

/// Live processes whose command line contains `pattern`, excluding this one.
pub fn find_matching(pattern: &str) -> Vec<u32> {
    let own = std::process::id();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut pids: Vec<u32> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| *pid != own)
        .filter(|pid| {
            std::fs::read(format!("/proc/{pid}/cmdline"))
                .map(|raw| cmdline_matches(&raw, pattern))
                .unwrap_or(false)
        })
        .filter(|pid| is_pid_alive(*pid))
        .collect();
    pids.sort_unstable();
    pids
}

/// `/proc/<pid>/cmdline` separates arguments with NUL; match against the
/// space-joined form.
fn cmdline_matches(raw: &[u8], pattern: &str) -> bool {
    if raw.is_empty() || pattern.is_empty() {
        return false;
    }
    split_cmdline(raw).join(" ").contains(pattern)
}

// ---------------------------------------------------------------------------
// ProcessSupervisor
// ---------------------------------------------------------------------------

pub struct ProcessSupervisor {
    state_dir: PathBuf,
    waiter: ConditionWaiter,
    children: Mutex<HashMap<u32, Child>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl ProcessSupervisor {
    pub fn new(state_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state_dir: state_dir.into(),
            waiter: ConditionWaiter::new(clock),
            children: Mutex::new(HashMap::new()),
            cancel: None,
        }
    }

    /// Refuse new spawns once `cancel` is set.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::SeqCst))
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Launch `argv` detached into its own process group and record its PID.
    pub fn spawn(&self, name: &str, argv: &[String]) -> Result<ProcessHandle> {
        self.spawn_with_pattern(name, argv, None)
    }

    fn spawn_with_pattern(
        &self,
        name: &str,
        argv: &[String],
        pattern: Option<&str>,
    ) -> Result<ProcessHandle> {
        paths::validate_name(name)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BootstrapError::Process(format!("{name}: empty command")))?;
        if self.cancelled() {
            return Err(BootstrapError::Process(format!(
                "{name}: not started, run interrupted"
            )));
        }

        ensure_dir(&paths::processes_dir(&self.state_dir))?;
        let log_path = paths::process_log_path(&self.state_dir, name);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .process_group(0)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BootstrapError::ToolNotFound(program.clone()),
                _ => BootstrapError::Process(format!("failed to spawn {name}: {e}")),
            })?;
        let pid = child.id();

        let record = ProcessRecord {
            name: name.to_string(),
            pid,
            command: argv.to_vec(),
            pattern: pattern.map(str::to_string),
            log: log_path,
            started_at: Utc::now(),
            start_ticks: proc_start_ticks(pid),
        };
        self.write_record(&record)?;
        self.lock_children().insert(pid, child);
        tracing::info!("started {name} (pid {pid})");

        Ok(record.handle())
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Child>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Liveness check that also reaps children this supervisor spawned.
    pub fn is_alive(&self, pid: u32) -> bool {
        let mut children = self.lock_children();
        if let Some(child) = children.get_mut(&pid) {
            match child.try_wait() {
                Ok(Some(_)) => {
                    children.remove(&pid);
                    return false;
                }
                Ok(None) => return true,
                Err(_) => {}
            }
        }
        drop(children);
        is_pid_alive(pid)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. An already-exited process
    /// is success.
    pub fn terminate(&self, handle: &ProcessHandle, grace: Duration) -> Result<()> {
        let pid = handle.pid;
        if self.is_alive(pid) {
            signal_pid(pid, Signal::SIGTERM)?;
            let spec = WaitSpec::new(format!("{} (pid {pid}) to exit", handle.name), grace)
                .with_poll_interval(TERMINATE_POLL);
            let exited = self.waiter.wait(&spec, || !self.is_alive(pid));
            if !exited.is_ready() {
                tracing::warn!(
                    "{} (pid {pid}) ignored SIGTERM for {}s; sending SIGKILL",
                    handle.name,
                    grace.as_secs_f64()
                );
                signal_pid(pid, Signal::SIGKILL)?;
            }
        }

        if let Some(mut child) = self.lock_children().remove(&pid) {
            let _ = child.wait();
        }
        self.remove_record_if_pid(&handle.name, pid)?;
        tracing::info!("stopped {} (pid {pid})", handle.name);
        Ok(())
    }

    /// Describe a supervised process that exited on its own, ending with the
    /// last lines of its log.
    pub fn exit_report(&self, handle: &ProcessHandle) -> String {
        let log = paths::process_log_path(&self.state_dir, &handle.name);
        let mut report = format!(
            "{} (pid {}) exited unexpectedly; see {}",
            handle.name,
            handle.pid,
            log.display()
        );
        let contents = std::fs::read_to_string(&log).unwrap_or_default();
        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let tail = &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..];
        if !tail.is_empty() {
            report.push_str(":\n    ");
            report.push_str(&tail.join("\n    "));
        }
        report
    }

    /// Ensure exactly one live instance of `argv`: terminate the recorded
    /// process for `name` and any other live process whose command line
    /// contains `pattern`, then spawn a replacement.
    pub fn ensure_singleton(
        &self,
        name: &str,
        pattern: &str,
        argv: &[String],
        grace: Duration,
    ) -> Result<ProcessHandle> {
        if let Some(record) = self.read_record(name)? {
            if self.is_alive(record.pid) && record.owns_pid() {
                tracing::info!("replacing recorded {name} (pid {})", record.pid);
            }
            self.stop_record(&record, grace)?;
        }

        for pid in find_matching(pattern) {
            tracing::info!("terminating stray process {pid} matching '{pattern}'");
            self.terminate(
                &ProcessHandle {
                    name: name.to_string(),
                    pid,
                },
                grace,
            )?;
        }

        self.spawn_with_pattern(name, argv, Some(pattern))
    }

    /// Terminate the process recorded under `name` and remove the record.
    /// Returns false when there is no record, or when the recorded PID now
    /// belongs to an unrelated process (which is left untouched).
    pub fn stop_recorded(&self, name: &str, grace: Duration) -> Result<bool> {
        match self.read_record(name)? {
            Some(record) => {
                let stopped = self.stop_record(&record, grace)?;
                remove_if_exists(&paths::process_record_path(&self.state_dir, name))?;
                Ok(stopped)
            }
            None => Ok(false),
        }
    }

    fn stop_record(&self, record: &ProcessRecord, grace: Duration) -> Result<bool> {
        if self.is_alive(record.pid) && !record.owns_pid() {
            tracing::warn!(
                "record for {} is stale: pid {} now runs another command; not signalling it",
                record.name,
                record.pid
            );
            remove_if_exists(&paths::process_record_path(&self.state_dir, &record.name))?;
            return Ok(false);
        }
        self.terminate(&record.handle(), grace)?;
        Ok(true)
    }

    /// Terminate every recorded process and remove its record. Failures are
    /// logged; the remaining records are still processed. Returns the records
    /// whose process was stopped or had already exited.
    pub fn cleanup_all(&self, grace: Duration) -> Result<Vec<ProcessRecord>> {
        let records = self.list_records()?;
        let mut stopped = Vec::new();
        for record in records {
            match self.stop_recorded(&record.name, grace) {
                Ok(true) => stopped.push(record),
                Ok(false) => {}
                Err(e) => tracing::warn!("could not stop {} (pid {}): {e}", record.name, record.pid),
            }
        }
        Ok(stopped)
    }

    /// All readable records, sorted by name. Unparseable files are skipped.
    pub fn list_records(&self) -> Result<Vec<ProcessRecord>> {
        let dir = paths::processes_dir(&self.state_dir);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(record) = serde_yaml::from_str::<ProcessRecord>(&data) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    pub fn read_record(&self, name: &str) -> Result<Option<ProcessRecord>> {
        let path = paths::process_record_path(&self.state_dir, name);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&data)?))
    }

    fn write_record(&self, record: &ProcessRecord) -> Result<()> {
        let path = paths::process_record_path(&self.state_dir, &record.name);
        let data = serde_yaml::to_string(record)?;
        atomic_write(&path, data.as_bytes())
    }

    fn remove_record_if_pid(&self, name: &str, pid: u32) -> Result<()> {
        if let Some(record) = self.read_record(name)? {
            if record.pid == pid {
                remove_if_exists(&paths::process_record_path(&self.state_dir, name))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use tempfile::TempDir;

    const GRACE: Duration = Duration::from_secs(2);

    fn supervisor(dir: &TempDir) -> ProcessSupervisor {
        ProcessSupervisor::new(dir.path(), Arc::new(SystemClock))
    }

    /// `sleep` with a duration unique to this test, so pattern scans only see
    /// processes the test started.
    fn sleep_argv(seconds: &str) -> Vec<String> {
        vec!["sleep".to_string(), seconds.to_string()]
    }

    #[test]
    fn cmdline_matching_joins_arguments() {
        assert!(cmdline_matches(b"kubectl\0port-forward\0svc/gw\0", "port-forward svc/gw"));
        assert!(!cmdline_matches(b"kubectl\0get\0pods\0", "port-forward"));
        assert!(!cmdline_matches(b"", "x"));
    }

    #[test]
    fn ensure_singleton_never_leaves_two_live_processes() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let argv = sleep_argv("7301");

        let first = sup.ensure_singleton("tunnel", "sleep 7301", &argv, GRACE).unwrap();
        let second = sup.ensure_singleton("tunnel", "sleep 7301", &argv, GRACE).unwrap();

        assert_ne!(first.pid, second.pid);
        assert!(!sup.is_alive(first.pid));
        assert_eq!(find_matching("sleep 7301"), vec![second.pid]);
        assert_eq!(sup.read_record("tunnel").unwrap().unwrap().pid, second.pid);

        sup.cleanup_all(GRACE).unwrap();
        assert!(find_matching("sleep 7301").is_empty());
    }

    #[test]
    fn ensure_singleton_replaces_unrecorded_match() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let stray = sup.spawn("other", &sleep_argv("7302")).unwrap();

        let handle = sup
            .ensure_singleton("tunnel", "sleep 7302", &sleep_argv("7302"), GRACE)
            .unwrap();

        assert!(!sup.is_alive(stray.pid));
        assert!(sup.is_alive(handle.pid));
        sup.cleanup_all(GRACE).unwrap();
    }

    #[test]
    fn terminating_an_exited_process_succeeds() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let handle = sup.spawn("short", &["true".to_string()]).unwrap();
        let waiter = ConditionWaiter::new(Arc::new(SystemClock));
        let spec = WaitSpec::new("true to exit", GRACE).with_poll_interval(TERMINATE_POLL);
        assert!(waiter.wait(&spec, || !sup.is_alive(handle.pid)).is_ready());

        sup.terminate(&handle, GRACE).unwrap();
        assert!(sup.read_record("short").unwrap().is_none());
    }

    #[test]
    fn stop_from_another_supervisor_uses_the_record() {
        let dir = TempDir::new().unwrap();
        let owner = supervisor(&dir);
        let handle = owner.spawn("forwarder", &sleep_argv("7303")).unwrap();

        let other = supervisor(&dir);
        let records = other.list_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, handle.pid);
        assert_eq!(records[0].command, sleep_argv("7303"));

        assert!(other.stop_recorded("forwarder", GRACE).unwrap());
        assert!(!is_pid_alive(handle.pid));
        assert!(other.list_records().unwrap().is_empty());
        assert!(!other.stop_recorded("forwarder", GRACE).unwrap());
    }

    #[test]
    fn output_goes_to_the_log_file() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo tunnel-up".to_string()];
        let handle = sup.spawn("echo", &argv).unwrap();
        let waiter = ConditionWaiter::new(Arc::new(SystemClock));
        let spec = WaitSpec::new("echo to exit", GRACE).with_poll_interval(TERMINATE_POLL);
        assert!(waiter.wait(&spec, || !sup.is_alive(handle.pid)).is_ready());

        let log = std::fs::read_to_string(paths::process_log_path(dir.path(), "echo")).unwrap();
        assert!(log.contains("tunnel-up"));
    }

    #[test]
    fn exit_report_ends_with_the_log_tail() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let script = "for i in 1 2 3 4 5 6 7; do echo line-$i; done; exit 3";
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let handle = sup.spawn("tunnel", &argv).unwrap();
        let waiter = ConditionWaiter::new(Arc::new(SystemClock));
        let spec = WaitSpec::new("tunnel to exit", GRACE).with_poll_interval(TERMINATE_POLL);
        assert!(waiter.wait(&spec, || !sup.is_alive(handle.pid)).is_ready());

        let report = sup.exit_report(&handle);
        assert!(report.starts_with(&format!("tunnel (pid {}) exited unexpectedly", handle.pid)));
        assert!(report.contains("tunnel.log"));
        assert!(report.contains("line-3") && report.contains("line-7"));
        assert!(!report.contains("line-2"));
    }

    #[test]
    fn missing_program_is_tool_not_found() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let err = sup
            .spawn("x", &["definitely-not-a-real-binary-5521".to_string()])
            .unwrap_err();
        assert!(matches!(err, BootstrapError::ToolNotFound(_)));
        assert!(sup.list_records().unwrap().is_empty());
    }

    /// Record `name` as if this tool had started `command` under `pid`.
    fn write_foreign_record(sup: &ProcessSupervisor, name: &str, pid: u32, command: &[&str]) {
        ensure_dir(&paths::processes_dir(sup.state_dir())).unwrap();
        let record = ProcessRecord {
            name: name.to_string(),
            pid,
            command: command.iter().map(|s| s.to_string()).collect(),
            pattern: None,
            log: paths::process_log_path(sup.state_dir(), name),
            started_at: Utc::now(),
            start_ticks: None,
        };
        sup.write_record(&record).unwrap();
    }

    #[test]
    fn reused_pid_is_not_signalled() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let mut unrelated = Command::new("sleep").arg("7399").spawn().unwrap();
        write_foreign_record(&sup, "tunnel", unrelated.id(), &["kubectl", "port-forward", "svc/gw"]);

        assert!(!sup.stop_recorded("tunnel", Duration::from_secs(1)).unwrap());

        assert!(unrelated.try_wait().unwrap().is_none());
        assert!(sup.read_record("tunnel").unwrap().is_none());
        unrelated.kill().unwrap();
        unrelated.wait().unwrap();
    }

    #[test]
    fn cleanup_and_singleton_skip_reused_pids() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let mut unrelated = Command::new("sleep").arg("7398").spawn().unwrap();
        write_foreign_record(&sup, "forwarder", unrelated.id(), &["kubectl", "port-forward", "svc/a"]);
        write_foreign_record(&sup, "tunnel", unrelated.id(), &["minikube", "tunnel"]);

        assert!(sup.cleanup_all(GRACE).unwrap().is_empty());
        assert!(sup.list_records().unwrap().is_empty());

        write_foreign_record(&sup, "tunnel", unrelated.id(), &["minikube", "tunnel"]);
        let handle = sup
            .ensure_singleton("tunnel", "sleep 7397", &sleep_argv("7397"), GRACE)
            .unwrap();
        assert!(unrelated.try_wait().unwrap().is_none());
        assert_eq!(sup.read_record("tunnel").unwrap().unwrap().pid, handle.pid);

        sup.cleanup_all(GRACE).unwrap();
        unrelated.kill().unwrap();
        unrelated.wait().unwrap();
    }

    #[test]
    fn spawned_record_owns_its_pid() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.spawn("owned", &sleep_argv("7396")).unwrap();
        let record = sup.read_record("owned").unwrap().unwrap();
        assert!(record.start_ticks.is_some());
        assert!(record.is_running());
        assert!(sup.stop_recorded("owned", GRACE).unwrap());
        assert!(!record.is_running());
    }

    #[test]
    fn no_spawn_after_cancel() {
        let dir = TempDir::new().unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let sup = supervisor(&dir).with_cancel(cancel.clone());
        cancel.store(true, Ordering::SeqCst);

        let err = sup.spawn("tunnel", &sleep_argv("7395")).unwrap_err();
        assert!(err.to_string().contains("interrupted"));
        assert!(sup.list_records().unwrap().is_empty());
        assert!(find_matching("sleep 7395").is_empty());
    }

    #[test]
    fn empty_command_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(supervisor(&dir).spawn("x", &[]).is_err());
    }
}
