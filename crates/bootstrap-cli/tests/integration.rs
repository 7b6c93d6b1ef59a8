#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const SECRET_VARS: [(&str, &str); 4] = [
    ("VAULT_TOKEN", "root"),
    ("GITOPS_REPO_URL", "https://git.example.com/platform.git"),
    ("GITOPS_REPO_USERNAME", "bot"),
    ("GITOPS_REPO_TOKEN", "t0ken"),
];

fn bootstrap(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("bootstrap").unwrap();
    cmd.current_dir(dir.path())
        .env("BOOTSTRAP_ROOT", dir.path())
        .env_remove("BOOTSTRAP_CONFIG")
        .env_remove("RUST_LOG");
    for (name, _) in SECRET_VARS {
        cmd.env_remove(name);
    }
    cmd
}

fn with_secret_vars(cmd: &mut Command) -> &mut Command {
    for (name, value) in SECRET_VARS {
        cmd.env(name, value);
    }
    cmd
}

/// A project with a topology descriptor, no components and networking off.
fn minimal_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("topology")).unwrap();
    fs::write(
        dir.path().join("topology/single-node.yaml"),
        "apiVersion: k3d.io/v1alpha5\nkind: Simple\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("bootstrap.yaml"),
        "components: []\nnetwork:\n  enabled: false\n",
    )
    .unwrap();
    dir
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

#[test]
fn config_validate_builtin_defaults() {
    let dir = TempDir::new().unwrap();
    bootstrap(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_reports_errors() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("bootstrap.yaml"),
        "waits:\n  poll_interval_secs: 0\n",
    )
    .unwrap();
    bootstrap(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] waits.poll_interval_secs"));
}

#[test]
fn config_show_names_project_file() {
    let dir = minimal_project();
    let output = bootstrap(&dir)
        .args(["config", "show", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v["source"]["kind"], "project");
    assert_eq!(v["config"]["network"]["enabled"], false);
    assert_eq!(v["config"]["components"].as_array().unwrap().len(), 0);
}

#[test]
fn explicit_config_must_exist() {
    let dir = TempDir::new().unwrap();
    bootstrap(&dir)
        .args(["--config", "nope.yaml", "config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config file not found"));
}

// ---------------------------------------------------------------------------
// plan
// ---------------------------------------------------------------------------

#[test]
fn plan_lists_stages_in_order() {
    let dir = TempDir::new().unwrap();
    let output = bootstrap(&dir).args(["plan", "--json"]).output().unwrap();
    assert!(output.status.success());
    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = v["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names.first(), Some(&"preflight"));
    assert_eq!(names.last(), Some(&"networking"));
    assert!(names.contains(&"component:gitops"));
}

#[test]
fn plan_rejects_non_positive_cpus() {
    let dir = TempDir::new().unwrap();
    bootstrap(&dir)
        .args(["plan", "--cpus", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid cpu value"));
}

// ---------------------------------------------------------------------------
// up
// ---------------------------------------------------------------------------

#[test]
fn dry_run_succeeds_and_records_summary() {
    let dir = minimal_project();
    with_secret_vars(&mut bootstrap(&dir))
        .args(["up", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("would create cluster"));

    let data = fs::read_to_string(dir.path().join(".bootstrap/run-summary.json")).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(summary["dry_run"], true);
    assert_eq!(summary["outcome"], "succeeded");
    assert_eq!(summary["stages"][0]["name"], "preflight");
    assert_eq!(summary["stages"][0]["status"], "succeeded");
    assert_eq!(summary["stages"][1]["status"], "skipped");

    // No phase artifacts in a dry run.
    assert!(!dir.path().join(".bootstrap/cluster-summary.json").exists());
    assert!(!dir.path().join(".bootstrap/secrets-summary.json").exists());
}

#[test]
fn missing_variables_stop_at_preflight() {
    let dir = minimal_project();
    bootstrap(&dir)
        .args(["up"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("VAULT_TOKEN"))
        .stdout(predicate::str::contains("GITOPS_REPO_URL"))
        .stderr(predicate::str::contains("run stopped at preflight"));

    let data = fs::read_to_string(dir.path().join(".bootstrap/run-summary.json")).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(summary["outcome"], "aborted");
    assert_eq!(summary["stages"][1]["status"], "pending");
}

#[test]
fn skipped_secrets_do_not_require_credentials() {
    let dir = minimal_project();
    bootstrap(&dir)
        .args(["up", "--dry-run", "--skip-secrets", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("skipped by flag"));
}

// ---------------------------------------------------------------------------
// status / stop
// ---------------------------------------------------------------------------

#[test]
fn status_without_runs() {
    let dir = TempDir::new().unwrap();
    bootstrap(&dir)
        .args(["status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded"));
}

#[test]
fn status_after_dry_run() {
    let dir = minimal_project();
    with_secret_vars(&mut bootstrap(&dir))
        .args(["up", "--dry-run"])
        .assert()
        .success();

    let output = bootstrap(&dir).args(["status", "--json"]).output().unwrap();
    assert!(output.status.success());
    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v["run"]["dry_run"], true);
    assert_eq!(v["processes"].as_array().unwrap().len(), 0);
}

#[test]
fn stop_with_nothing_recorded() {
    let dir = TempDir::new().unwrap();
    bootstrap(&dir)
        .args(["stop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No supervised processes."));
}
