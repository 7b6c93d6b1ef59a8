//! Run summary and phase artifacts.
//!
//! Stage results accumulate in memory; `finalize` performs the single atomic
//! write of `run-summary.json`, so a reader sees a complete summary or none.

use crate::error::Result;
use crate::io;
use crate::paths;
use crate::stage::{StageResult, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// Every abort-on-failure stage passed, but a tolerant stage failed.
    Degraded,
    Aborted,
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded | RunOutcome::Degraded => 0,
            RunOutcome::Aborted => 1,
            RunOutcome::Interrupted => 130,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Degraded => "degraded",
            RunOutcome::Aborted => "aborted",
            RunOutcome::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub dry_run: bool,
    pub outcome: RunOutcome,
    pub stages: Vec<StageResult>,
}

impl RunSummary {
    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }

    pub fn total_secs(&self) -> f64 {
        self.stages.iter().map(|s| s.duration_secs).sum()
    }

    pub fn load(state_dir: &Path) -> Result<Option<RunSummary>> {
        let path = paths::run_summary_path(state_dir);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }
}

pub struct RunSummaryRecorder {
    state_dir: PathBuf,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    dry_run: bool,
    stages: Vec<StageResult>,
}

impl RunSummaryRecorder {
    pub fn new(state_dir: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            state_dir: state_dir.into(),
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            dry_run,
            stages: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn record(&mut self, result: StageResult) {
        self.stages.push(result);
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    /// Atomically write `<phase>-summary.json`. A `timestamp` field is added
    /// to the phase's outputs.
    pub fn write_phase(&self, phase: &str, fields: &Map<String, Value>) -> Result<PathBuf> {
        let mut doc = Map::new();
        doc.insert("timestamp".to_string(), Value::String(Utc::now().to_rfc3339()));
        doc.insert("run_id".to_string(), Value::String(self.run_id.to_string()));
        for (k, v) in fields {
            doc.insert(k.clone(), v.clone());
        }
        let path = paths::phase_summary_path(&self.state_dir, phase);
        io::write_json(&path, &Value::Object(doc))?;
        tracing::debug!("wrote {}", path.display());
        Ok(path)
    }

    /// Persist the run summary. This is the only write of `run-summary.json`.
    pub fn finalize(self, outcome: RunOutcome) -> Result<RunSummary> {
        let summary = RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            completed_at: Utc::now(),
            dry_run: self.dry_run,
            outcome,
            stages: self.stages,
        };
        io::write_json(&paths::run_summary_path(&self.state_dir), &summary)?;
        Ok(summary)
    }
}

/// Read a phase artifact written by a previous run.
pub fn load_phase(state_dir: &Path, phase: &str) -> Result<Option<Value>> {
    let path = paths::phase_summary_path(state_dir, phase);
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&data)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn nothing_is_written_before_finalize() {
        let dir = TempDir::new().unwrap();
        let mut rec = RunSummaryRecorder::new(dir.path(), false);
        rec.record(StageResult::new("preflight", StageStatus::Succeeded));
        assert!(RunSummary::load(dir.path()).unwrap().is_none());

        let summary = rec.finalize(RunOutcome::Succeeded).unwrap();
        let loaded = RunSummary::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, summary);
        assert_eq!(loaded.count(StageStatus::Succeeded), 1);
        assert!(loaded.completed_at >= loaded.started_at);
    }

    #[test]
    fn phase_artifact_carries_timestamp_and_fields() {
        let dir = TempDir::new().unwrap();
        let rec = RunSummaryRecorder::new(dir.path(), false);
        let mut fields = Map::new();
        fields.insert("cluster".into(), Value::from("dev"));
        rec.write_phase(paths::CLUSTER_SUMMARY, &fields).unwrap();

        let doc = load_phase(dir.path(), paths::CLUSTER_SUMMARY).unwrap().unwrap();
        assert_eq!(doc["cluster"], "dev");
        assert!(doc["timestamp"].is_string());
        assert_eq!(doc["run_id"], rec.run_id().to_string());
        assert!(dir.path().join("cluster-summary.json").exists());
    }

    #[test]
    fn exit_codes_follow_outcome() {
        assert_eq!(RunOutcome::Succeeded.exit_code(), 0);
        assert_eq!(RunOutcome::Degraded.exit_code(), 0);
        assert_eq!(RunOutcome::Aborted.exit_code(), 1);
        assert_eq!(RunOutcome::Interrupted.exit_code(), 130);
    }
}
