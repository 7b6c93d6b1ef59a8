//! Stage definitions and per-stage results.

use crate::error::Result;
use crate::retry::RetrySpec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// StageStatus / StageGroup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Skip-flag group a stage belongs to (`--skip-cluster` and friends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageGroup {
    Cluster,
    Platform,
    Secrets,
    Network,
}

impl StageGroup {
    pub const ALL: [StageGroup; 4] = [
        StageGroup::Cluster,
        StageGroup::Platform,
        StageGroup::Secrets,
        StageGroup::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageGroup::Cluster => "cluster",
            StageGroup::Platform => "platform",
            StageGroup::Secrets => "secrets",
            StageGroup::Network => "network",
        }
    }
}

impl fmt::Display for StageGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageGroup {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        StageGroup::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| format!("unknown stage group: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Passed to a stage action on each attempt.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub stage: &'a str,
    pub dry_run: bool,
    pub attempt: u32,
}

/// What a successful action reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub note: Option<String>,
    /// Key outputs written to the stage's phase artifact, if it has one.
    pub artifact: Option<Map<String, Value>>,
}

impl StageOutput {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.artifact
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }
}

pub type StageAction = Box<dyn FnMut(&StageContext<'_>) -> Result<StageOutput> + Send>;

/// One unit of the bootstrap sequence. Built once per run and consumed by the
/// sequencer; never re-executed.
pub struct Stage {
    pub name: String,
    pub action: StageAction,
    pub abort_on_failure: bool,
    pub dry_run_safe: bool,
    pub preview: Option<String>,
    pub retry: Option<RetrySpec>,
    pub artifact: Option<String>,
    pub group: Option<StageGroup>,
}

impl Stage {
    /// A stage that aborts the run on failure and always executes.
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnMut(&StageContext<'_>) -> Result<StageOutput> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(action),
            abort_on_failure: true,
            dry_run_safe: false,
            preview: None,
            retry: None,
            artifact: None,
            group: None,
        }
    }

    /// Failures are logged and the run continues.
    pub fn tolerate_failure(mut self) -> Self {
        self.abort_on_failure = false;
        self
    }

    pub fn abort_on_failure(mut self, abort: bool) -> Self {
        self.abort_on_failure = abort;
        self
    }

    /// Skip under `--dry-run`, recording `preview` as "would …" text.
    pub fn dry_run_safe(mut self, preview: impl Into<String>) -> Self {
        self.dry_run_safe = true;
        self.preview = Some(preview.into());
        self
    }

    pub fn with_retry(mut self, retry: RetrySpec) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_artifact(mut self, phase: impl Into<String>) -> Self {
        self.artifact = Some(phase.into());
        self
    }

    pub fn in_group(mut self, group: StageGroup) -> Self {
        self.group = Some(group);
        self
    }

    /// Text recorded when the stage is skipped in dry-run.
    pub fn would_note(&self) -> String {
        match &self.preview {
            Some(p) => format!("would {p}"),
            None => format!("would run {}", self.name),
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("abort_on_failure", &self.abort_on_failure)
            .field("dry_run_safe", &self.dry_run_safe)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// StageResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    /// Wall time spent in the stage, in seconds.
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageResult {
    pub fn new(name: impl Into<String>, status: StageStatus) -> Self {
        Self {
            name: name.into(),
            status,
            duration_secs: 0.0,
            note: None,
            error: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}
