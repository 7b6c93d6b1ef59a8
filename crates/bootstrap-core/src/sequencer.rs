//! Strictly ordered stage execution.

use crate::clock::Clock;
use crate::error::{BootstrapError, Result};
use crate::retry::RetryExecutor;
use crate::stage::{Stage, StageContext, StageGroup, StageResult, StageStatus};
use crate::summary::{RunOutcome, RunSummaryRecorder};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequencerOptions {
    pub dry_run: bool,
    pub skip: BTreeSet<StageGroup>,
}

pub struct StageSequencer {
    clock: Arc<dyn Clock>,
    retry: RetryExecutor,
    options: SequencerOptions,
    cancel: Option<Arc<AtomicBool>>,
}

impl StageSequencer {
    pub fn new(clock: Arc<dyn Clock>, options: SequencerOptions) -> Self {
        Self {
            retry: RetryExecutor::new(clock.clone()),
            clock,
            options,
            cancel: None,
        }
    }

    /// Checked between stages; once set, the remaining stages stay pending and
    /// the run ends as interrupted.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::SeqCst))
    }

    /// Execute `stages` in declaration order, recording one result per stage.
    ///
    /// Returns `Err` only when the stage list itself is malformed; stage
    /// failures are reflected in the outcome and the recorded results.
    pub fn run(&self, stages: Vec<Stage>, recorder: &mut RunSummaryRecorder) -> Result<RunOutcome> {
        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(BootstrapError::DuplicateStage(stage.name.clone()));
            }
        }

        let total = stages.len();
        let mut outcome = RunOutcome::Succeeded;
        let mut stages = stages.into_iter().enumerate();

        while let Some((index, mut stage)) = stages.next() {
            if self.cancelled() {
                tracing::warn!("interrupted before stage '{}'", stage.name);
                recorder.record(StageResult::new(&stage.name, StageStatus::Pending));
                outcome = RunOutcome::Interrupted;
                break;
            }

            if let Some(group) = stage.group.filter(|g| self.options.skip.contains(g)) {
                tracing::info!("[{}/{total}] {}: skipped by flag --skip-{group}", index + 1, stage.name);
                recorder.record(
                    StageResult::new(&stage.name, StageStatus::Skipped).with_note("skipped by flag"),
                );
                continue;
            }

            if self.options.dry_run && stage.dry_run_safe {
                let note = stage.would_note();
                tracing::info!("[{}/{total}] {}: {note}", index + 1, stage.name);
                recorder.record(StageResult::new(&stage.name, StageStatus::Skipped).with_note(note));
                continue;
            }

            tracing::info!("[{}/{total}] {}: running", index + 1, stage.name);
            let (result, validation) = self.execute(&mut stage, recorder);
            let failed = result.status == StageStatus::Failed;
            recorder.record(result);

            if failed && self.cancelled() {
                tracing::warn!("stage '{}' failed after an interrupt", stage.name);
                outcome = RunOutcome::Interrupted;
                break;
            }
            if failed {
                if stage.abort_on_failure || validation {
                    tracing::error!("stage '{}' failed; aborting run", stage.name);
                    outcome = RunOutcome::Aborted;
                    break;
                }
                tracing::warn!("stage '{}' failed; continuing", stage.name);
                outcome = RunOutcome::Degraded;
            }
        }

        for (_, stage) in stages {
            recorder.record(StageResult::new(&stage.name, StageStatus::Pending));
        }
        Ok(outcome)
    }

    /// Run one stage. The flag is set when it failed validation, which aborts
    /// the run whatever the stage's own policy says.
    fn execute(&self, stage: &mut Stage, recorder: &RunSummaryRecorder) -> (StageResult, bool) {
        let started = self.clock.now();
        let dry_run = self.options.dry_run;
        let name = stage.name.clone();

        let attempt_once = |action: &mut crate::stage::StageAction, attempt: u32| {
            action(&StageContext {
                stage: &name,
                dry_run,
                attempt,
            })
        };

        let outcome = match stage.retry {
            Some(spec) => {
                let action = &mut stage.action;
                self.retry
                    .run(&spec, &name, |attempt| attempt_once(&mut *action, attempt))
                    .map_err(|exhausted| {
                        // Keep validation failures recognizable through retries.
                        if exhausted.last_error.is_validation() {
                            exhausted.last_error
                        } else {
                            exhausted.into_error(&name)
                        }
                    })
            }
            None => attempt_once(&mut stage.action, 1),
        };

        let mut result = StageResult::new(&name, StageStatus::Running);
        let mut validation = false;
        match outcome {
            Ok(output) => {
                result.status = StageStatus::Succeeded;
                result.note = output.note;
                if let (Some(phase), Some(fields)) = (&stage.artifact, output.artifact.as_ref()) {
                    if let Err(e) = recorder.write_phase(phase, fields) {
                        tracing::warn!("could not write {phase} summary: {e}");
                    }
                }
            }
            Err(e) => {
                tracing::error!("stage '{name}': {e}");
                result.status = StageStatus::Failed;
                validation = e.is_validation();
                result.error = Some(e.to_string());
            }
        }
        result.duration_secs = self.clock.now().duration_since(started).as_secs_f64();
        (result, validation)
    }
}
