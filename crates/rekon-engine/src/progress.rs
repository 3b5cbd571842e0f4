//! Pipeline-run state machine.
//!
//! ```text
//! Running ──(every step succeeded or skipped)──▶ Completed
//!    │
//!    └────(any step failed)──────────────────────▶ Failed   (pending steps → Skipped)
//! ```
//!
//! Steps whose driver filters out the resource event that started the run
//! are skipped when the run opens, since no result will ever come for them.
//!
//! Terminal runs never change again. A step settles once; a repeated
//! result for the same driver (at-least-once delivery) is ignored.

use rekon_core::{PipelineRun, RunStatus, StepStatus};
use tracing::{debug, info, warn};

/// What applying a result did to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    /// A step settled; the run is still running.
    Progressed,
    Completed,
    Failed,
}

impl Transition {
    pub fn changed(self) -> bool {
        self != Transition::Unchanged
    }
}

/// Record the outcome reported by `driver` on `run`.
pub fn apply_result(
    run: &mut PipelineRun,
    driver: &str,
    success: bool,
    message: &str,
    now: u64,
) -> Transition {
    if run.is_terminal() {
        debug!(run_id = %run.run_id, pipeline = %run.pipeline, %driver, "run already finished, ignoring result");
        return Transition::Unchanged;
    }

    let Some(step) = run.steps.iter_mut().find(|s| s.driver == driver) else {
        debug!(run_id = %run.run_id, pipeline = %run.pipeline, %driver, "driver has no step in pipeline");
        return Transition::Unchanged;
    };
    if step.status != StepStatus::Pending {
        debug!(run_id = %run.run_id, step = %step.name, "step already settled");
        return Transition::Unchanged;
    }

    step.message = message.to_string();
    run.updated_at = now;

    if !success {
        step.status = StepStatus::Failed;
        let failed_step = step.name.clone();
        for other in run.steps.iter_mut() {
            if other.status == StepStatus::Pending {
                other.status = StepStatus::Skipped;
            }
        }
        run.status = RunStatus::Failed;
        warn!(run_id = %run.run_id, pipeline = %run.pipeline, step = %failed_step, %message, "pipeline run failed");
        return Transition::Failed;
    }

    step.status = StepStatus::Succeeded;
    if complete_if_done(run) {
        Transition::Completed
    } else {
        Transition::Progressed
    }
}

/// Skip the pending steps whose driver does not handle `change`. Returns
/// how many steps were skipped.
pub fn skip_unhandled(run: &mut PipelineRun, change: &str, handles: impl Fn(&str) -> bool) -> usize {
    if run.is_terminal() {
        return 0;
    }
    let mut skipped = 0;
    for step in run.steps.iter_mut() {
        if step.status == StepStatus::Pending && !handles(&step.driver) {
            step.status = StepStatus::Skipped;
            step.message = format!("driver does not handle {change}");
            debug!(run_id = %run.run_id, step = %step.name, driver = %step.driver, %change, "step skipped");
            skipped += 1;
        }
    }
    skipped
}

/// Mark a running run completed when every step succeeded or was skipped.
/// Also settles pipelines without steps. Returns whether the run completed.
pub fn complete_if_done(run: &mut PipelineRun) -> bool {
    if run.is_terminal() {
        return false;
    }
    let done = run
        .steps
        .iter()
        .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Skipped));
    if done {
        run.status = RunStatus::Completed;
        info!(run_id = %run.run_id, pipeline = %run.pipeline, steps = run.steps.len(), "pipeline run completed");
        return true;
    }
    false
}
