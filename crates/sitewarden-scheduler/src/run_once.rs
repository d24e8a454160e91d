//! Post-run handling of ad-hoc jobs declaring `params.run_once`.
//!
//! | outcome                                   | `disable`   | `delete`    |
//! |-------------------------------------------|-------------|-------------|
//! | `OK`                                      | disabled    | row deleted |
//! | `EXCEPTION`, `NO_ROUTINE`, `NO_EXIT`, `INVALID_EXIT` | disabled | disabled |
//! | anything else (resume, timeout, infra)    | untouched   | untouched   |
//!
//! A broken ad-hoc job is disabled rather than deleted so an operator can
//! still inspect its error summary.

use tracing::info;

use crate::{
    error::Result,
    store::JobStore,
    types::{Job, RunOnce, Status},
};

/// What the policy did to the job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOnceOutcome {
    Disabled,
    Deleted,
}

/// Decide the action for `job` after a run that ended with `status`.
pub fn decide(job: &Job, status: Status) -> Option<RunOnceOutcome> {
    let action = job.run_once()?;
    match status {
        Status::Ok => Some(match action {
            RunOnce::Disable => RunOnceOutcome::Disabled,
            RunOnce::Delete => RunOnceOutcome::Deleted,
        }),
        s if s.is_handler_failure() => Some(RunOnceOutcome::Disabled),
        _ => None,
    }
}

/// Apply [`decide`] to the store.
pub fn apply(store: &JobStore, job: &Job, status: Status) -> Result<Option<RunOnceOutcome>> {
    let outcome = decide(job, status);
    match outcome {
        Some(RunOnceOutcome::Disabled) => {
            store.set_enabled(job.id, false)?;
            info!(job_id = %job.id, %status, "run-once job disabled");
        }
        Some(RunOnceOutcome::Deleted) => {
            store.delete(job.id)?;
            info!(job_id = %job.id, "run-once job deleted");
        }
        None => {}
    }
    Ok(outcome)
}
