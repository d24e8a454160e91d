//! Selection and claiming of the next job to run.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::{
    db::{self, ts},
    error::Result,
    store::{row_to_job, JobStore, JOB_COLUMNS},
    types::{Job, Status},
};

/// A job this runner has exclusively claimed (`last_exit_code = RUNNING`).
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// Row state right after the claim.
    pub job: Job,
    /// True when the previous run asked to be resumed; `storage` is intact.
    pub resumed: bool,
}

/// Select the single best eligible job and claim it.
///
/// Eligible jobs are enabled and either waiting to resume, or due and not
/// running. Resumable jobs come first regardless of priority or due time,
/// then lower `priority`, then earlier `next_execution`.
///
/// Callers must hold the job-selection lock; the conditional claim in
/// [`claim`] still guarantees a single winner if they do not.
pub fn claim_next(store: &JobStore, now: DateTime<Utc>) -> Result<Option<ClaimedJob>> {
    let Some(candidate) = select_next(store, now)? else {
        debug!("no eligible job");
        return Ok(None);
    };
    claim(store, &candidate, now)
}

/// The job [`claim_next`] would pick, without claiming it.
pub fn select_next(store: &JobStore, now: DateTime<Utc>) -> Result<Option<Job>> {
    let conn = db::lock(store.db())?;
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM tasks
         WHERE enabled = 1
           AND (last_exit_code = ?1
                OR (last_exit_code NOT IN (?1, ?2)
                    AND next_execution IS NOT NULL
                    AND next_execution <= ?3))
         ORDER BY (last_exit_code = ?1) DESC, priority ASC, next_execution ASC, id ASC
         LIMIT 1"
    );
    Ok(conn
        .query_row(
            &sql,
            params![Status::WillResume.code(), Status::Running.code(), ts(now)],
            row_to_job,
        )
        .optional()?)
}

/// Atomically move `observed` to `RUNNING`.
///
/// The update only applies while the row still carries the exit code we
/// observed, so of two runners racing for the same snapshot exactly one
/// gets `Some`. `last_execution` is refreshed for fresh runs only; a resumed
/// run keeps the start time of its first step.
pub fn claim(store: &JobStore, observed: &Job, now: DateTime<Utc>) -> Result<Option<ClaimedJob>> {
    let resumed = observed.last_exit_code == Status::WillResume;
    let changed = {
        let conn = db::lock(store.db())?;
        conn.execute(
            "UPDATE tasks
             SET last_exit_code = ?1,
                 last_execution = CASE WHEN ?2 THEN last_execution ELSE ?3 END,
                 updated_at = ?3
             WHERE id = ?4 AND enabled = 1 AND last_exit_code = ?5 AND last_exit_code != ?1",
            params![
                Status::Running.code(),
                resumed,
                ts(now),
                observed.id.0,
                observed.last_exit_code.code(),
            ],
        )?
    };
    if changed == 0 {
        debug!(job_id = %observed.id, "job claimed by another runner");
        return Ok(None);
    }

    let mut job = observed.clone();
    job.last_exit_code = Status::Running;
    if !resumed {
        job.last_execution = Some(now);
    }
    debug!(job_id = %job.id, job_type = %job.job_type, resumed, "job claimed");
    Ok(Some(ClaimedJob { job, resumed }))
}
