//! Recovery of jobs whose runner died mid-execution.
//!
//! A runner that is killed, crashes or loses its host never writes a final
//! status, leaving its job at `RUNNING` forever. Any such job older than the
//! threshold is reset to `TIMEOUT`, which makes it selectable again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::params;
use sitewarden_core::config::MIN_STUCK_THRESHOLD_SECS;
use tracing::warn;

use crate::{
    db::{self, ts},
    error::Result,
    store::JobStore,
    types::{JobId, Status},
};

/// Reset every job stuck at `RUNNING` since before `now - threshold`.
///
/// Must run under the job-selection lock. The threshold is never allowed
/// below three minutes. Returns the ids that were reset.
pub fn reap_stuck(store: &JobStore, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<JobId>> {
    let threshold = threshold.max(Duration::from_secs(MIN_STUCK_THRESHOLD_SECS));
    let cutoff = now - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::days(365));

    let conn = db::lock(store.db())?;
    let mut stmt = conn.prepare(
        "UPDATE tasks
         SET last_exit_code = ?1, last_run_end = ?2, storage = '{}', updated_at = ?2
         WHERE last_exit_code = ?3
           AND (last_execution IS NULL OR last_execution < ?4)
         RETURNING id",
    )?;
    let reaped = stmt
        .query_map(
            params![
                Status::Timeout.code(),
                ts(now),
                Status::Running.code(),
                ts(cutoff),
            ],
            |row| row.get::<_, i64>(0).map(JobId),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for id in &reaped {
        warn!(job_id = %id, threshold_secs = threshold.as_secs(), "stuck job reset to timeout");
    }
    Ok(reaped)
}
