use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use sitewarden_core::SiteId;
use tracing::{info, instrument, warn};

use crate::{
    cron::{self, CronEvaluator},
    db::{self, parse_ts, ts, Db},
    error::{Result, SchedulerError},
    types::{Job, JobId, JobParams, JobScope, NewJob, Status, Storage},
};

pub(crate) const JOB_COLUMNS: &str = "id, site_id, type, params, storage, cron_expression, enabled,
     priority, last_exit_code, last_execution, last_run_end, next_execution,
     times_executed, times_failed, created_at, updated_at";

/// CRUD over persisted `tasks` rows.
///
/// Cheap to clone: clones share the same connection.
#[derive(Clone)]
pub struct JobStore {
    db: Db,
    cron: CronEvaluator,
}

impl JobStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(db: Db, cron: CronEvaluator) -> Self {
        Self { db, cron }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn cron(&self) -> &CronEvaluator {
        &self.cron
    }

    /// Insert a job in `INITIAL_SCHEDULE` with its first `next_execution`
    /// computed from the cron expression.
    #[instrument(skip(self, new), fields(job_type = %new.job_type, scope = %new.scope))]
    pub fn create(&self, new: &NewJob) -> Result<Job> {
        let now = Utc::now();
        let next = self.cron.next_after(&new.cron_expression, now)?;
        let params_json = serde_json::to_string(&new.params)?;

        let id = {
            let conn = db::lock(&self.db)?;
            conn.execute(
                "INSERT INTO tasks
                 (site_id, type, params, storage, cron_expression, enabled, priority,
                  last_exit_code, next_execution, created_at, updated_at)
                 VALUES (?1, ?2, ?3, '{}', ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    new.scope.to_column(),
                    new.job_type,
                    params_json,
                    new.cron_expression,
                    new.enabled,
                    new.priority,
                    Status::InitialSchedule.code(),
                    ts(next),
                    ts(now),
                ],
            )?;
            JobId(conn.last_insert_rowid())
        };

        info!(job_id = %id, next_execution = %next, "job created");
        self.require(id)
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>> {
        let conn = db::lock(&self.db)?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM tasks WHERE id = ?1");
        Ok(conn.query_row(&sql, [id.0], row_to_job).optional()?)
    }

    /// Like [`get`](Self::get) but a missing row is an error.
    pub fn require(&self, id: JobId) -> Result<Job> {
        self.get(id)?.ok_or(SchedulerError::JobNotFound { id })
    }

    /// All jobs, system jobs first, then by site and id.
    pub fn list(&self) -> Result<Vec<Job>> {
        let conn = db::lock(&self.db)?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tasks ORDER BY site_id IS NOT NULL, site_id, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn list_for_site(&self, site_id: SiteId) -> Result<Vec<Job>> {
        let conn = db::lock(&self.db)?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM tasks WHERE site_id = ?1 ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map([site_id.get()], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Find the job of `job_type` in `scope`, if one exists.
    pub fn find(&self, job_type: &str, scope: JobScope) -> Result<Option<Job>> {
        let conn = db::lock(&self.db)?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tasks
             WHERE type = ?1 AND site_id IS ?2
             ORDER BY id LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![job_type, scope.to_column()], row_to_job)
            .optional()?)
    }

    #[instrument(skip(self))]
    pub fn set_enabled(&self, id: JobId, enabled: bool) -> Result<()> {
        let conn = db::lock(&self.db)?;
        let n = conn.execute(
            "UPDATE tasks SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled, ts(Utc::now()), id.0],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id });
        }
        info!(job_id = %id, enabled, "job enabled flag changed");
        Ok(())
    }

    /// Remove a job by ID. Returns `JobNotFound` if no row is deleted.
    #[instrument(skip(self))]
    pub fn delete(&self, id: JobId) -> Result<()> {
        let conn = db::lock(&self.db)?;
        let n = conn.execute("DELETE FROM tasks WHERE id = ?1", [id.0])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id });
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Cascade for a removed site: drop every job bound to it.
    #[instrument(skip(self))]
    pub fn delete_for_site(&self, site_id: SiteId) -> Result<usize> {
        let conn = db::lock(&self.db)?;
        let n = conn.execute("DELETE FROM tasks WHERE site_id = ?1", [site_id.get()])?;
        info!(site_id = %site_id, count = n, "site jobs deleted");
        Ok(n)
    }

    /// Move `next_execution` to `at` without consulting the cron expression.
    pub fn reschedule(&self, id: JobId, at: DateTime<Utc>) -> Result<()> {
        let conn = db::lock(&self.db)?;
        let n = conn.execute(
            "UPDATE tasks SET next_execution = ?1, updated_at = ?2 WHERE id = ?3",
            params![ts(at), ts(Utc::now()), id.0],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id });
        }
        Ok(())
    }

    /// Make an existing job due immediately (and enable it).
    ///
    /// The cron expression is not consulted, so the immediate run is not
    /// overwritten; the schedule resumes after that run completes.
    #[instrument(skip(self))]
    pub fn run_now(&self, id: JobId) -> Result<Job> {
        let now = Utc::now();
        {
            let conn = db::lock(&self.db)?;
            let n = conn.execute(
                "UPDATE tasks SET next_execution = ?1, enabled = 1, updated_at = ?1
                 WHERE id = ?2",
                params![ts(now), id.0],
            )?;
            if n == 0 {
                return Err(SchedulerError::JobNotFound { id });
            }
        }
        info!(job_id = %id, "job scheduled to run immediately");
        self.require(id)
    }

    /// Insert or update the `(type, scope)` job so that it is due now.
    ///
    /// Used for ad-hoc work such as "refresh this site now": an existing row
    /// is re-pointed at the new params/cron instead of duplicated.
    #[instrument(skip(self, new), fields(job_type = %new.job_type, scope = %new.scope))]
    pub fn schedule_now(&self, new: &NewJob) -> Result<Job> {
        cron::validate(&new.cron_expression)?;
        let id = match self.find(&new.job_type, new.scope)? {
            Some(existing) => {
                let conn = db::lock(&self.db)?;
                conn.execute(
                    "UPDATE tasks SET params = ?1, cron_expression = ?2, priority = ?3,
                            updated_at = ?4
                     WHERE id = ?5",
                    params![
                        serde_json::to_string(&new.params)?,
                        new.cron_expression,
                        new.priority,
                        ts(Utc::now()),
                        existing.id.0,
                    ],
                )?;
                existing.id
            }
            None => self.create(new)?.id,
        };
        self.run_now(id)
    }

    /// Persist the outcome of a run: status, storage, counters and timing.
    ///
    /// The write only lands while the row still carries this run's claim
    /// (`RUNNING` with the claim's `last_execution`). `claimed_next` is the
    /// `next_execution` observed at claim time; if someone moved it while
    /// the job ran (run-now), their value is kept instead of `job`'s.
    pub(crate) fn save_result(&self, job: &Job, claimed_next: Option<DateTime<Utc>>) -> Result<()> {
        let conn = db::lock(&self.db)?;
        let n = conn.execute(
            "UPDATE tasks SET last_exit_code = ?1, storage = ?2, last_run_end = ?3,
                    next_execution = CASE WHEN next_execution IS ?4 THEN ?5
                                          ELSE next_execution END,
                    times_executed = ?6, times_failed = ?7, updated_at = ?8
             WHERE id = ?9 AND last_exit_code = ?10 AND last_execution IS ?11",
            params![
                job.last_exit_code.code(),
                serde_json::to_string(&job.storage)?,
                job.last_run_end.map(ts),
                claimed_next.map(ts),
                job.next_execution.map(ts),
                job.times_executed as i64,
                job.times_failed as i64,
                ts(Utc::now()),
                job.id.0,
                Status::Running.code(),
                job.last_execution.map(ts),
            ],
        )?;
        if n > 0 {
            return Ok(());
        }
        let exists = conn
            .query_row("SELECT 1 FROM tasks WHERE id = ?1", [job.id.0], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            Err(SchedulerError::ClaimLost { id: job.id })
        } else {
            Err(SchedulerError::JobNotFound { id: job.id })
        }
    }

    /// Last-resort status write used when a run's outcome cannot be saved
    /// in full, or when a run is abandoned. Like
    /// [`save_result`](Self::save_result) it only touches the row while the
    /// claim started at `claimed_at` still holds it.
    pub(crate) fn force_status(
        &self,
        id: JobId,
        claimed_at: Option<DateTime<Utc>>,
        status: Status,
    ) -> Result<()> {
        let now = ts(Utc::now());
        let conn = db::lock(&self.db)?;
        let n = conn.execute(
            "UPDATE tasks SET last_exit_code = ?1, storage = '{}', last_run_end = ?2,
                    updated_at = ?2
             WHERE id = ?3 AND last_exit_code = ?4 AND last_execution IS ?5",
            params![
                status.code(),
                now,
                id.0,
                Status::Running.code(),
                claimed_at.map(ts),
            ],
        )?;
        if n == 0 {
            warn!(job_id = %id, %status, "job no longer held by this run; status not forced");
        }
        Ok(())
    }
}

/// Map a `JOB_COLUMNS` row to a [`Job`].
pub(crate) fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let params: JobParams = json_column(row, 3)?;
    let storage: Storage = json_column(row, 4)?;
    let code: i64 = row.get(8)?;
    // An unknown code can only come from a newer schema; treat it like a
    // failed run so the job stays schedulable.
    let last_exit_code = Status::from_code(code).unwrap_or(Status::InvalidExit);

    Ok(Job {
        id: JobId(row.get(0)?),
        scope: JobScope::from_column(row.get(1)?),
        job_type: row.get(2)?,
        params,
        storage,
        cron_expression: row.get(5)?,
        enabled: row.get(6)?,
        priority: row.get(7)?,
        last_exit_code,
        last_execution: ts_column(row, 9)?,
        last_run_end: ts_column(row, 10)?,
        next_execution: ts_column(row, 11)?,
        times_executed: row.get::<_, i64>(12)?.max(0) as u64,
        times_failed: row.get::<_, i64>(13)?.max(0) as u64,
        created_at: ts_column(row, 14)?.unwrap_or_default(),
        updated_at: ts_column(row, 15)?.unwrap_or_default(),
    })
}

fn json_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Map<String, serde_json::Value>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<String>>(idx)?.as_deref().and_then(parse_ts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunOnce;
    use serde_json::json;

    fn store() -> JobStore {
        JobStore::new(db::open_in_memory().unwrap(), CronEvaluator::default())
    }

    #[test]
    fn create_starts_in_initial_schedule_with_next_execution() {
        let store = store();
        let before = Utc::now();
        let job = store.create(&NewJob::system("logrotate", "@daily")).unwrap();

        assert_eq!(job.last_exit_code, Status::InitialSchedule);
        assert!(job.enabled);
        assert!(job.storage.is_empty());
        assert_eq!(job.times_executed, 0);
        let next = job.next_execution.expect("next_execution set");
        assert!(next > before);
        assert!(next <= before + chrono::Duration::hours(24));
    }

    #[test]
    fn create_rejects_invalid_cron() {
        let store = store();
        let err = store.create(&NewJob::system("logrotate", "every tuesday")).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn params_round_trip_through_json_column() {
        let store = store();
        let mut params = JobParams::new();
        params.insert("template".into(), json!("welcome"));
        let job = store
            .create(
                &NewJob::for_site(SiteId(3), "sendmail", "*/5 * * * *")
                    .with_params(params)
                    .with_run_once(RunOnce::Delete),
            )
            .unwrap();

        let loaded = store.require(job.id).unwrap();
        assert_eq!(loaded.scope, JobScope::Site(SiteId(3)));
        assert_eq!(loaded.params["template"], json!("welcome"));
        assert_eq!(loaded.run_once(), Some(RunOnce::Delete));
    }

    #[test]
    fn find_distinguishes_system_and_site_scope() {
        let store = store();
        let sys = store.create(&NewJob::system("refreshsiteinfo", "@hourly")).unwrap();
        let site = store
            .create(&NewJob::for_site(SiteId(9), "refreshsiteinfo", "@hourly"))
            .unwrap();

        assert_eq!(
            store.find("refreshsiteinfo", JobScope::System).unwrap().map(|j| j.id),
            Some(sys.id)
        );
        assert_eq!(
            store
                .find("refreshsiteinfo", JobScope::Site(SiteId(9)))
                .unwrap()
                .map(|j| j.id),
            Some(site.id)
        );
        assert!(store.find("refreshsiteinfo", JobScope::Site(SiteId(1))).unwrap().is_none());
    }

    #[test]
    fn delete_for_site_cascades_only_that_site() {
        let store = store();
        store.create(&NewJob::for_site(SiteId(1), "a", "@daily")).unwrap();
        store.create(&NewJob::for_site(SiteId(1), "b", "@daily")).unwrap();
        store.create(&NewJob::for_site(SiteId(2), "a", "@daily")).unwrap();
        store.create(&NewJob::system("a", "@daily")).unwrap();

        assert_eq!(store.delete_for_site(SiteId(1)).unwrap(), 2);
        assert_eq!(store.list().unwrap().len(), 2);
        assert!(store.list_for_site(SiteId(1)).unwrap().is_empty());
    }

    #[test]
    fn missing_rows_are_reported() {
        let store = store();
        assert!(matches!(
            store.delete(JobId(99)),
            Err(SchedulerError::JobNotFound { .. })
        ));
        assert!(matches!(
            store.set_enabled(JobId(99), false),
            Err(SchedulerError::JobNotFound { .. })
        ));
        assert!(store.get(JobId(99)).unwrap().is_none());
    }

    #[test]
    fn run_now_makes_job_due_and_enabled() {
        let store = store();
        let job = store
            .create(&NewJob::system("logrotate", "@yearly").disabled())
            .unwrap();
        assert!(!job.enabled);

        let job = store.run_now(job.id).unwrap();
        assert!(job.enabled);
        assert!(job.next_execution.unwrap() <= Utc::now());
    }

    #[test]
    fn schedule_now_updates_existing_row() {
        let store = store();
        let first = store.create(&NewJob::for_site(SiteId(4), "joomlaupdate", "@weekly")).unwrap();

        let mut params = JobParams::new();
        params.insert("force".into(), json!(true));
        let again = store
            .schedule_now(
                &NewJob::for_site(SiteId(4), "joomlaupdate", "@weekly").with_params(params),
            )
            .unwrap();

        assert_eq!(again.id, first.id);
        assert_eq!(again.params["force"], json!(true));
        assert!(again.next_execution.unwrap() <= Utc::now());
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
