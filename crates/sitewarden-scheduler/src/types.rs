use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sitewarden_core::SiteId;

/// Per-run configuration supplied when the job is scheduled.
pub type JobParams = Map<String, Value>;

/// Scratch space a handler keeps between resumed steps.
pub type Storage = Map<String, Value>;

/// Key in [`JobParams`] declaring the run-once action.
pub const RUN_ONCE_PARAM: &str = "run_once";

/// Primary key of a `tasks` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Exit code of the most recent run, and the scheduling signal derived
/// from it.
///
/// The integer codes are persisted in `tasks.last_exit_code`; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Never run; selectable once due.
    InitialSchedule,
    Ok,
    /// Handler asked to be invoked again with its storage intact.
    WillResume,
    /// Claimed by a runner. Only the reaper acts on it.
    Running,
    /// The claim could not be persisted.
    NoLock,
    /// The claimed row was deleted before its result could be recorded.
    NoRun,
    /// The final result could not be persisted.
    NoRelease,
    /// No handler is registered for the job type.
    NoRoutine,
    /// The handler returned nothing.
    NoExit,
    /// The handler returned a code that is not an exit status.
    InvalidExit,
    /// The handler failed with an error or panicked.
    Exception,
    /// The run exceeded its time budget or was abandoned.
    Timeout,
}

impl Status {
    pub const ALL: [Status; 12] = [
        Status::InitialSchedule,
        Status::Ok,
        Status::WillResume,
        Status::Running,
        Status::NoLock,
        Status::NoRun,
        Status::NoRelease,
        Status::NoRoutine,
        Status::NoExit,
        Status::InvalidExit,
        Status::Exception,
        Status::Timeout,
    ];

    pub fn code(self) -> i64 {
        match self {
            Status::InitialSchedule => -1,
            Status::Ok => 0,
            Status::WillResume => 1,
            Status::Running => 2,
            Status::NoLock => 100,
            Status::NoRun => 101,
            Status::NoRelease => 102,
            Status::NoRoutine => 103,
            Status::NoExit => 104,
            Status::InvalidExit => 105,
            Status::Exception => 106,
            Status::Timeout => 107,
        }
    }

    pub fn from_code(code: i64) -> Option<Status> {
        Status::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Terminal statuses end a run: `next_execution` is recomputed and
    /// `storage` is cleared.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            Status::InitialSchedule | Status::Running | Status::WillResume
        )
    }

    /// Outcomes caused by the handler misbehaving or failing.
    pub fn is_handler_failure(self) -> bool {
        matches!(
            self,
            Status::NoRoutine | Status::NoExit | Status::InvalidExit | Status::Exception
        )
    }

    /// Failures that count towards `times_failed`.
    pub fn counts_as_failure(self) -> bool {
        matches!(self, Status::NoRoutine | Status::Exception)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::InitialSchedule => "initial_schedule",
            Status::Ok => "ok",
            Status::WillResume => "will_resume",
            Status::Running => "running",
            Status::NoLock => "no_lock",
            Status::NoRun => "no_run",
            Status::NoRelease => "no_release",
            Status::NoRoutine => "no_routine",
            Status::NoExit => "no_exit",
            Status::InvalidExit => "invalid_exit",
            Status::Exception => "exception",
            Status::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Whether a job is global or bound to one monitored site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "site_id", rename_all = "snake_case")]
pub enum JobScope {
    System,
    Site(SiteId),
}

impl JobScope {
    pub fn site_id(self) -> Option<SiteId> {
        match self {
            JobScope::System => None,
            JobScope::Site(id) => Some(id),
        }
    }

    pub(crate) fn from_column(site_id: Option<i64>) -> Self {
        site_id.map_or(JobScope::System, |id| JobScope::Site(SiteId(id)))
    }

    pub(crate) fn to_column(self) -> Option<i64> {
        self.site_id().map(SiteId::get)
    }
}

impl std::fmt::Display for JobScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobScope::System => f.write_str("system"),
            JobScope::Site(id) => write!(f, "site:{id}"),
        }
    }
}

/// Post-run action for ad-hoc jobs, declared as `params.run_once`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOnce {
    Disable,
    Delete,
}

impl RunOnce {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOnce::Disable => "disable",
            RunOnce::Delete => "delete",
        }
    }

    /// Read the action from job params. Unknown values are ignored.
    pub fn from_params(params: &JobParams) -> Option<RunOnce> {
        match params.get(RUN_ONCE_PARAM)?.as_str()? {
            "disable" => Some(RunOnce::Disable),
            "delete" => Some(RunOnce::Delete),
            _ => None,
        }
    }
}

impl std::str::FromStr for RunOnce {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "disable" => Ok(RunOnce::Disable),
            "delete" => Ok(RunOnce::Delete),
            other => Err(format!("unknown run-once action: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub scope: JobScope,
    /// Registry key of the handler that executes this job.
    pub job_type: String,
    pub params: JobParams,
    pub storage: Storage,
    pub cron_expression: String,
    pub enabled: bool,
    /// Lower values are dequeued first.
    pub priority: i64,
    pub last_exit_code: Status,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_run_end: Option<DateTime<Utc>>,
    pub next_execution: Option<DateTime<Utc>>,
    pub times_executed: u64,
    pub times_failed: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn run_once(&self) -> Option<RunOnce> {
        RunOnce::from_params(&self.params)
    }
}

/// Everything needed to create a job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub scope: JobScope,
    pub job_type: String,
    pub cron_expression: String,
    pub params: JobParams,
    pub priority: i64,
    pub enabled: bool,
}

impl NewJob {
    pub fn system(job_type: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            scope: JobScope::System,
            job_type: job_type.into(),
            cron_expression: cron_expression.into(),
            params: JobParams::new(),
            priority: 0,
            enabled: true,
        }
    }

    pub fn for_site(
        site_id: SiteId,
        job_type: impl Into<String>,
        cron_expression: impl Into<String>,
    ) -> Self {
        Self {
            scope: JobScope::Site(site_id),
            ..Self::system(job_type, cron_expression)
        }
    }

    pub fn with_params(mut self, params: JobParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_run_once(mut self, action: RunOnce) -> Self {
        self.params
            .insert(RUN_ONCE_PARAM.to_string(), Value::from(action.as_str()));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_unique_and_round_trip() {
        for status in Status::ALL {
            assert_eq!(Status::from_code(status.code()), Some(status));
            assert_eq!(status.as_str().parse::<Status>(), Ok(status));
        }
        assert_eq!(Status::from_code(42), None);
    }

    #[test]
    fn running_and_resume_are_not_terminal() {
        assert!(!Status::Running.is_terminal());
        assert!(!Status::WillResume.is_terminal());
        assert!(Status::Ok.is_terminal());
        assert!(Status::Timeout.is_terminal());
    }

    #[test]
    fn run_once_is_read_from_params() {
        let job = NewJob::system("sendmail", "@daily").with_run_once(RunOnce::Delete);
        assert_eq!(RunOnce::from_params(&job.params), Some(RunOnce::Delete));

        let mut params = JobParams::new();
        params.insert(RUN_ONCE_PARAM.into(), Value::from("sometimes"));
        assert_eq!(RunOnce::from_params(&params), None);
    }

    #[test]
    fn scope_maps_to_nullable_site_column() {
        assert_eq!(JobScope::from_column(None), JobScope::System);
        assert_eq!(JobScope::from_column(Some(7)), JobScope::Site(SiteId(7)));
        assert_eq!(JobScope::Site(SiteId(7)).to_column(), Some(7));
        assert_eq!(JobScope::System.to_string(), "system");
    }
}
