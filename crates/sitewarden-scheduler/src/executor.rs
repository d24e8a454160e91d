//! Execution engine: runs one claimed job and records its outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::{
    dequeue::ClaimedJob,
    error::SchedulerError,
    handler::{Handler, HandlerRegistry, HandlerResult, JobContext, OutputSink},
    run_once,
    store::JobStore,
    types::{Job, JobId, Status, Storage},
};

/// Runs claimed jobs through their registered handlers.
pub struct Executor {
    store: JobStore,
    registry: Arc<dyn HandlerRegistry>,
    max_execution: Duration,
    shutdown: CancellationToken,
    output: Option<Arc<dyn OutputSink>>,
}

enum Invocation {
    Returned(HandlerResult),
    Panicked(String),
    TimedOut,
    Cancelled,
}

impl Executor {
    pub fn new(store: JobStore, registry: Arc<dyn HandlerRegistry>, max_execution: Duration) -> Self {
        Self {
            store,
            registry,
            max_execution,
            shutdown: CancellationToken::new(),
            output: None,
        }
    }

    /// Cancelling `token` (e.g. on SIGTERM) abandons the running handler and
    /// records `TIMEOUT` for it.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_output(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.output = Some(sink);
        self
    }

    /// Run a claimed job to its next state and persist the result.
    ///
    /// Never fails: every outcome, including infrastructure trouble, is
    /// expressed as the returned [`Status`].
    pub async fn run(&self, claimed: ClaimedJob) -> Status {
        self.run_within(claimed, self.max_execution).await
    }

    /// Like [`run`](Self::run), but the handler is cut off after `limit`
    /// when that is shorter than the configured maximum execution time.
    pub async fn run_within(&self, claimed: ClaimedJob, limit: Duration) -> Status {
        let span = info_span!(
            "job",
            job_id = %claimed.job.id,
            job_type = %claimed.job.job_type,
            resumed = claimed.resumed,
        );
        let limit = limit.min(self.max_execution);
        self.execute(claimed, limit, span.clone()).instrument(span).await
    }

    async fn execute(&self, claimed: ClaimedJob, limit: Duration, span: Span) -> Status {
        let ClaimedJob { mut job, resumed } = claimed;

        let Some(handler) = self.registry.resolve(&job.job_type) else {
            warn!("no handler registered for job type");
            job.times_failed += 1;
            let status = self.finish(&mut job, Status::NoRoutine, Storage::new());
            self.apply_run_once(&job, status);
            return status;
        };

        let trap = TimeoutTrap::arm(&self.store, &job);
        if !resumed {
            job.times_executed += 1;
        }
        let mut storage = if resumed {
            std::mem::take(&mut job.storage)
        } else {
            Storage::new()
        };

        let started = Instant::now();
        let invocation = self
            .invoke(handler.as_ref(), &job, &mut storage, resumed, limit, span)
            .await;

        let (status, storage) = match invocation {
            Invocation::Returned(Ok(code)) => {
                let status = map_exit(code);
                if status != Status::Ok && status != Status::WillResume {
                    warn!(?code, %status, "handler returned an unusable exit code");
                }
                let storage = if status == Status::WillResume {
                    storage
                } else {
                    Storage::new()
                };
                (status, storage)
            }
            Invocation::Returned(Err(err)) => {
                error!(error = %err, "handler failed");
                (Status::Exception, error_summary(&err, &job.job_type))
            }
            Invocation::Panicked(message) => {
                error!(%message, "handler panicked");
                (Status::Exception, panic_summary(&message, &job.job_type))
            }
            Invocation::TimedOut => {
                warn!(limit_ms = limit.as_millis() as u64, "handler exceeded its time budget");
                (Status::Timeout, Storage::new())
            }
            Invocation::Cancelled => {
                warn!("runner shutting down; handler abandoned");
                (Status::Timeout, Storage::new())
            }
        };

        if status.counts_as_failure() {
            job.times_failed += 1;
        }
        let status = self.finish(&mut job, status, storage);
        trap.disarm();
        self.apply_run_once(&job, status);

        info!(%status, elapsed_ms = started.elapsed().as_millis() as u64, "job finished");
        status
    }

    async fn invoke(
        &self,
        handler: &dyn Handler,
        job: &Job,
        storage: &mut Storage,
        resumed: bool,
        limit: Duration,
        span: Span,
    ) -> Invocation {
        let mut ctx = JobContext {
            job,
            storage,
            resumed,
            span,
            output: self.output.as_deref(),
        };
        let call = AssertUnwindSafe(handler.run(&mut ctx)).catch_unwind();

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Invocation::Cancelled,
            res = tokio::time::timeout(limit, call) => match res {
                Err(_) => Invocation::TimedOut,
                Ok(Err(panic)) => Invocation::Panicked(panic_message(panic)),
                Ok(Ok(result)) => Invocation::Returned(result),
            },
        }
    }

    /// Record the outcome on `job` and persist it.
    ///
    /// Returns the status actually stored, which differs from `status` when
    /// the row could not be written.
    fn finish(&self, job: &mut Job, status: Status, storage: Storage) -> Status {
        let now = Utc::now();
        let claimed_next = job.next_execution;
        job.last_exit_code = status;
        job.storage = storage;
        job.last_run_end = Some(now);
        if status.is_terminal() {
            job.next_execution = match self.store.cron().next_after(&job.cron_expression, now) {
                Ok(next) => Some(next),
                Err(e) => {
                    error!(error = %e, "cannot compute next execution; job will not run again");
                    None
                }
            };
        }

        match self.store.save_result(job, claimed_next) {
            Ok(()) => status,
            Err(SchedulerError::JobNotFound { .. }) => {
                info!("job row removed while running; result discarded");
                Status::NoRun
            }
            Err(SchedulerError::ClaimLost { .. }) => {
                warn!(%status, "job was reaped while running; result discarded");
                Status::NoRelease
            }
            Err(e) => {
                error!(error = %e, %status, "failed to persist job result");
                if let Err(e) =
                    self.store
                        .force_status(job.id, job.last_execution, Status::NoRelease)
                {
                    error!(error = %e, "failed to record no_release");
                }
                Status::NoRelease
            }
        }
    }

    fn apply_run_once(&self, job: &Job, status: Status) {
        if matches!(status, Status::NoRelease | Status::NoRun) {
            return;
        }
        if let Err(e) = run_once::apply(&self.store, job, status) {
            error!(error = %e, "run-once policy failed");
        }
    }
}

/// Forces `TIMEOUT` onto the job if dropped while still armed: the future
/// running the job was dropped or the executor unwound mid-run.
struct TimeoutTrap<'a> {
    store: &'a JobStore,
    id: JobId,
    claimed_at: Option<DateTime<Utc>>,
    armed: bool,
}

impl<'a> TimeoutTrap<'a> {
    fn arm(store: &'a JobStore, job: &Job) -> Self {
        Self {
            store,
            id: job.id,
            claimed_at: job.last_execution,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TimeoutTrap<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(job_id = %self.id, "run abandoned mid-execution; recording timeout");
        if let Err(e) = self.store.force_status(self.id, self.claimed_at, Status::Timeout) {
            error!(job_id = %self.id, error = %e, "failed to record timeout");
        }
    }
}

/// Translate a handler's raw return value into a status.
fn map_exit(code: Option<i64>) -> Status {
    match code.map(Status::from_code) {
        None => Status::NoExit,
        Some(None | Some(Status::Running | Status::InitialSchedule)) => Status::InvalidExit,
        Some(Some(status)) => status,
    }
}

fn error_summary(err: &anyhow::Error, job_type: &str) -> Storage {
    let causes: Vec<Value> = err.chain().skip(1).map(|c| Value::from(c.to_string())).collect();
    let mut storage = Storage::new();
    storage.insert(
        "error".to_string(),
        json!({
            "message": err.to_string(),
            "origin": format!("handler:{job_type}"),
            "causes": causes,
            "trace": err.backtrace().to_string(),
        }),
    );
    storage
}

fn panic_summary(message: &str, job_type: &str) -> Storage {
    let mut storage = Storage::new();
    storage.insert(
        "error".to_string(),
        json!({
            "message": message,
            "origin": format!("handler:{job_type}"),
            "causes": [],
            "trace": "panic",
        }),
    );
    storage
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cron::CronEvaluator,
        db, dequeue,
        handler::MapRegistry,
        reaper,
        types::{NewJob, RunOnce},
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Returns(HandlerResultFn);
    type HandlerResultFn = fn() -> HandlerResult;

    #[async_trait]
    impl Handler for Returns {
        async fn run(&self, _ctx: &mut JobContext<'_>) -> HandlerResult {
            (self.0)()
        }
    }

    /// Resumes once with `cursor = 42`, then checks it got the cursor back.
    struct TwoStep;

    #[async_trait]
    impl Handler for TwoStep {
        async fn run(&self, ctx: &mut JobContext<'_>) -> HandlerResult {
            if !ctx.resumed {
                ctx.storage.insert("cursor".into(), json!(42));
                return Status::WillResume.exit();
            }
            anyhow::ensure!(ctx.storage.get("cursor") == Some(&json!(42)), "cursor lost");
            Status::Ok.exit()
        }
    }

    struct Sleeps(Duration);

    #[async_trait]
    impl Handler for Sleeps {
        async fn run(&self, _ctx: &mut JobContext<'_>) -> HandlerResult {
            tokio::time::sleep(self.0).await;
            Status::Ok.exit()
        }
    }

    struct Panics;

    #[async_trait]
    impl Handler for Panics {
        async fn run(&self, _ctx: &mut JobContext<'_>) -> HandlerResult {
            panic!("boom");
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for Counting {
        async fn run(&self, _ctx: &mut JobContext<'_>) -> HandlerResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Status::Ok.exit()
        }
    }

    fn registry() -> MapRegistry {
        let mut registry = MapRegistry::new();
        registry
            .register("ok", Returns(|| Status::Ok.exit()))
            .register("silent", Returns(|| Ok(None)))
            .register("bogus", Returns(|| Ok(Some(999))))
            .register("claims_running", Returns(|| Ok(Some(Status::Running.code()))))
            .register("fails", Returns(|| Err(anyhow::anyhow!("disk full").context("rotating logs"))))
            .register("two_step", TwoStep)
            .register("panics", Panics)
            .register("slow", Sleeps(Duration::from_secs(30)));
        registry
    }

    fn setup(registry: MapRegistry, max_execution: Duration) -> (JobStore, Executor) {
        let store = JobStore::new(db::open_in_memory().unwrap(), CronEvaluator::default());
        let executor = Executor::new(store.clone(), Arc::new(registry), max_execution);
        (store, executor)
    }

    fn due(store: &JobStore, new: NewJob) -> JobId {
        let job = store.create(&new).unwrap();
        store
            .reschedule(job.id, Utc::now() - chrono::Duration::minutes(1))
            .unwrap();
        job.id
    }

    fn claim(store: &JobStore) -> ClaimedJob {
        dequeue::claim_next(store, Utc::now()).unwrap().expect("a due job")
    }

    #[tokio::test]
    async fn ok_run_recomputes_next_execution() {
        let (store, exec) = setup(registry(), Duration::from_secs(5));
        let id = due(&store, NewJob::system("ok", "@daily"));

        let before = Utc::now();
        assert_eq!(exec.run(claim(&store)).await, Status::Ok);

        let job = store.require(id).unwrap();
        assert_eq!(job.last_exit_code, Status::Ok);
        assert_eq!(job.times_executed, 1);
        assert_eq!(job.times_failed, 0);
        assert!(job.storage.is_empty());
        assert!(job.last_run_end.unwrap() >= before);
        let next = job.next_execution.unwrap();
        assert_eq!(next, store.cron().next_after("@daily", job.last_run_end.unwrap()).unwrap());
    }

    #[tokio::test]
    async fn resumable_job_keeps_storage_between_steps() {
        let (store, exec) = setup(registry(), Duration::from_secs(5));
        let id = due(&store, NewJob::system("two_step", "@daily"));
        let due_at = store.require(id).unwrap().next_execution;

        assert_eq!(exec.run(claim(&store)).await, Status::WillResume);
        let job = store.require(id).unwrap();
        assert_eq!(job.last_exit_code, Status::WillResume);
        assert_eq!(job.storage["cursor"], json!(42));
        assert_eq!(job.times_executed, 1);
        assert_eq!(job.next_execution, due_at);

        let claimed = claim(&store);
        assert!(claimed.resumed);
        assert_eq!(exec.run(claimed).await, Status::Ok);
        let job = store.require(id).unwrap();
        assert_eq!(job.last_exit_code, Status::Ok);
        assert!(job.storage.is_empty());
        assert_eq!(job.times_executed, 1);
    }

    #[tokio::test]
    async fn handler_error_is_captured_in_storage() {
        let (store, exec) = setup(registry(), Duration::from_secs(5));
        let id = due(
            &store,
            NewJob::system("fails", "@daily").with_run_once(RunOnce::Delete),
        );

        assert_eq!(exec.run(claim(&store)).await, Status::Exception);
        let job = store.require(id).unwrap();
        assert_eq!(job.last_exit_code, Status::Exception);
        assert_eq!(job.times_failed, 1);
        assert_eq!(job.storage["error"]["message"], json!("rotating logs"));
        assert_eq!(job.storage["error"]["causes"], json!(["disk full"]));
        assert_eq!(job.storage["error"]["origin"], json!("handler:fails"));
        assert!(!job.enabled, "failed run-once job must be disabled");
    }

    #[tokio::test]
    async fn panic_is_an_exception() {
        let (store, exec) = setup(registry(), Duration::from_secs(5));
        let id = due(&store, NewJob::system("panics", "@daily"));

        assert_eq!(exec.run(claim(&store)).await, Status::Exception);
        let job = store.require(id).unwrap();
        assert_eq!(job.times_failed, 1);
        assert_eq!(job.storage["error"]["message"], json!("boom"));
        assert!(job.enabled);
    }

    #[tokio::test]
    async fn unknown_type_is_no_routine() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = MapRegistry::new();
        registry.register("counting", Counting(calls.clone()));
        let (store, exec) = setup(registry, Duration::from_secs(5));
        let id = due(
            &store,
            NewJob::system("filescanner", "@daily").with_run_once(RunOnce::Disable),
        );

        assert_eq!(exec.run(claim(&store)).await, Status::NoRoutine);
        let job = store.require(id).unwrap();
        assert_eq!(job.last_exit_code, Status::NoRoutine);
        assert_eq!(job.times_failed, 1);
        assert_eq!(job.times_executed, 0);
        assert!(!job.enabled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unusable_return_values_are_mapped() {
        let (store, exec) = setup(registry(), Duration::from_secs(5));
        for (job_type, expected) in [
            ("silent", Status::NoExit),
            ("bogus", Status::InvalidExit),
            ("claims_running", Status::InvalidExit),
        ] {
            let id = due(&store, NewJob::system(job_type, "@daily"));
            assert_eq!(exec.run(claim(&store)).await, expected, "{job_type}");
            let job = store.require(id).unwrap();
            assert_eq!(job.last_exit_code, expected);
            assert_eq!(job.times_failed, 0);
        }
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let (store, exec) = setup(registry(), Duration::from_millis(50));
        let id = due(&store, NewJob::system("slow", "@daily"));

        assert_eq!(exec.run(claim(&store)).await, Status::Timeout);
        let job = store.require(id).unwrap();
        assert_eq!(job.last_exit_code, Status::Timeout);
        assert!(job.next_execution.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn shutdown_signal_records_timeout() {
        let token = CancellationToken::new();
        let (store, exec) = setup(registry(), Duration::from_secs(60));
        let exec = exec.with_shutdown(token.clone());
        let id = due(&store, NewJob::system("slow", "@daily"));

        token.cancel();
        assert_eq!(exec.run(claim(&store)).await, Status::Timeout);
        assert_eq!(store.require(id).unwrap().last_exit_code, Status::Timeout);
    }

    #[tokio::test]
    async fn dropped_run_trips_the_timeout_trap() {
        let (store, exec) = setup(registry(), Duration::from_secs(60));
        let id = due(&store, NewJob::system("slow", "@daily"));

        let claimed = claim(&store);
        let outcome = tokio::time::timeout(Duration::from_millis(50), exec.run(claimed)).await;
        assert!(outcome.is_err());

        let job = store.require(id).unwrap();
        assert_eq!(job.last_exit_code, Status::Timeout);
        assert!(job.storage.is_empty());
    }

    #[tokio::test]
    async fn run_once_delete_removes_row_after_success() {
        let (store, exec) = setup(registry(), Duration::from_secs(5));
        let id = due(&store, NewJob::system("ok", "@daily").with_run_once(RunOnce::Delete));

        assert_eq!(exec.run(claim(&store)).await, Status::Ok);
        assert!(store.get(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn row_deleted_mid_run_is_no_run() {
        let (store, exec) = setup(registry(), Duration::from_secs(5));
        let id = due(&store, NewJob::system("ok", "@daily"));
        let claimed = claim(&store);
        store.delete(id).unwrap();

        assert_eq!(exec.run(claimed).await, Status::NoRun);
    }

    #[tokio::test]
    async fn run_within_cuts_the_handler_off_early() {
        let (store, exec) = setup(registry(), Duration::from_secs(60));
        let id = due(&store, NewJob::system("slow", "@daily"));

        let started = Instant::now();
        let status = exec.run_within(claim(&store), Duration::from_millis(50)).await;
        assert_eq!(status, Status::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(store.require(id).unwrap().last_exit_code, Status::Timeout);
    }

    #[tokio::test]
    async fn reaped_run_cannot_overwrite_a_newer_claim() {
        let (store, exec) = setup(registry(), Duration::from_secs(5));
        let id = due(&store, NewJob::system("ok", "@daily"));
        let stale = claim(&store);

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(
            reaper::reap_stuck(&store, Duration::from_secs(600), later).unwrap(),
            vec![id]
        );
        let current = dequeue::claim_next(&store, later).unwrap().expect("reclaimed");

        assert_eq!(exec.run(stale).await, Status::NoRelease);
        let row = store.require(id).unwrap();
        assert_eq!(row.last_exit_code, Status::Running);
        assert_eq!(row.last_execution.map(db::ts), Some(db::ts(later)));
        assert!(dequeue::claim_next(&store, later + chrono::Duration::hours(1))
            .unwrap()
            .is_none());

        assert_eq!(exec.run(current).await, Status::Ok);
        let row = store.require(id).unwrap();
        assert_eq!(row.last_exit_code, Status::Ok);
        assert_eq!(row.times_executed, 1);
    }

    #[tokio::test]
    async fn run_now_during_a_run_survives_the_reschedule() {
        let (store, exec) = setup(registry(), Duration::from_secs(5));
        let id = due(&store, NewJob::system("ok", "@daily"));
        let claimed = claim(&store);
        store.run_now(id).unwrap();

        assert_eq!(exec.run(claimed).await, Status::Ok);
        let job = store.require(id).unwrap();
        assert_eq!(job.last_exit_code, Status::Ok);
        assert!(job.next_execution.unwrap() <= Utc::now());
        assert_eq!(claim(&store).job.id, id);
    }

    #[test]
    fn exit_mapping() {
        assert_eq!(map_exit(None), Status::NoExit);
        assert_eq!(map_exit(Some(0)), Status::Ok);
        assert_eq!(map_exit(Some(1)), Status::WillResume);
        assert_eq!(map_exit(Some(-1)), Status::InvalidExit);
        assert_eq!(map_exit(Some(107)), Status::Timeout);
        assert_eq!(map_exit(Some(12345)), Status::InvalidExit);
    }
}
