//! The runner loop: what each cron tick, CLI call or web trigger invokes.
//!
//! One invocation is a short-lived, sequential process. It repeatedly takes
//! the job-selection lock, reaps stuck jobs, claims the next eligible job,
//! drops the lock and executes the job, until it runs out of work, time
//! budget, or is paused. Any number of invocations may overlap; they
//! coordinate only through the database.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sitewarden_core::config::SchedulerConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dequeue,
    error::Result,
    executor::Executor,
    handler::{HandlerRegistry, OutputSink},
    lock::LockManager,
    reaper,
    settings::PauseFlag,
    store::JobStore,
    types::Status,
};

/// Timing knobs for a [`Runner`], normally derived from [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub max_execution: Duration,
    pub lock_timeout: Duration,
    pub lock_ttl: Duration,
    pub lock_jitter: Duration,
    pub stuck_threshold: Duration,
    pub idle_sleep: Duration,
    pub safety_margin: Duration,
}

impl RunnerOptions {
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self {
            max_execution: cfg.max_execution(),
            lock_timeout: cfg.lock_timeout(),
            lock_ttl: cfg.lock_ttl(),
            lock_jitter: Duration::from_millis(cfg.lock_jitter_ms),
            stuck_threshold: cfg.stuck_threshold(),
            idle_sleep: cfg.idle_sleep(),
            safety_margin: cfg.safety_margin(),
        }
    }
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Result of a single lock → reap → claim → execute cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A job was claimed and executed with this final status.
    Ran(Status),
    /// Nothing was eligible.
    Idle,
    /// The job-selection lock could not be taken in time.
    NoLock,
    /// A job was selected but the claim could not be written.
    ClaimFailed,
    /// The deadline passed before a job could be claimed.
    OutOfTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Idle,
    TimeBudget,
    Paused,
    NoLock,
    Shutdown,
}

/// What one runner invocation did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs_run: usize,
    /// Final status name → number of jobs that ended with it.
    pub by_status: BTreeMap<String, usize>,
    pub claim_failures: usize,
    pub stop_reason: StopReason,
}

impl RunSummary {
    fn record(&mut self, status: Status) {
        self.jobs_run += 1;
        *self.by_status.entry(status.as_str().to_string()).or_default() += 1;
    }
}

pub struct Runner {
    store: JobStore,
    executor: Executor,
    lock: LockManager,
    pause: Arc<dyn PauseFlag>,
    options: RunnerOptions,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(
        store: JobStore,
        registry: Arc<dyn HandlerRegistry>,
        pause: Arc<dyn PauseFlag>,
        options: RunnerOptions,
    ) -> Self {
        let executor = Executor::new(store.clone(), registry, options.max_execution);
        let lock = LockManager::job_selection(store.db().clone(), options.lock_ttl, options.lock_jitter);
        Self {
            store,
            executor,
            lock,
            pause,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop looping and abandon the running handler once `token` fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.executor = self.executor.with_shutdown(token.clone());
        self.shutdown = token;
        self
    }

    pub fn with_output(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.executor = self.executor.with_output(sink);
        self
    }

    /// Run jobs until idle (unless `loop_if_idle`), paused, out of budget,
    /// or unable to take the lock.
    ///
    /// Job failures never surface here; they are recorded on the job rows.
    /// Only a failure to read the pause flag is returned as an error.
    pub async fn run(&self, budget: Duration, loop_if_idle: bool) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            jobs_run: 0,
            by_status: BTreeMap::new(),
            claim_failures: 0,
            stop_reason: StopReason::Idle,
        };
        if let Err(e) = self.pause.record_heartbeat(summary.started_at) {
            warn!(error = %e, "failed to record runner heartbeat");
        }

        let remaining = || budget.saturating_sub(started.elapsed());
        let deadline = started + budget.saturating_sub(self.options.safety_margin);

        tokio::select! {
            _ = self.lock.stagger() => {}
            _ = self.shutdown.cancelled() => {}
        }

        let stop = loop {
            if self.shutdown.is_cancelled() {
                break StopReason::Shutdown;
            }
            if self.pause.is_paused()? {
                info!("task processing is paused");
                break StopReason::Paused;
            }
            if remaining() <= self.options.safety_margin {
                break StopReason::TimeBudget;
            }

            match self.run_cycle(deadline).await {
                CycleOutcome::Ran(status) => {
                    summary.record(status);
                    continue;
                }
                CycleOutcome::NoLock => break StopReason::NoLock,
                CycleOutcome::OutOfTime => break StopReason::TimeBudget,
                CycleOutcome::ClaimFailed => summary.claim_failures += 1,
                CycleOutcome::Idle => {}
            }

            if !loop_if_idle {
                break StopReason::Idle;
            }
            let left = remaining().saturating_sub(self.options.safety_margin);
            if left.is_zero() {
                break StopReason::TimeBudget;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.idle_sleep.min(left)) => {}
                _ = self.shutdown.cancelled() => break StopReason::Shutdown,
            }
        };

        summary.stop_reason = stop;
        summary.finished_at = Utc::now();
        info!(
            jobs_run = summary.jobs_run,
            stop_reason = ?stop,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "runner finished"
        );
        Ok(summary)
    }

    /// One lock → reap → claim → unlock → execute cycle.
    ///
    /// The lock covers only reaping and claiming, never the job itself.
    /// Nothing is claimed once `deadline` has passed, and a claimed job's
    /// handler is cut off at `deadline` if it would otherwise run longer.
    pub async fn run_cycle(&self, deadline: Instant) -> CycleOutcome {
        let left = || deadline.saturating_duration_since(Instant::now());

        let guard = match self.lock.lock(self.options.lock_timeout.min(left())).await {
            Ok(Some(guard)) => guard,
            Ok(None) if left().is_zero() => return CycleOutcome::OutOfTime,
            Ok(None) => return CycleOutcome::NoLock,
            Err(e) => {
                error!(error = %e, "failed to acquire job-selection lock");
                return CycleOutcome::NoLock;
            }
        };

        if left().is_zero() {
            if let Err(e) = guard.unlock() {
                warn!(error = %e, "failed to release job-selection lock; it will expire");
            }
            return CycleOutcome::OutOfTime;
        }

        let now = Utc::now();
        if let Err(e) = reaper::reap_stuck(&self.store, self.options.stuck_threshold, now) {
            error!(error = %e, "stuck-job reaper failed");
        }
        let claimed = dequeue::claim_next(&self.store, now);
        if let Err(e) = guard.unlock() {
            warn!(error = %e, "failed to release job-selection lock; it will expire");
        }

        match claimed {
            Ok(Some(job)) => CycleOutcome::Ran(self.executor.run_within(job, left()).await),
            Ok(None) => {
                debug!("no job due");
                CycleOutcome::Idle
            }
            Err(e) => {
                error!(error = %e, "failed to claim job");
                CycleOutcome::ClaimFailed
            }
        }
    }
}
