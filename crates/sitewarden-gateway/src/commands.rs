//! CLI subcommands other than `serve`.
//!
//! Job failures are never reflected in the process exit code; they live on
//! the job rows and are visible through `list` and `status`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sitewarden_core::SiteId;
use sitewarden_scheduler::{Job, JobId, JobParams, NewJob, PauseFlag, StdoutSink};
use tracing::{error, info};

use crate::{app::AppState, cli::ScheduleArgs};

pub async fn run(
    state: &AppState,
    loop_if_idle: bool,
    time_limit: Option<u64>,
    verbose: bool,
) -> anyhow::Result<()> {
    let budget = time_limit
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.config.scheduler.time_budget());
    let mut runner = state.runner();
    if verbose {
        runner = runner.with_output(Arc::new(StdoutSink));
    }

    // A cron tick never fails; job outcomes live on the rows.
    let summary = match runner.run(budget, loop_if_idle).await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "task run aborted");
            return Ok(());
        }
    };
    if verbose {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

pub fn list(state: &AppState, site: Option<SiteId>) -> anyhow::Result<()> {
    let jobs = match site {
        Some(site) => state.store.list_for_site(site)?,
        None => state.store.list()?,
    };
    if jobs.is_empty() {
        println!("No tasks scheduled.");
        return Ok(());
    }

    println!(
        "{:>6}  {:<10}  {:<16}  {:<14}  {:>4}  {:<3}  {:<16}  {:<20}  {:>5}  {:>5}",
        "ID", "SCOPE", "TYPE", "CRON", "PRIO", "ON", "STATUS", "NEXT RUN", "RUNS", "FAILS"
    );
    for job in &jobs {
        println!("{}", format_row(job));
    }
    Ok(())
}

fn format_row(job: &Job) -> String {
    format!(
        "{:>6}  {:<10}  {:<16}  {:<14}  {:>4}  {:<3}  {:<16}  {:<20}  {:>5}  {:>5}",
        job.id,
        job.scope.to_string(),
        job.job_type,
        job.cron_expression,
        job.priority,
        if job.enabled { "yes" } else { "no" },
        job.last_exit_code.as_str(),
        format_ts(job.next_execution),
        job.times_executed,
        job.times_failed,
    )
}

fn format_ts(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn schedule(state: &AppState, args: ScheduleArgs) -> anyhow::Result<()> {
    let params = match args.params.as_deref() {
        Some(raw) => parse_params(raw)?,
        None => JobParams::new(),
    };
    let mut new = match args.site {
        Some(site) => NewJob::for_site(site, args.job_type, args.cron),
        None => NewJob::system(args.job_type, args.cron),
    }
    .with_params(params)
    .with_priority(args.priority);
    if let Some(action) = args.run_once {
        new = new.with_run_once(action);
    }

    let job = if args.now {
        state.store.schedule_now(&new)?
    } else {
        state.store.create(&new)?
    };
    println!(
        "Task {} ({}, {}) next runs at {}",
        job.id,
        job.job_type,
        job.scope,
        format_ts(job.next_execution)
    );
    Ok(())
}

fn parse_params(raw: &str) -> anyhow::Result<JobParams> {
    match serde_json::from_str::<Value>(raw).context("--params is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("--params must be a JSON object, got {other}"),
    }
}

pub fn set_enabled(state: &AppState, id: i64, enabled: bool) -> anyhow::Result<()> {
    state.store.set_enabled(JobId(id), enabled)?;
    println!("Task {id} {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

pub fn delete(state: &AppState, id: i64) -> anyhow::Result<()> {
    state.store.delete(JobId(id))?;
    println!("Task {id} deleted");
    Ok(())
}

pub fn run_now(state: &AppState, id: i64) -> anyhow::Result<()> {
    let job = state.store.run_now(JobId(id))?;
    println!("Task {} ({}) is due now", job.id, job.job_type);
    Ok(())
}

pub fn set_paused(state: &AppState, paused: bool) -> anyhow::Result<()> {
    state.settings.set_paused(paused)?;
    println!(
        "Task processing {}",
        if paused { "paused" } else { "resumed" }
    );
    Ok(())
}

pub fn status(state: &AppState) -> anyhow::Result<()> {
    let jobs = state.store.list()?;
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for job in &jobs {
        *counts.entry(job.last_exit_code.as_str()).or_default() += 1;
    }

    println!("Paused:      {}", state.settings.is_paused()?);
    println!("Last run:    {}", format_ts(state.settings.last_heartbeat()?));
    println!("Tasks:       {} ({} enabled)", jobs.len(), jobs.iter().filter(|j| j.enabled).count());
    for (status, n) in counts {
        println!("  {status:<16} {n}");
    }
    Ok(())
}

pub fn bootstrap(state: &AppState) -> anyhow::Result<()> {
    let created = sitewarden_tasks::ensure_system_jobs(&state.store)?;
    if created.is_empty() {
        println!("System tasks already present");
    }
    for job in &created {
        println!("Created system task {} ({})", job.id, job.job_type);
    }
    Ok(())
}

pub fn purge_site(state: &AppState, site: SiteId) -> anyhow::Result<()> {
    let n = state.store.delete_for_site(site)?;
    info!(site_id = %site, deleted = n, "site tasks purged");
    println!("Deleted {n} task(s) of site {site}");
    Ok(())
}
