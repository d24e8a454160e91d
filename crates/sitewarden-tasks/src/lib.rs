//! `sitewarden-tasks` — the built-in job handlers and the system jobs every
//! installation schedules.

pub mod error;
pub mod heartbeat;
pub mod logrotate;
pub mod maxexec;
mod params;

use sitewarden_core::SitewardenConfig;
use sitewarden_scheduler::{Job, JobScope, JobStore, MapRegistry, NewJob, SettingsStore};
use tracing::info;

pub use error::{Result, TaskError};
pub use heartbeat::Heartbeat;
pub use logrotate::LogRotate;
pub use maxexec::MaxExec;

/// System jobs created by [`ensure_system_jobs`]: `(type, cron)`.
pub const SYSTEM_JOBS: &[(&str, &str)] = &[("logrotate", "@daily"), ("heartbeat", "*/5 * * * *")];

/// Registry with every built-in handler.
pub fn default_registry(config: &SitewardenConfig, settings: SettingsStore) -> MapRegistry {
    let mut registry = MapRegistry::new();
    registry
        .register("logrotate", LogRotate::new(&config.logs.directory))
        .register("maxexec", MaxExec::new(settings.clone()))
        .register("heartbeat", Heartbeat::new(settings));
    registry
}

/// Create any missing [`SYSTEM_JOBS`]. Returns the jobs that were created.
pub fn ensure_system_jobs(store: &JobStore) -> Result<Vec<Job>> {
    let mut created = Vec::new();
    for (job_type, cron) in SYSTEM_JOBS {
        if store.find(job_type, JobScope::System)?.is_some() {
            continue;
        }
        let job = store.create(&NewJob::system(*job_type, *cron))?;
        info!(job_id = %job.id, job_type, "system job created");
        created.push(job);
    }
    Ok(created)
}
