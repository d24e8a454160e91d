use clap::{Args, Parser, Subcommand};
use sitewarden_core::SiteId;
use sitewarden_scheduler::RunOnce;

/// Sitewarden background task runner and job management.
#[derive(Parser, Debug)]
#[command(name = "sitewarden")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("SITEWARDEN_GIT_SHA"), ")"))]
#[command(about = "Background task scheduler for the Sitewarden site monitor", long_about = None)]
pub struct Cli {
    /// Configuration file (default: $SITEWARDEN_CONFIG, then ~/.sitewarden/sitewarden.toml)
    #[arg(long = "config", global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run due tasks; this is what the system cron invokes every minute
    Run {
        /// Keep polling for due tasks until the time budget runs out
        #[arg(long = "loop")]
        loop_if_idle: bool,

        /// Override the wall-clock budget
        #[arg(long = "time-limit", value_name = "SECONDS")]
        time_limit: Option<u64>,

        /// Print task progress to stdout
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },

    /// Serve the health and web-cron HTTP endpoints
    Serve,

    /// List scheduled tasks
    List {
        #[arg(long = "site")]
        site: Option<SiteId>,
    },

    /// Create or update a task
    Schedule(ScheduleArgs),

    /// Enable a task
    Enable { id: i64 },

    /// Disable a task without deleting it
    Disable { id: i64 },

    /// Delete a task
    Delete { id: i64 },

    /// Make a task due immediately
    RunNow { id: i64 },

    /// Stop all task processing
    Pause,

    /// Resume task processing
    Resume,

    /// Show pause state, last runner heartbeat and per-status counts
    Status,

    /// Create the built-in system tasks if missing
    Bootstrap,

    /// Delete every task of a site
    PurgeSite { site: SiteId },
}

#[derive(Args, Debug)]
pub struct ScheduleArgs {
    /// Handler type, e.g. `logrotate`
    #[arg(long = "type")]
    pub job_type: String,

    /// Cron expression (5 or 6 fields, or a macro such as @daily)
    #[arg(long = "cron")]
    pub cron: String,

    /// Bind the task to a site instead of the system scope
    #[arg(long = "site")]
    pub site: Option<SiteId>,

    /// Lower runs first
    #[arg(long = "priority", default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i64,

    /// Handler parameters as a JSON object
    #[arg(long = "params", value_name = "JSON")]
    pub params: Option<String>,

    /// Disable or delete the task after it completes
    #[arg(long = "run-once", value_name = "disable|delete")]
    pub run_once: Option<RunOnce>,

    /// Make the task due immediately, updating an existing task of the same
    /// type and scope instead of adding another
    #[arg(long = "now")]
    pub now: bool,
}
