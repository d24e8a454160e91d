//! `sitewarden-scheduler` — persistent background-job scheduler over SQLite.
//!
//! # Overview
//!
//! Jobs live in the `tasks` table. Each runner invocation (cron tick, CLI,
//! web trigger) is short-lived: the [`runner::Runner`] takes a database
//! advisory lock, resets stuck jobs, claims the next eligible job, releases
//! the lock and executes the job through its registered [`handler::Handler`].
//! All coordination between overlapping runners goes through the database.
//!
//! # Job lifecycle
//!
//! | `last_exit_code`   | Meaning                                        |
//! |--------------------|------------------------------------------------|
//! | `INITIAL_SCHEDULE` | Created, never run                             |
//! | `RUNNING`          | Claimed by a runner                            |
//! | `WILL_RESUME`      | Handler asked to continue on the next cycle    |
//! | `OK`               | Last run succeeded                             |
//! | anything else      | Last run failed; retried at the next cron time |

pub mod cron;
pub mod db;
pub mod dequeue;
pub mod error;
pub mod executor;
pub mod handler;
pub mod lock;
pub mod reaper;
pub mod run_once;
pub mod runner;
pub mod settings;
pub mod store;
pub mod types;

pub use cron::CronEvaluator;
pub use error::{Result, SchedulerError};
pub use executor::Executor;
pub use handler::{Handler, HandlerRegistry, HandlerResult, JobContext, MapRegistry, OutputSink, StdoutSink};
pub use runner::{Runner, RunnerOptions, RunSummary, StopReason};
pub use settings::{PauseFlag, SettingsStore};
pub use store::JobStore;
pub use types::{Job, JobId, JobParams, JobScope, NewJob, RunOnce, Status, Storage};
